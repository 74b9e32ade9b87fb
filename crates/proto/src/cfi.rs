//! EPUB Canonical Fragment Identifier helpers and the chapter match rule.
//!
//! Only the part of a CFI up to the first step indirection (`!`) is considered anywhere in this
//! module. That prefix identifies a content document (a chapter) within the package.

use std::cmp::Ordering;

use crate::types::{Annotation, SegmentInfo};

/// Removes `[...]` assertions from a CFI, honoring `^` escapes.
pub fn strip_assertions(cfi: &str) -> String {
	if !cfi.contains('[') {
		return cfi.to_string();
	}

	let mut out = String::with_capacity(cfi.len());
	let mut escaped = false;
	let mut in_assertion = false;
	for ch in cfi.chars() {
		if !escaped && ch == '^' {
			escaped = true;
			continue;
		}
		if !escaped && ch == '[' {
			in_assertion = true;
		} else if !escaped && in_assertion && ch == ']' {
			in_assertion = false;
		} else if !in_assertion {
			out.push(ch);
		}
		escaped = false;
	}
	out
}

/// Returns the content-document part of a CFI: assertions stripped, cut at the first `!`.
pub fn document_cfi(cfi: &str) -> String {
	let mut stripped = strip_assertions(cfi);
	if let Some(idx) = stripped.find('!') {
		stripped.truncate(idx);
	}
	stripped
}

#[derive(Debug, PartialEq, Eq)]
enum Step<'a> {
	Index(u64),
	Other(&'a str),
}

impl PartialOrd for Step<'_> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Step<'_> {
	/// Indices sort before non-numeric steps.
	fn cmp(&self, other: &Self) -> Ordering {
		match (self, other) {
			(Step::Index(a), Step::Index(b)) => a.cmp(b),
			(Step::Other(a), Step::Other(b)) => a.cmp(b),
			(Step::Index(_), Step::Other(_)) => Ordering::Less,
			(Step::Other(_), Step::Index(_)) => Ordering::Greater,
		}
	}
}

fn parse_step(step: &str) -> Step<'_> {
	let digits = step.bytes().take_while(u8::is_ascii_digit).count();
	match step[..digits].parse() {
		Ok(n) => Step::Index(n),
		Err(_) => Step::Other(step),
	}
}

/// Orders two CFIs by their content-document paths.
///
/// Steps compare numerically; a path that is a prefix of another sorts first.
pub fn compare(a: &str, b: &str) -> Ordering {
	let a = document_cfi(a);
	let b = document_cfi(b);
	a.split('/').map(parse_step).cmp(b.split('/').map(parse_step))
}

/// True if `cfi` lies in the half-open range `[start, end)`.
pub fn in_range(cfi: &str, start: &str, end: &str) -> bool {
	compare(cfi, start) != Ordering::Less && compare(cfi, end) == Ordering::Less
}

/// Decides whether an annotation belongs to the segment currently loaded in a guest.
///
/// Annotations without an EPUB content selector match every segment. Otherwise the CFI is
/// compared when both sides carry one, falling back to the chapter URL.
pub fn annotation_matches_segment(ann: &Annotation, segment: &SegmentInfo) -> bool {
	let Some(selector) = ann.epub_content_selector() else {
		return true;
	};

	if let (Some(ann_cfi), Some(seg_cfi)) = (selector.field("cfi"), segment.cfi.as_deref()) {
		return document_cfi(ann_cfi) == document_cfi(seg_cfi);
	}
	if let (Some(ann_url), Some(seg_url)) = (selector.field("url"), segment.url.as_deref()) {
		return ann_url == seg_url;
	}
	false
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::types::{Selector, Target};

	#[test]
	fn strips_assertions_and_escapes() {
		assert_eq!(strip_assertions("/6/14[chap05ref]"), "/6/14");
		assert_eq!(strip_assertions("/6/14[a^]b]/2"), "/6/14/2");
		assert_eq!(strip_assertions("/2/4"), "/2/4");
	}

	#[test]
	fn document_part_stops_at_indirection() {
		assert_eq!(document_cfi("/6/152[;vnd.vst.idref=ch13_01]!/4/2[ch13_sec_1]"), "/6/152");
		assert_eq!(document_cfi("/2/4"), "/2/4");
	}

	#[test]
	fn numeric_step_ordering() {
		assert_eq!(compare("/2/3[chap3ref]", "/2/10[chap10ref]"), Ordering::Less);
		assert_eq!(compare("/2/10", "/2/3"), Ordering::Greater);
		assert_eq!(compare("/2/4!/6", "/2/4!/2"), Ordering::Equal);
		assert_eq!(compare("/2", "/2/4"), Ordering::Less);
		assert_eq!(compare("/2/4", "/2/x"), Ordering::Less);
	}

	#[test]
	fn range_is_half_open() {
		assert!(in_range("/2/4", "/2/4", "/2/6"));
		assert!(in_range("/2/5!/1", "/2/4", "/2/6"));
		assert!(!in_range("/2/6", "/2/4", "/2/6"));
		assert!(!in_range("/2/2", "/2/4", "/2/6"));
	}

	fn chapter_annotation(cfi: Option<&str>, url: Option<&str>) -> Annotation {
		let mut selector = json!({"type": "EPUBContentSelector"});
		if let Some(cfi) = cfi {
			selector["cfi"] = json!(cfi);
		}
		if let Some(url) = url {
			selector["url"] = json!(url);
		}
		Annotation {
			target: Some(vec![Target::with_selectors("http://b", vec![Selector(selector)])]),
			..Annotation::default()
		}
	}

	#[test]
	fn segment_match_prefers_cfi() {
		let seg = SegmentInfo {
			cfi: Some("/6/2[ch1]".into()),
			url: Some("/ch2.xhtml".into()),
		};
		assert!(annotation_matches_segment(
			&chapter_annotation(Some("/6/2!/4/1"), Some("/other.xhtml")),
			&seg
		));
		assert!(!annotation_matches_segment(
			&chapter_annotation(Some("/6/4"), Some("/ch2.xhtml")),
			&seg
		));
	}

	#[test]
	fn segment_match_falls_back_to_url() {
		let seg = SegmentInfo {
			cfi: None,
			url: Some("/ch1.xhtml".into()),
		};
		assert!(annotation_matches_segment(&chapter_annotation(Some("/6/2"), Some("/ch1.xhtml")), &seg));
		assert!(!annotation_matches_segment(&chapter_annotation(None, Some("/ch2.xhtml")), &seg));
		assert!(!annotation_matches_segment(&chapter_annotation(None, None), &seg));
	}

	#[test]
	fn annotations_without_chapter_selector_match_everywhere() {
		let seg = SegmentInfo::default();
		assert!(annotation_matches_segment(&Annotation::default(), &seg));
	}
}
