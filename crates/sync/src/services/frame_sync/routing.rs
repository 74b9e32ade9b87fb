//! Decides which annotations each guest frame should have loaded.
//!
//! Pure functions over a snapshot of the collection and the routable frames; the caller owns the
//! per-frame record of what was actually sent.

use std::collections::BTreeMap;

use margin_proto::cfi::annotation_matches_segment;
use margin_proto::{Annotation, FormattedAnnotation, FrameId, SegmentInfo, Tag};

/// A described guest frame as the router sees it.
#[derive(Debug, Clone)]
pub struct RouteFrame {
	pub id: FrameId,
	pub search_uris: Vec<String>,
	pub segment: Option<SegmentInfo>,
}

/// Changes to send to one frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameDiff {
	pub load: Vec<FormattedAnnotation>,
	pub unload: Vec<Tag>,
}

impl FrameDiff {
	pub fn is_empty(&self) -> bool {
		self.load.is_empty() && self.unload.is_empty()
	}
}

/// Frames whose document the annotation belongs to, ignoring segments.
///
/// Every frame listing the annotation's URI among its search URIs qualifies. Without any such
/// frame the annotation falls back to the main frame, or to the only frame when exactly one is
/// connected.
pub fn candidate_frames(annotation: &Annotation, frames: &[RouteFrame]) -> Vec<usize> {
	let matching: Vec<usize> = match annotation.uri.as_deref() {
		Some(uri) => frames
			.iter()
			.enumerate()
			.filter(|(_, f)| f.search_uris.iter().any(|u| u == uri))
			.map(|(i, _)| i)
			.collect(),
		None => Vec::new(),
	};
	if !matching.is_empty() {
		return matching;
	}
	if let Some(main) = frames.iter().position(|f| f.id.is_main()) {
		return vec![main];
	}
	if frames.len() == 1 { vec![0] } else { Vec::new() }
}

/// Frames that should have the annotation loaded right now.
///
/// Frames showing one segment of a larger document only get annotations inside that segment.
pub fn frames_for(annotation: &Annotation, frames: &[RouteFrame]) -> Vec<usize> {
	candidate_frames(annotation, frames)
		.into_iter()
		.filter(|&i| {
			frames[i]
				.segment
				.as_ref()
				.is_none_or(|segment| annotation_matches_segment(annotation, segment))
		})
		.collect()
}

/// Computes what each frame is missing and what it holds but should not.
///
/// `loaded[i]` is what frame `i` currently has. Replies are never routed: guests only anchor
/// top-level annotations.
pub fn plan(annotations: &[Annotation], frames: &[RouteFrame], loaded: &[&BTreeMap<Tag, FormattedAnnotation>]) -> Vec<FrameDiff> {
	let mut desired: Vec<BTreeMap<&Tag, &Annotation>> = vec![BTreeMap::new(); frames.len()];
	for annotation in annotations.iter().filter(|a| !a.is_reply()) {
		let Some(tag) = &annotation.tag else {
			continue;
		};
		for i in frames_for(annotation, frames) {
			desired[i].insert(tag, annotation);
		}
	}

	desired
		.iter()
		.zip(loaded)
		.map(|(want, have)| FrameDiff {
			load: want
				.iter()
				.filter(|(tag, _)| !have.contains_key(**tag))
				.map(|(_, annotation)| annotation.format())
				.collect(),
			unload: have.keys().filter(|tag| !want.contains_key(tag)).cloned().collect(),
		})
		.collect()
}

/// Number of top-level annotations readable by everyone.
pub fn public_count(annotations: &[Annotation]) -> usize {
	annotations.iter().filter(|a| !a.is_reply() && a.is_public()).count()
}
