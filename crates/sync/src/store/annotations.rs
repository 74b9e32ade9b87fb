//! The annotation collection: every record the sidebar knows about, keyed by tag.
//!
//! # Invariants
//!
//! - Every stored record carries a tag, and no two records share one.
//! - Tags are minted from a counter that never goes backwards, so a removed tag is never handed
//!   out again during the session.
//! - Merging never clears a field: only fields present on the incoming record overwrite.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use margin_proto::{Annotation, AnnotationId, Cluster, Tag};

/// Anchoring outcome for one annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorStatus {
	Anchored,
	Orphan,
	/// No guest reported in time.
	Timeout,
}

/// Anchoring report forwarded from a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorReport {
	/// Server id, when the guest knows it.
	pub id: Option<AnnotationId>,
	/// Tag the guest used for the annotation.
	pub tag: Tag,
	pub orphan: bool,
}

/// Record matched by an [`AnchorReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorOutcome {
	/// Tag after the report was applied.
	pub tag: Tag,
	pub id: Option<AnnotationId>,
	/// Tag the record carried before it adopted the guest's tag.
	pub previous_tag: Option<Tag>,
}

/// Per-kind record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
	pub annotations: usize,
	pub notes: usize,
	pub orphans: usize,
}

#[derive(Debug, Default)]
pub struct Annotations {
	records: Vec<Annotation>,
	next_tag: u64,
	hovered: BTreeSet<Tag>,
	highlighted: BTreeSet<AnnotationId>,
}

impl Annotations {
	/// Merges `incoming` into the collection and returns the tags of every touched record.
	///
	/// A record matches an existing one by id first, then by tag. Unmatched records are
	/// initialized: a tag is minted unless the record brings its own, unsaved records start
	/// non-orphan, and the display cluster is derived from `current_user`.
	pub(crate) fn add(&mut self, incoming: Vec<Annotation>, current_user: Option<&str>, now: DateTime<Utc>) -> Vec<Tag> {
		let mut touched = Vec::with_capacity(incoming.len());
		for mut record in incoming {
			let existing = record
				.id
				.as_ref()
				.and_then(|id| self.position_by_id(id))
				.or_else(|| record.tag.as_ref().and_then(|tag| self.position_by_tag(tag)));

			let index = match existing {
				Some(index) => {
					if let Some(tag) = &record.tag
						&& self.position_by_tag(tag).is_some_and(|other| other != index)
					{
						tracing::warn!(%tag, "ignoring tag already used by another annotation");
						record.tag = None;
					}
					self.records[index].merge_from(record);
					index
				}
				None => {
					let tag = match record.tag.take() {
						Some(tag) => tag,
						None => self.mint_tag(),
					};
					self.records.push(initialize(record, tag, current_user));
					self.records.len() - 1
				}
			};

			let stored = &mut self.records[index];
			if stored.is_new() {
				stored.created.get_or_insert(now);
				stored.updated.get_or_insert(now);
			}
			if let Some(tag) = &stored.tag {
				touched.push(tag.clone());
			}
		}
		touched
	}

	fn mint_tag(&mut self) -> Tag {
		loop {
			let tag = Tag::new(format!("t{}", self.next_tag));
			self.next_tag += 1;
			if self.position_by_tag(&tag).is_none() {
				return tag;
			}
		}
	}

	/// Removes records matching any of `stubs` by id or tag. Returns the removed records.
	pub(crate) fn remove(&mut self, stubs: &[Annotation]) -> Vec<Annotation> {
		let ids: BTreeSet<&AnnotationId> = stubs.iter().filter_map(|s| s.id.as_ref()).collect();
		let tags: BTreeSet<&Tag> = stubs.iter().filter_map(|s| s.tag.as_ref()).collect();
		let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records).into_iter().partition(|r| {
			r.id.as_ref().is_some_and(|id| ids.contains(id)) || r.tag.as_ref().is_some_and(|tag| tags.contains(tag))
		});
		self.records = kept;
		for record in &removed {
			if let Some(tag) = &record.tag {
				self.hovered.remove(tag);
			}
			if let Some(id) = &record.id {
				self.highlighted.remove(id);
			}
		}
		removed
	}

	/// Applies a batch of anchoring outcomes keyed by tag.
	pub(crate) fn update_anchor_status(&mut self, statuses: &BTreeMap<Tag, AnchorStatus>) {
		for record in &mut self.records {
			let Some(status) = record.tag.as_ref().and_then(|tag| statuses.get(tag)) else {
				continue;
			};
			match status {
				AnchorStatus::Timeout => {
					record.orphan = Some(true);
					record.anchor_timeout = Some(true);
				}
				AnchorStatus::Anchored => record.orphan = Some(false),
				AnchorStatus::Orphan => record.orphan = Some(true),
			}
		}
	}

	/// Applies guest anchoring reports.
	///
	/// A report matches by id when it has one, otherwise by tag. When matched by id and the
	/// guest used a different tag, the record takes the guest's tag unless another record
	/// already holds it.
	pub(crate) fn apply_reports(&mut self, reports: &[AnchorReport]) -> Vec<AnchorOutcome> {
		let mut outcomes = Vec::with_capacity(reports.len());
		for report in reports {
			let by_id = report.id.as_ref().and_then(|id| self.position_by_id(id));
			let Some(index) = by_id.or_else(|| self.position_by_tag(&report.tag)) else {
				tracing::debug!(tag = %report.tag, "anchoring report for unknown annotation");
				continue;
			};
			let mut previous_tag = None;
			if by_id.is_some() && self.records[index].tag.as_ref() != Some(&report.tag) {
				match self.position_by_tag(&report.tag) {
					Some(other) if other != index => {
						tracing::warn!(tag = %report.tag, "not re-stamping tag held by another annotation");
					}
					_ => previous_tag = self.records[index].tag.replace(report.tag.clone()),
				}
			}
			let record = &mut self.records[index];
			record.orphan = Some(report.orphan);
			if let Some(tag) = &record.tag {
				outcomes.push(AnchorOutcome {
					tag: tag.clone(),
					id: record.id.clone(),
					previous_tag,
				});
			}
		}
		outcomes
	}

	pub(crate) fn clear(&mut self) {
		self.records.clear();
		self.hovered.clear();
		self.highlighted.clear();
	}

	pub(crate) fn hover(&mut self, tags: impl IntoIterator<Item = Tag>) {
		self.hovered = tags.into_iter().collect();
	}

	/// Adds `ids` to the highlighted set. Earlier highlights stay until they are unhighlighted.
	pub(crate) fn highlight(&mut self, ids: impl IntoIterator<Item = AnnotationId>) {
		self.highlighted.extend(ids);
	}

	/// Drops `ids` from the highlighted set, leaving other highlights in place.
	pub(crate) fn unhighlight(&mut self, ids: &[AnnotationId]) {
		for id in ids {
			self.highlighted.remove(id);
		}
	}

	/// Sets the moderation flag. Returns false for unknown ids.
	pub(crate) fn set_hidden(&mut self, id: &AnnotationId, hidden: bool) -> bool {
		match self.position_by_id(id) {
			Some(index) => {
				self.records[index].hidden = Some(hidden);
				true
			}
			None => false,
		}
	}

	fn position_by_id(&self, id: &AnnotationId) -> Option<usize> {
		self.records.iter().position(|r| r.id.as_ref() == Some(id))
	}

	fn position_by_tag(&self, tag: &Tag) -> Option<usize> {
		self.records.iter().position(|r| r.tag.as_ref() == Some(tag))
	}

	pub fn all(&self) -> &[Annotation] {
		&self.records
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn exists(&self, id: &AnnotationId) -> bool {
		self.position_by_id(id).is_some()
	}

	pub fn find_by_id(&self, id: &AnnotationId) -> Option<&Annotation> {
		self.position_by_id(id).map(|i| &self.records[i])
	}

	pub fn find_by_tag(&self, tag: &Tag) -> Option<&Annotation> {
		self.position_by_tag(tag).map(|i| &self.records[i])
	}

	/// Ids of saved records carrying any of `tags`, in collection order.
	pub fn find_ids_for_tags(&self, tags: &[Tag]) -> Vec<AnnotationId> {
		self.records
			.iter()
			.filter(|r| r.tag.as_ref().is_some_and(|t| tags.contains(t)))
			.filter_map(|r| r.id.clone())
			.collect()
	}

	pub fn saved(&self) -> impl Iterator<Item = &Annotation> {
		self.records.iter().filter(|r| !r.is_new())
	}

	/// Unsaved annotations and notes, excluding highlights.
	pub fn new_annotations(&self) -> Vec<&Annotation> {
		self.records.iter().filter(|r| r.is_new() && !r.is_highlight()).collect()
	}

	pub fn new_highlights(&self) -> Vec<&Annotation> {
		self.records.iter().filter(|r| r.is_new() && r.is_highlight()).collect()
	}

	/// Counts top-level records. Orphans are only counted among anchorable annotations.
	pub fn counts(&self) -> Counts {
		let mut counts = Counts::default();
		for record in self.records.iter().filter(|r| !r.is_reply()) {
			if record.is_page_note() {
				counts.notes += 1;
			} else if record.orphan == Some(true) {
				counts.orphans += 1;
			} else {
				counts.annotations += 1;
			}
		}
		counts
	}

	/// True while some saved annotation still waits for a guest to anchor it.
	pub fn any_waiting_to_anchor(&self) -> bool {
		self.records.iter().any(is_waiting_to_anchor)
	}

	pub fn hovered(&self) -> &BTreeSet<Tag> {
		&self.hovered
	}

	pub fn highlighted(&self) -> &BTreeSet<AnnotationId> {
		&self.highlighted
	}
}

/// A saved annotation with a selector that has neither anchored nor timed out.
pub fn is_waiting_to_anchor(record: &Annotation) -> bool {
	!record.is_new() && record.has_selector() && record.orphan.is_none() && record.anchor_timeout != Some(true)
}

fn initialize(mut record: Annotation, tag: Tag, current_user: Option<&str>) -> Annotation {
	if record.is_new() {
		record.orphan = Some(false);
	}
	record.anchor_timeout = Some(false);
	let own = current_user.is_some() && record.user.as_deref() == current_user;
	record.cluster = Some(match (own, record.is_highlight()) {
		(true, true) => Cluster::UserHighlights,
		(true, false) => Cluster::UserAnnotations,
		(false, _) => Cluster::OtherContent,
	});
	record.tag = Some(tag);
	record
}
