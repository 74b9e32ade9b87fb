//! Coalesces guest anchoring reports into single store mutations.
//!
//! Guests report anchoring once per annotation, often dozens within a few milliseconds of a
//! document load. Reports are buffered until the debounce window passes without a new one and
//! then applied in one [`StoreHandle::update`].
//!
//! The coalescer also holds requests that could not be served because their annotation had not
//! anchored yet. Each parked request is handed back exactly once, on the first flush that
//! reports its annotation, and a newer request of the same kind replaces an older one.

use std::time::Duration;

use indexmap::IndexMap;
use margin_proto::{AnnotationId, Tag};
use margin_worker::Debounce;

use crate::store::{AnchorOutcome, AnchorReport, StoreHandle};

/// Default window over which reports are batched.
pub const ANCHORING_DEBOUNCE: Duration = Duration::from_millis(10);

/// How a parked request finds its annotation again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParkedKey {
	/// Saved annotations are followed by id, since guests may re-tag them.
	Id(AnnotationId),
	Tag(Tag),
}

impl ParkedKey {
	fn matches(&self, outcome: &AnchorOutcome) -> bool {
		match self {
			Self::Id(id) => outcome.id.as_ref() == Some(id),
			Self::Tag(tag) => &outcome.tag == tag || outcome.previous_tag.as_ref() == Some(tag),
		}
	}
}

/// A parked request due for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
	/// Scroll to the annotation, now known under this tag.
	Scroll(Tag),
	Hover(Vec<Tag>),
}

#[derive(Debug)]
pub struct AnchoringCoalescer {
	pending: IndexMap<Tag, AnchorReport>,
	debounce: Debounce,
	scroll: Option<ParkedKey>,
	hover: Option<(ParkedKey, Vec<Tag>)>,
}

impl AnchoringCoalescer {
	pub fn new(window: Duration) -> Self {
		Self {
			pending: IndexMap::new(),
			debounce: Debounce::new(window),
			scroll: None,
			hover: None,
		}
	}

	/// Buffers a report. A later report for the same tag replaces an earlier one.
	pub fn report(&mut self, report: AnchorReport) {
		self.pending.insert(report.tag.clone(), report);
		self.debounce.touch();
	}

	pub fn is_armed(&self) -> bool {
		self.debounce.is_armed()
	}

	/// Resolves once the debounce window has passed. Cancel safe.
	pub async fn ready(&mut self) {
		self.debounce.fired().await;
	}

	pub fn park_scroll(&mut self, key: ParkedKey) {
		self.scroll = Some(key);
	}

	pub fn park_hover(&mut self, key: ParkedKey, tags: Vec<Tag>) {
		self.hover = Some((key, tags));
	}

	/// Drops a parked hover, e.g. because the user hovered something else.
	pub fn unpark_hover(&mut self) {
		self.hover = None;
	}

	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}

	/// Applies buffered reports and returns the outcomes along with parked requests now due.
	pub fn flush(&mut self, store: &StoreHandle) -> (Vec<AnchorOutcome>, Vec<Replay>) {
		self.debounce.cancel();
		if self.pending.is_empty() {
			return (Vec::new(), Vec::new());
		}
		let reports: Vec<AnchorReport> = self.pending.drain(..).map(|(_, report)| report).collect();
		let outcomes = store.update(|s| s.apply_anchor_reports(&reports));
		tracing::trace!(reports = reports.len(), matched = outcomes.len(), "anchoring.flush");

		self.follow_renames(&outcomes);

		let mut replays = Vec::new();
		if let Some(outcome) = self
			.scroll
			.as_ref()
			.and_then(|key| outcomes.iter().find(|o| key.matches(o)))
		{
			replays.push(Replay::Scroll(outcome.tag.clone()));
			self.scroll = None;
		}
		if self
			.hover
			.as_ref()
			.is_some_and(|(key, _)| outcomes.iter().any(|o| key.matches(o)))
			&& let Some((_, tags)) = self.hover.take()
		{
			replays.push(Replay::Hover(tags));
		}
		(outcomes, replays)
	}

	/// Rewrites the tags held by a parked hover to the ones guests now use.
	fn follow_renames(&mut self, outcomes: &[AnchorOutcome]) {
		let Some((key, tags)) = &mut self.hover else {
			return;
		};
		for outcome in outcomes {
			let Some(previous) = &outcome.previous_tag else {
				continue;
			};
			for tag in tags.iter_mut().filter(|tag| *tag == previous) {
				*tag = outcome.tag.clone();
			}
			if let ParkedKey::Tag(tag) = key
				&& tag == previous
			{
				*tag = outcome.tag.clone();
			}
		}
	}
}
