//! Server changes received over the push stream but not yet applied.

use indexmap::{IndexMap, IndexSet};
use margin_proto::{Annotation, AnnotationId};

#[derive(Debug, Default)]
pub struct RealTimeUpdates {
	updates: IndexMap<AnnotationId, Annotation>,
	deletions: IndexSet<AnnotationId>,
}

/// What an incoming batch is checked against.
pub(crate) struct ReceiveContext<'a> {
	/// Group whose changes are accepted. `None` accepts every group.
	pub group_filter: Option<&'a str>,
	pub is_known: &'a dyn Fn(&AnnotationId) -> bool,
}

impl RealTimeUpdates {
	/// Records received changes.
	///
	/// Updates outside the accepted group are dropped. A deletion discards any buffered update
	/// for the same id and is only kept if the annotation is loaded locally.
	pub(crate) fn receive(&mut self, updated: Vec<Annotation>, deleted: Vec<AnnotationId>, cx: &ReceiveContext<'_>) {
		for record in updated {
			let Some(id) = record.id.clone() else {
				continue;
			};
			if let Some(group) = cx.group_filter
				&& record.group.as_deref() != Some(group)
			{
				continue;
			}
			self.updates.insert(id, record);
		}
		for id in deleted {
			self.updates.shift_remove(&id);
			if (cx.is_known)(&id) {
				self.deletions.insert(id);
			}
		}
	}

	/// Takes everything buffered, leaving both sets empty.
	pub(crate) fn take(&mut self) -> (Vec<Annotation>, Vec<AnnotationId>) {
		let updates = std::mem::take(&mut self.updates).into_values().collect();
		let deletions = std::mem::take(&mut self.deletions).into_iter().collect();
		(updates, deletions)
	}

	/// Forgets buffered updates for records that were just (re)loaded.
	pub(crate) fn discard_updates(&mut self, ids: &[AnnotationId]) {
		for id in ids {
			self.updates.shift_remove(id);
		}
	}

	/// Forgets everything buffered for records that were just removed.
	pub(crate) fn discard(&mut self, ids: &[AnnotationId]) {
		for id in ids {
			self.updates.shift_remove(id);
			self.deletions.shift_remove(id);
		}
	}

	pub(crate) fn clear(&mut self) {
		self.updates.clear();
		self.deletions.clear();
	}

	pub fn pending_updates(&self) -> impl Iterator<Item = &Annotation> {
		self.updates.values()
	}

	pub fn pending_deletions(&self) -> impl Iterator<Item = &AnnotationId> {
		self.deletions.iter()
	}

	pub fn pending_update_count(&self) -> usize {
		self.updates.len() + self.deletions.len()
	}

	pub fn has_pending_deletion(&self, id: &AnnotationId) -> bool {
		self.deletions.contains(id)
	}
}
