//! Which annotations the user has selected and which list they are looking at.

use std::collections::BTreeSet;

use margin_proto::AnnotationId;

/// Sidebar list filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tab {
	#[default]
	Annotation,
	Note,
	Orphan,
}

#[derive(Debug, Default)]
pub struct Selection {
	selected: BTreeSet<AnnotationId>,
	tab: Tab,
	focus_request: Option<AnnotationId>,
}

impl Selection {
	/// Replaces the selection.
	pub(crate) fn select(&mut self, ids: impl IntoIterator<Item = AnnotationId>) {
		self.selected = ids.into_iter().collect();
	}

	/// Adds ids that are not selected and removes those that are.
	pub(crate) fn toggle(&mut self, ids: impl IntoIterator<Item = AnnotationId>) {
		for id in ids {
			if !self.selected.remove(&id) {
				self.selected.insert(id);
			}
		}
	}

	pub(crate) fn deselect(&mut self, ids: &[AnnotationId]) {
		for id in ids {
			self.selected.remove(id);
		}
		if self.focus_request.as_ref().is_some_and(|f| ids.contains(f)) {
			self.focus_request = None;
		}
	}

	pub(crate) fn clear(&mut self) {
		self.selected.clear();
		self.focus_request = None;
	}

	pub(crate) fn select_tab(&mut self, tab: Tab) {
		self.tab = tab;
	}

	pub(crate) fn request_focus(&mut self, id: Option<AnnotationId>) {
		self.focus_request = id;
	}

	pub fn selected(&self) -> &BTreeSet<AnnotationId> {
		&self.selected
	}

	pub fn tab(&self) -> Tab {
		self.tab
	}

	pub fn focus_request(&self) -> Option<&AnnotationId> {
		self.focus_request.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn toggle_flips_membership() {
		let mut selection = Selection::default();
		selection.select([AnnotationId::new("a")]);
		selection.toggle([AnnotationId::new("a"), AnnotationId::new("b")]);
		assert_eq!(selection.selected(), &BTreeSet::from([AnnotationId::new("b")]));
	}

	#[test]
	fn deselect_drops_focus_request() {
		let mut selection = Selection::default();
		selection.select([AnnotationId::new("a")]);
		selection.request_focus(Some(AnnotationId::new("a")));
		selection.deselect(&[AnnotationId::new("a")]);
		assert!(selection.selected().is_empty());
		assert_eq!(selection.focus_request(), None);
	}
}
