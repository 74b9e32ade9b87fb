//! Unsaved edits, keyed by the tag of the annotation being edited.

use std::collections::BTreeMap;

use margin_proto::Tag;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
	pub text: String,
	pub tags: Vec<String>,
	pub is_private: bool,
}

impl Draft {
	pub fn is_empty(&self) -> bool {
		self.text.trim().is_empty() && self.tags.is_empty()
	}
}

#[derive(Debug, Default)]
pub struct Drafts {
	drafts: BTreeMap<Tag, Draft>,
}

impl Drafts {
	pub(crate) fn create(&mut self, tag: Tag, draft: Draft) {
		self.drafts.insert(tag, draft);
	}

	pub(crate) fn remove(&mut self, tag: &Tag) -> Option<Draft> {
		self.drafts.remove(tag)
	}

	/// Tags whose draft is empty.
	pub(crate) fn empty_tags(&self) -> Vec<Tag> {
		self.drafts.iter().filter(|(_, d)| d.is_empty()).map(|(t, _)| t.clone()).collect()
	}

	pub fn get(&self, tag: &Tag) -> Option<&Draft> {
		self.drafts.get(tag)
	}

	pub fn len(&self) -> usize {
		self.drafts.len()
	}

	pub fn is_empty(&self) -> bool {
		self.drafts.is_empty()
	}
}
