//! Live guest links and what each of them has been sent.
//!
//! # Lifecycle
//!
//! ```text
//! attach ──> Connected ──describe──> Described ──disconnect──> (removed)
//!                                        │
//!                                        └─ persistent ──> Retained ──attach──> Connected
//! ```
//!
//! A retained entry keeps its document description and the annotations it was sent. When a
//! guest with the same frame id attaches and describes the same URI, those annotations are
//! resent straight from the entry. At most [`MAX_RETAINED`] entries are kept; retaining another
//! evicts the one retained longest ago.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use margin_proto::events::{GuestToSidebar, SidebarToGuest};
use margin_proto::{DocumentInfo, FormattedAnnotation, FrameId, Tag};
use margin_rpc::Channel;

use super::routing::RouteFrame;
use crate::store::FrameInfo;

pub type GuestChannel = Channel<SidebarToGuest, GuestToSidebar>;

pub const MAX_RETAINED: usize = 16;

/// Where a guest is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
	/// Linked, document not described yet.
	Connected,
	Described,
	/// Link gone, descriptor kept for a returning persistent guest.
	Retained,
}

/// Introspection view of one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
	pub id: FrameId,
	pub state: GuestState,
	pub uri: Option<String>,
	pub loaded: Vec<Tag>,
}

/// Result of attaching a guest link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
	New,
	/// A live link with the same frame id was torn down.
	Replaced,
	/// A retained entry was picked up again.
	Resumed,
}

/// Result of a guest describing its document.
#[derive(Debug, Clone, PartialEq)]
pub enum Described {
	/// First description on this link.
	Fresh,
	/// A resumed persistent guest reported the retained URI. Carries what it had loaded.
	Rebound(Vec<FormattedAnnotation>),
	/// A guest already described navigated.
	Changed,
}

/// Result of a guest link going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
	/// Kept for a returning guest. Carries the retained frame dropped to make room, if any.
	Retained { evicted: Option<FrameId> },
	Removed,
}

#[derive(Debug)]
struct GuestEntry {
	generation: u64,
	channel: Option<GuestChannel>,
	info: Option<DocumentInfo>,
	state: GuestState,
	loaded: BTreeMap<Tag, FormattedAnnotation>,
}

#[derive(Debug, Default)]
pub struct Registry {
	entries: IndexMap<FrameId, GuestEntry>,
}

impl Registry {
	pub fn attach(&mut self, id: FrameId, generation: u64, channel: GuestChannel) -> Attach {
		if let Some(entry) = self.entries.get_mut(&id) {
			if entry.state == GuestState::Retained {
				entry.generation = generation;
				entry.channel = Some(channel);
				entry.state = GuestState::Connected;
				return Attach::Resumed;
			}
			if let Some(old) = entry.channel.take() {
				old.destroy();
			}
		}
		let replaced = self
			.entries
			.insert(
				id,
				GuestEntry {
					generation,
					channel: Some(channel),
					info: None,
					state: GuestState::Connected,
					loaded: BTreeMap::new(),
				},
			)
			.is_some();
		if replaced { Attach::Replaced } else { Attach::New }
	}

	/// True if events tagged with `generation` come from the current link for `id`.
	pub fn is_current(&self, id: &FrameId, generation: u64) -> bool {
		self.entries
			.get(id)
			.is_some_and(|entry| entry.generation == generation && entry.channel.is_some())
	}

	pub fn describe(&mut self, id: &FrameId, info: DocumentInfo) -> Option<Described> {
		let entry = self.entries.get_mut(id)?;
		let outcome = match (entry.state, &entry.info) {
			(GuestState::Connected, Some(retained)) if retained.uri == info.uri => {
				Described::Rebound(entry.loaded.values().cloned().collect())
			}
			(GuestState::Connected, _) => {
				entry.loaded.clear();
				Described::Fresh
			}
			_ => Described::Changed,
		};
		entry.info = Some(info);
		entry.state = GuestState::Described;
		Some(outcome)
	}

	/// Drops the link for `id`. Persistent guests are retained, others removed.
	pub fn disconnect(&mut self, id: &FrameId, generation: u64) -> Option<Disconnect> {
		if !self.is_current(id, generation) {
			return None;
		}
		let mut entry = self.entries.shift_remove(id)?;
		if let Some(channel) = entry.channel.take() {
			channel.destroy();
		}
		if !entry.info.as_ref().is_some_and(|info| info.persistent) {
			return Some(Disconnect::Removed);
		}
		entry.state = GuestState::Retained;
		let evicted = self.oldest_retained_if_full();
		self.entries.insert(id.clone(), entry);
		Some(Disconnect::Retained { evicted })
	}

	/// Forgets the longest-retained entry when no room is left for another.
	fn oldest_retained_if_full(&mut self) -> Option<FrameId> {
		let mut retained = self.entries.iter().filter(|(_, entry)| entry.state == GuestState::Retained);
		let oldest = retained.next().map(|(id, _)| id.clone())?;
		if retained.count() + 1 < MAX_RETAINED {
			return None;
		}
		self.entries.shift_remove(&oldest);
		Some(oldest)
	}

	pub fn channel(&self, id: &FrameId) -> Option<&GuestChannel> {
		self.entries.get(id)?.channel.as_ref()
	}

	/// Every live link, described or not.
	pub fn channels(&self) -> impl Iterator<Item = (&FrameId, &GuestChannel)> {
		self.entries
			.iter()
			.filter_map(|(id, entry)| entry.channel.as_ref().map(|channel| (id, channel)))
	}

	/// Live described frames, in attach order, with what each has loaded.
	pub fn routable(&self) -> (Vec<RouteFrame>, Vec<&BTreeMap<Tag, FormattedAnnotation>>) {
		self.entries
			.iter()
			.filter(|(_, entry)| entry.state == GuestState::Described && entry.channel.is_some())
			.filter_map(|(id, entry)| {
				let info = entry.info.clone()?;
				let frame = FrameInfo::new(id.clone(), info);
				let route = RouteFrame {
					id: id.clone(),
					search_uris: frame.search_uris(),
					segment: frame.segment,
				};
				Some((route, &entry.loaded))
			})
			.unzip()
	}

	pub fn mark_loaded(&mut self, id: &FrameId, annotations: impl IntoIterator<Item = FormattedAnnotation>) {
		let Some(entry) = self.entries.get_mut(id) else {
			return;
		};
		for annotation in annotations {
			if let Some(tag) = annotation.tag.clone() {
				entry.loaded.insert(tag, annotation);
			}
		}
	}

	pub fn mark_unloaded(&mut self, id: &FrameId, tags: &[Tag]) {
		if let Some(entry) = self.entries.get_mut(id) {
			for tag in tags {
				entry.loaded.remove(tag);
			}
		}
	}

	/// Follows a tag change so the frame is not told to unload and reload the same annotation.
	pub fn rename(&mut self, from: &Tag, to: &Tag) {
		for entry in self.entries.values_mut() {
			if let Some(mut annotation) = entry.loaded.remove(from) {
				annotation.tag = Some(to.clone());
				entry.loaded.insert(to.clone(), annotation);
			}
		}
	}

	pub fn snapshot(&self) -> Vec<FrameSnapshot> {
		self.entries
			.iter()
			.map(|(id, entry)| FrameSnapshot {
				id: id.clone(),
				state: entry.state,
				uri: entry.info.as_ref().map(|info| info.uri.clone()),
				loaded: entry.loaded.keys().cloned().collect(),
			})
			.collect()
	}

	/// Destroys every link and forgets all entries.
	pub fn clear(&mut self) {
		for (_, entry) in self.entries.drain(..) {
			if let Some(channel) = entry.channel {
				channel.destroy();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn info(uri: &str, persistent: bool) -> DocumentInfo {
		DocumentInfo {
			uri: uri.into(),
			persistent,
			..DocumentInfo::default()
		}
	}

	fn loaded(tag: &str) -> FormattedAnnotation {
		FormattedAnnotation {
			tag: Some(Tag::new(tag)),
			cluster: None,
			target: Vec::new(),
			uri: Some("http://b/ch1".into()),
		}
	}

	#[tokio::test(flavor = "current_thread")]
	async fn persistent_guest_is_rebound() {
		let mut registry = Registry::default();
		let book = FrameId::named("book");
		registry.attach(book.clone(), 1, GuestChannel::new().0);
		assert_eq!(registry.describe(&book, info("http://b/ch1", true)), Some(Described::Fresh));
		registry.mark_loaded(&book, [loaded("t1")]);

		assert_eq!(registry.disconnect(&book, 1), Some(Disconnect::Retained { evicted: None }));
		assert_eq!(registry.snapshot()[0].state, GuestState::Retained);
		assert!(registry.routable().0.is_empty());

		assert_eq!(registry.attach(book.clone(), 2, GuestChannel::new().0), Attach::Resumed);
		assert!(!registry.is_current(&book, 1));
		assert_eq!(
			registry.describe(&book, info("http://b/ch1", true)),
			Some(Described::Rebound(vec![loaded("t1")]))
		);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn returning_guest_on_other_uri_starts_fresh() {
		let mut registry = Registry::default();
		let book = FrameId::named("book");
		registry.attach(book.clone(), 1, GuestChannel::new().0);
		registry.describe(&book, info("http://b/ch1", true));
		registry.mark_loaded(&book, [loaded("t1")]);
		registry.disconnect(&book, 1);

		registry.attach(book.clone(), 2, GuestChannel::new().0);
		assert_eq!(registry.describe(&book, info("http://b/ch2", true)), Some(Described::Fresh));
		assert!(registry.snapshot()[0].loaded.is_empty());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn transient_guest_is_removed_and_stale_links_ignored() {
		let mut registry = Registry::default();
		let frame = FrameId::named("f");
		registry.attach(frame.clone(), 1, GuestChannel::new().0);
		assert_eq!(registry.attach(frame.clone(), 2, GuestChannel::new().0), Attach::Replaced);
		registry.describe(&frame, info("http://x/1", false));

		assert_eq!(registry.disconnect(&frame, 1), None);
		assert_eq!(registry.disconnect(&frame, 2), Some(Disconnect::Removed));
		assert!(registry.snapshot().is_empty());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn retained_entries_are_capped() {
		let mut registry = Registry::default();
		let frames: Vec<FrameId> = (0..=MAX_RETAINED).map(|n| FrameId::named(format!("book{n}"))).collect();
		for frame in &frames {
			registry.attach(frame.clone(), 1, GuestChannel::new().0);
			registry.describe(frame, info("http://b/ch1", true));
		}
		// A live guest does not count against the cap.
		registry.attach(FrameId::main(), 1, GuestChannel::new().0);

		for frame in &frames[..MAX_RETAINED] {
			assert_eq!(registry.disconnect(frame, 1), Some(Disconnect::Retained { evicted: None }));
		}
		assert_eq!(
			registry.disconnect(&frames[MAX_RETAINED], 1),
			Some(Disconnect::Retained { evicted: Some(frames[0].clone()) })
		);

		let snapshot = registry.snapshot();
		let retained = snapshot.iter().filter(|s| s.state == GuestState::Retained).count();
		assert_eq!(retained, MAX_RETAINED);
		assert!(snapshot.iter().all(|s| s.id != frames[0]));
		assert!(registry.channel(&FrameId::main()).is_some());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn rename_follows_restamped_tags() {
		let mut registry = Registry::default();
		let frame = FrameId::main();
		registry.attach(frame.clone(), 1, GuestChannel::new().0);
		registry.describe(&frame, info("http://x/1", false));
		registry.mark_loaded(&frame, [loaded("t1")]);
		registry.rename(&Tag::new("t1"), &Tag::new("g1"));
		assert_eq!(registry.snapshot()[0].loaded, vec![Tag::new("g1")]);
		assert_eq!(registry.routable().1[0][&Tag::new("g1")].tag, Some(Tag::new("g1")));
	}
}
