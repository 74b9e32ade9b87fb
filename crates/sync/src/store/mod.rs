//! Sidebar-owned application state.
//!
//! # Purpose
//!
//! [`Store`] aggregates everything the sidebar knows: the annotation collection, connected frame
//! descriptors, buffered push-stream changes, selection, session and drafts. Mutations that
//! affect several parts at once (removing an annotation deselects it and forgets buffered
//! changes for it) live on [`Store`] so no caller can apply half of them.
//!
//! # Mental model
//!
//! [`StoreHandle`] is the shared owner. Readers take a short lock through [`StoreHandle::read`],
//! writers through [`StoreHandle::update`], and every write bumps a revision counter published on
//! a `watch` channel. Observers such as the frame router re-derive their view from a fresh read
//! after each revision change, so bursts of writes collapse into one wakeup.
//!
//! # Invariants
//!
//! - The state lock is never held across an `.await`.
//! - Saved annotations that wait to anchor are timed out exactly once, and only when the route
//!   expects guests to anchor them. A status reported before the timeout wins.
//! - Pending anchoring timeouts are cancelled when the last handle is dropped.

mod annotations;
mod drafts;
mod frames;
mod realtime;
mod selection;
mod session;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use margin_proto::{Annotation, AnnotationId, ContentInfo, FrameId, Permissions, Profile, Tag};
use margin_worker::TimerSet;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

pub use self::annotations::{AnchorOutcome, AnchorReport, AnchorStatus, Annotations, Counts, is_waiting_to_anchor};
pub use self::drafts::{Draft, Drafts};
pub use self::frames::{FrameInfo, Frames};
pub use self::realtime::RealTimeUpdates;
use self::realtime::ReceiveContext;
pub use self::selection::{Selection, Tab};
pub use self::session::{Panel, Session};

/// Default time a saved annotation may wait for an anchoring report.
pub const ANCHOR_TIMEOUT: Duration = Duration::from_millis(500);

/// Which application view owns the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Route {
	/// Sidebar next to annotatable guests.
	#[default]
	Sidebar,
	Notebook,
	/// Read-only live stream of changes.
	Stream,
}

impl Route {
	/// True if guests are expected to report anchoring for loaded annotations.
	pub fn expects_anchoring(self) -> bool {
		matches!(self, Self::Sidebar)
	}
}

#[derive(Debug, Default)]
pub struct Store {
	route: Route,
	annotations: Annotations,
	frames: Frames,
	realtime: RealTimeUpdates,
	selection: Selection,
	session: Session,
	drafts: Drafts,
}

impl Store {
	pub fn new(route: Route) -> Self {
		Self {
			route,
			..Self::default()
		}
	}

	pub fn route(&self) -> Route {
		self.route
	}

	pub fn annotations(&self) -> &Annotations {
		&self.annotations
	}

	pub fn frames(&self) -> &Frames {
		&self.frames
	}

	pub fn realtime(&self) -> &RealTimeUpdates {
		&self.realtime
	}

	pub fn selection(&self) -> &Selection {
		&self.selection
	}

	pub fn session(&self) -> &Session {
		&self.session
	}

	pub fn drafts(&self) -> &Drafts {
		&self.drafts
	}

	/// Adds or merges records. Goes through [`StoreHandle::add_annotations`] so anchoring
	/// timeouts get scheduled.
	pub(crate) fn add_annotations(&mut self, records: Vec<Annotation>, now: DateTime<Utc>) -> Vec<Tag> {
		let ids: Vec<AnnotationId> = records.iter().filter_map(|r| r.id.clone()).collect();
		let touched = self.annotations.add(records, self.session.userid(), now);
		self.realtime.discard_updates(&ids);
		touched
	}

	/// Ids among `tags` that still wait for a guest to anchor them.
	fn waiting_ids(&self, tags: &[Tag]) -> Vec<AnnotationId> {
		if !self.route.expects_anchoring() {
			return Vec::new();
		}
		tags.iter()
			.filter_map(|tag| self.annotations.find_by_tag(tag))
			.filter(|r| is_waiting_to_anchor(r))
			.filter_map(|r| r.id.clone())
			.collect()
	}

	/// Marks records in `ids` that are still waiting as timed-out orphans. Returns how many.
	fn expire_anchoring(&mut self, ids: &[AnnotationId]) -> usize {
		let statuses: BTreeMap<Tag, AnchorStatus> = ids
			.iter()
			.filter_map(|id| self.annotations.find_by_id(id))
			.filter(|r| is_waiting_to_anchor(r))
			.filter_map(|r| r.tag.clone())
			.map(|tag| (tag, AnchorStatus::Timeout))
			.collect();
		self.annotations.update_anchor_status(&statuses);
		statuses.len()
	}

	/// Removes records matching `stubs` by id or tag, along with everything referring to them.
	pub fn remove_annotations(&mut self, stubs: &[Annotation]) -> Vec<Annotation> {
		let removed = self.annotations.remove(stubs);
		let ids: Vec<AnnotationId> = removed.iter().filter_map(|r| r.id.clone()).collect();
		self.realtime.discard(&ids);
		self.selection.deselect(&ids);
		for tag in removed.iter().filter_map(|r| r.tag.as_ref()) {
			self.drafts.remove(tag);
		}
		if self.selection.tab() == Tab::Orphan && self.annotations.counts().orphans == 0 {
			self.selection.select_tab(Tab::Annotation);
		}
		removed
	}

	pub fn update_anchor_status(&mut self, statuses: &BTreeMap<Tag, AnchorStatus>) {
		self.annotations.update_anchor_status(statuses);
	}

	/// Applies guest anchoring reports in one pass.
	pub fn apply_anchor_reports(&mut self, reports: &[AnchorReport]) -> Vec<AnchorOutcome> {
		self.annotations.apply_reports(reports)
	}

	pub fn clear_annotations(&mut self) {
		self.annotations.clear();
		self.selection.clear();
	}

	pub fn hover_annotations(&mut self, tags: impl IntoIterator<Item = Tag>) {
		self.annotations.hover(tags);
	}

	pub fn highlight_annotations(&mut self, ids: impl IntoIterator<Item = AnnotationId>) {
		self.annotations.highlight(ids);
	}

	pub fn unhighlight_annotations(&mut self, ids: &[AnnotationId]) {
		self.annotations.unhighlight(ids);
	}

	pub fn hide_annotation(&mut self, id: &AnnotationId) -> bool {
		self.annotations.set_hidden(id, true)
	}

	pub fn unhide_annotation(&mut self, id: &AnnotationId) -> bool {
		self.annotations.set_hidden(id, false)
	}

	/// Buffers changes from the push stream.
	///
	/// In the sidebar only changes to the focused group are kept, unless `all_groups` is set;
	/// other views accept every group.
	pub fn receive_real_time_updates(&mut self, updated: Vec<Annotation>, deleted: Vec<AnnotationId>, all_groups: bool) {
		let group_filter = match (self.route, all_groups) {
			(Route::Sidebar, false) => Some(self.session.focused_group().unwrap_or_default()),
			_ => None,
		};
		let annotations = &self.annotations;
		let is_known = |id: &AnnotationId| annotations.exists(id);
		let cx = ReceiveContext {
			group_filter,
			is_known: &is_known,
		};
		self.realtime.receive(updated, deleted, &cx);
	}

	fn take_pending_updates(&mut self) -> (Vec<Annotation>, Vec<AnnotationId>) {
		self.realtime.take()
	}

	pub fn clear_pending_updates(&mut self) {
		self.realtime.clear();
	}

	pub fn connect_frame(&mut self, frame: FrameInfo) {
		self.frames.connect(frame);
	}

	pub fn destroy_frame(&mut self, id: &FrameId) -> Option<FrameInfo> {
		self.frames.destroy(id)
	}

	pub fn update_frame_annotation_fetch_status(&mut self, uri: &str, complete: bool) {
		self.frames.update_fetch_status(uri, complete);
	}

	pub fn set_content_info(&mut self, info: Option<ContentInfo>) {
		self.frames.set_content_info(info);
	}

	pub fn select_annotations(&mut self, ids: impl IntoIterator<Item = AnnotationId>) {
		self.selection.select(ids);
	}

	pub fn toggle_selected_annotations(&mut self, ids: impl IntoIterator<Item = AnnotationId>) {
		self.selection.toggle(ids);
	}

	pub fn clear_selection(&mut self) {
		self.selection.clear();
	}

	pub fn select_tab(&mut self, tab: Tab) {
		self.selection.select_tab(tab);
	}

	pub fn set_annotation_focus_request(&mut self, id: Option<AnnotationId>) {
		self.selection.request_focus(id);
	}

	pub fn update_profile(&mut self, profile: Profile) {
		self.session.update_profile(profile);
	}

	pub fn load_groups(&mut self, groups: Vec<Value>) {
		self.session.load_groups(groups);
	}

	/// Switches the focused group. Buffered changes belong to the previous group and are dropped.
	pub fn focus_group(&mut self, group: Option<String>) {
		if self.session.focus_group(group) {
			self.realtime.clear();
		}
	}

	pub fn set_sidebar_opened(&mut self, opened: bool) {
		self.session.set_sidebar_opened(opened);
	}

	pub fn set_highlights_visible(&mut self, visible: bool) {
		self.session.set_highlights_visible(visible);
	}

	pub fn open_panel(&mut self, panel: Panel) {
		self.session.open_panel(panel);
	}

	pub fn close_panel(&mut self) {
		self.session.close_panel();
	}

	pub fn create_draft(&mut self, tag: Tag, draft: Draft) {
		self.drafts.create(tag, draft);
	}

	pub fn remove_draft(&mut self, tag: &Tag) -> Option<Draft> {
		self.drafts.remove(tag)
	}

	/// Removes unsaved annotations whose draft was left empty.
	pub fn delete_new_and_empty_drafts(&mut self) -> Vec<Annotation> {
		let stubs: Vec<Annotation> = self
			.drafts
			.empty_tags()
			.into_iter()
			.filter(|tag| self.annotations.find_by_tag(tag).is_some_and(Annotation::is_new))
			.map(|tag| Annotation {
				tag: Some(tag),
				..Annotation::default()
			})
			.collect();
		if stubs.is_empty() {
			return Vec::new();
		}
		self.remove_annotations(&stubs)
	}

	/// Adds an annotation created in a guest, filling in authorship and sharing defaults.
	///
	/// Abandoned empty drafts are discarded first. Non-highlights get a draft so the user can
	/// start editing straight away.
	fn create_annotation(&mut self, mut record: Annotation, now: DateTime<Utc>) -> Option<Tag> {
		let user = self.session.userid().map(str::to_string);
		let group = self.session.focused_group().map(str::to_string);
		record.created.get_or_insert(now);
		record.updated.get_or_insert(now);
		if record.user.is_none() {
			record.user.clone_from(&user);
		}
		if record.group.is_none() {
			record.group.clone_from(&group);
		}
		record.text.get_or_insert_with(String::new);
		record.tags.get_or_insert_with(Vec::new);
		if record.permissions.is_none()
			&& let Some(user) = &user
		{
			record.permissions = Some(match (&group, record.is_highlight()) {
				(Some(group), false) => Permissions::shared(user, group),
				_ => Permissions::private(user),
			});
		}

		self.delete_new_and_empty_drafts();
		let highlight = record.is_highlight();
		let draft = Draft {
			text: record.text.clone().unwrap_or_default(),
			tags: record.tags.clone().unwrap_or_default(),
			is_private: !record.is_public(),
		};
		let tag = self.add_annotations(vec![record], now).into_iter().next()?;
		if !highlight {
			self.drafts.create(tag.clone(), draft);
		}
		Some(tag)
	}
}

struct Inner {
	state: Mutex<Store>,
	revision: watch::Sender<u64>,
	timers: TimerSet,
	anchor_timeout: Duration,
}

/// Shared owner of the [`Store`].
#[derive(Clone)]
pub struct StoreHandle {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for StoreHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StoreHandle")
			.field("revision", &*self.inner.revision.borrow())
			.field("anchor_timeout", &self.inner.anchor_timeout)
			.finish()
	}
}

impl StoreHandle {
	pub fn new(route: Route) -> Self {
		Self::with_anchor_timeout(route, ANCHOR_TIMEOUT)
	}

	pub fn with_anchor_timeout(route: Route, anchor_timeout: Duration) -> Self {
		let (revision, _) = watch::channel(0);
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(Store::new(route)),
				revision,
				timers: TimerSet::new(),
				anchor_timeout,
			}),
		}
	}

	/// Runs `f` against the current state.
	pub fn read<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
		f(&self.inner.state.lock())
	}

	/// Mutates the state and notifies subscribers.
	pub fn update<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
		let result = f(&mut self.inner.state.lock());
		self.inner.revision.send_modify(|rev| *rev += 1);
		result
	}

	/// Change notifications. The value is a revision counter.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.inner.revision.subscribe()
	}

	pub fn revision(&self) -> u64 {
		*self.inner.revision.borrow()
	}

	/// Adds or merges records and schedules the anchoring timeout for those that need a guest.
	///
	/// Must be called from within a tokio runtime.
	pub fn add_annotations(&self, records: Vec<Annotation>) -> Vec<Tag> {
		let now = Utc::now();
		let (touched, waiting) = self.update(|store| {
			let touched = store.add_annotations(records, now);
			let waiting = store.waiting_ids(&touched);
			(touched, waiting)
		});
		self.schedule_anchor_timeout(waiting);
		touched
	}

	/// Adds a guest-created annotation. Returns its tag.
	pub fn create_annotation(&self, record: Annotation) -> Option<Tag> {
		let now = Utc::now();
		self.update(|store| store.create_annotation(record, now))
	}

	/// Applies every buffered push-stream change. Returns the ids of applied updates.
	///
	/// Must be called from within a tokio runtime.
	pub fn apply_pending_updates(&self) -> Vec<AnnotationId> {
		let now = Utc::now();
		let (applied, waiting) = self.update(|store| {
			let (updates, deletions) = store.take_pending_updates();
			let applied: Vec<AnnotationId> = updates.iter().filter_map(|r| r.id.clone()).collect();
			let touched = store.add_annotations(updates, now);
			let waiting = store.waiting_ids(&touched);
			let stubs: Vec<Annotation> = deletions
				.into_iter()
				.map(|id| Annotation {
					id: Some(id),
					..Annotation::default()
				})
				.collect();
			store.remove_annotations(&stubs);
			(applied, waiting)
		});
		self.schedule_anchor_timeout(waiting);
		applied
	}

	fn schedule_anchor_timeout(&self, ids: Vec<AnnotationId>) {
		if ids.is_empty() {
			return;
		}
		let weak: Weak<Inner> = Arc::downgrade(&self.inner);
		self.inner.timers.schedule("anchor_timeout", self.inner.anchor_timeout, async move {
			let Some(inner) = weak.upgrade() else {
				return;
			};
			let handle = StoreHandle { inner };
			let still_waiting = handle.read(|store| {
				ids.iter()
					.filter_map(|id| store.annotations.find_by_id(id))
					.any(is_waiting_to_anchor)
			});
			if still_waiting {
				let expired = handle.update(|store| store.expire_anchoring(&ids));
				tracing::debug!(expired, "anchoring timed out");
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use margin_proto::{Selector, Target};
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	fn anchored(id: &str) -> Annotation {
		let mut record = Annotation::saved(id, "http://x/1");
		record.group = Some("g1".into());
		record.target = Some(vec![Target::with_selectors(
			"http://x/1",
			vec![Selector(json!({"type": "TextPositionSelector", "start": 1, "end": 4}))],
		)]);
		record
	}

	fn orphan_of(store: &StoreHandle, id: &str) -> Option<bool> {
		store.read(|s| s.annotations().find_by_id(&AnnotationId::new(id)).and_then(|r| r.orphan))
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn unanchored_annotation_times_out() {
		let store = StoreHandle::new(Route::Sidebar);
		store.add_annotations(vec![anchored("a")]);
		assert_eq!(orphan_of(&store, "a"), None);

		tokio::time::sleep(ANCHOR_TIMEOUT + Duration::from_millis(1)).await;
		assert_eq!(orphan_of(&store, "a"), Some(true));
		let timed_out = store.read(|s| s.annotations().find_by_id(&AnnotationId::new("a")).and_then(|r| r.anchor_timeout));
		assert_eq!(timed_out, Some(true));
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn report_before_timeout_wins() {
		let store = StoreHandle::new(Route::Sidebar);
		let tags = store.add_annotations(vec![anchored("a")]);
		store.update(|s| {
			s.apply_anchor_reports(&[AnchorReport {
				id: Some(AnnotationId::new("a")),
				tag: tags[0].clone(),
				orphan: false,
			}])
		});

		tokio::time::sleep(ANCHOR_TIMEOUT * 2).await;
		assert_eq!(orphan_of(&store, "a"), Some(false));
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn stream_route_never_times_out() {
		let store = StoreHandle::new(Route::Stream);
		store.add_annotations(vec![anchored("a")]);
		tokio::time::sleep(ANCHOR_TIMEOUT * 2).await;
		assert_eq!(orphan_of(&store, "a"), None);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn updates_bump_revision() {
		let store = StoreHandle::new(Route::Sidebar);
		let mut rx = store.subscribe();
		store.update(|s| s.set_highlights_visible(false));
		assert!(rx.has_changed().unwrap());
		assert_eq!(store.revision(), 1);
		assert!(!store.read(|s| s.session().highlights_visible()));
	}

	#[test]
	fn removal_clears_selection_and_orphan_tab() {
		let mut store = Store::new(Route::Sidebar);
		store.add_annotations(vec![anchored("a")], Utc::now());
		store.apply_anchor_reports(&[AnchorReport {
			id: Some(AnnotationId::new("a")),
			tag: Tag::new("t0"),
			orphan: true,
		}]);
		store.select_tab(Tab::Orphan);
		store.select_annotations([AnnotationId::new("a")]);

		store.remove_annotations(&[Annotation::saved("a", "")]);
		assert!(store.selection().selected().is_empty());
		assert_eq!(store.selection().tab(), Tab::Annotation);
	}

	#[test]
	fn real_time_hooks() {
		let mut store = Store::new(Route::Sidebar);
		store.focus_group(Some("g1".into()));
		store.add_annotations(vec![anchored("known")], Utc::now());
		store.receive_real_time_updates(vec![anchored("a"), anchored("b")], vec![AnnotationId::new("known")], false);
		assert_eq!(store.realtime().pending_update_count(), 3);

		store.add_annotations(vec![anchored("a")], Utc::now());
		assert_eq!(store.realtime().pending_update_count(), 2);
		store.remove_annotations(&[Annotation::saved("known", "")]);
		assert_eq!(store.realtime().pending_update_count(), 1);
		store.focus_group(Some("g2".into()));
		assert_eq!(store.realtime().pending_update_count(), 0);
	}

	#[test]
	fn sidebar_ignores_other_groups() {
		let mut store = Store::new(Route::Sidebar);
		store.focus_group(Some("g2".into()));
		store.receive_real_time_updates(vec![anchored("a")], vec![], false);
		assert_eq!(store.realtime().pending_update_count(), 0);
		store.receive_real_time_updates(vec![anchored("a")], vec![], true);
		assert_eq!(store.realtime().pending_update_count(), 1);

		let mut stream = Store::new(Route::Stream);
		stream.receive_real_time_updates(vec![anchored("a")], vec![], false);
		assert_eq!(stream.realtime().pending_update_count(), 1);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn apply_pending_updates_empties_both_sets() {
		let store = StoreHandle::new(Route::Stream);
		store.add_annotations(vec![anchored("old")]);
		store.update(|s| s.receive_real_time_updates(vec![anchored("new")], vec![AnnotationId::new("old")], false));

		let applied = store.apply_pending_updates();
		assert_eq!(applied, vec![AnnotationId::new("new")]);
		store.read(|s| {
			assert_eq!(s.realtime().pending_update_count(), 0);
			assert!(s.annotations().exists(&AnnotationId::new("new")));
			assert!(!s.annotations().exists(&AnnotationId::new("old")));
		});
	}

	#[test]
	fn created_annotations_get_defaults_and_a_draft() {
		let mut store = Store::new(Route::Sidebar);
		store.update_profile(Profile {
			userid: Some("acct:me@example".into()),
			..Profile::default()
		});
		store.focus_group(Some("g1".into()));

		let abandoned = store
			.create_annotation(
				Annotation {
					uri: Some("http://x/1".into()),
					..Annotation::default()
				},
				Utc::now(),
			)
			.unwrap();
		assert!(store.drafts().get(&abandoned).is_some_and(Draft::is_empty));

		let mut selection = Annotation {
			uri: Some("http://x/1".into()),
			..Annotation::default()
		};
		selection.target = anchored("x").target;
		selection.text = Some("hi".into());
		let tag = store.create_annotation(selection, Utc::now()).unwrap();

		assert!(store.annotations().find_by_tag(&abandoned).is_none());
		let record = store.annotations().find_by_tag(&tag).unwrap();
		assert_eq!(record.user.as_deref(), Some("acct:me@example"));
		assert_eq!(record.group.as_deref(), Some("g1"));
		assert_eq!(record.permissions, Some(Permissions::shared("acct:me@example", "g1")));
		assert_eq!(record.orphan, Some(false));
		assert_eq!(store.drafts().get(&tag).map(|d| d.text.as_str()), Some("hi"));
	}

	#[test]
	fn created_highlights_are_private_without_draft() {
		let mut store = Store::new(Route::Sidebar);
		store.update_profile(Profile {
			userid: Some("acct:me@example".into()),
			..Profile::default()
		});
		store.focus_group(Some("g1".into()));
		let mut highlight = anchored("x");
		highlight.id = None;
		highlight.highlight = Some(true);
		let tag = store.create_annotation(highlight, Utc::now()).unwrap();

		let record = store.annotations().find_by_tag(&tag).unwrap();
		assert_eq!(record.permissions, Some(Permissions::private("acct:me@example")));
		assert!(store.drafts().is_empty());
	}
}
