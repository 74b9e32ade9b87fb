use std::time::Duration;

use margin_config::SyncSection;
use margin_proto::cfi::annotation_matches_segment;
use margin_proto::events::{GuestToSidebar, HostToSidebar, SidebarToGuest, SidebarToHost};
use margin_proto::{Annotation, ContentInfo, DocumentInfo, FeatureFlags, FrameId, Tag};
use margin_rpc::{
	Channel, ChannelEvent, ChannelEvents, DiscoveryKind, DiscoveryMessage, FrameRole, Port, PortMessage, Responder,
};
use margin_worker::GenerationClock;
use tokio::sync::{mpsc, watch};

use super::commands::FrameSyncCmd;
use super::handle::FrameSyncHandle;
use super::registry::{Described, Disconnect, GuestChannel, Registry};
use super::routing::{self, candidate_frames, frames_for};
use crate::error::{Result, SyncError};
use crate::services::anchoring::{ANCHORING_DEBOUNCE, AnchoringCoalescer, ParkedKey, Replay};
use crate::store::{AnchorReport, FrameInfo, Panel, StoreHandle, Tab, is_waiting_to_anchor};

type HostChannel = Channel<SidebarToHost, HostToSidebar>;

/// Frame sync settings.
#[derive(Debug, Clone)]
pub struct FrameSyncConfig {
	/// Window over which guest anchoring reports are batched.
	pub anchoring_debounce: Duration,
}

impl Default for FrameSyncConfig {
	fn default() -> Self {
		Self {
			anchoring_debounce: ANCHORING_DEBOUNCE,
		}
	}
}

impl From<&SyncSection> for FrameSyncConfig {
	fn from(section: &SyncSection) -> Self {
		Self {
			anchoring_debounce: section.anchoring_debounce(),
		}
	}
}

/// Channel traffic, tagged with the link generation it arrived on.
enum Inbound {
	Host {
		generation: u64,
		event: ChannelEvent<HostToSidebar>,
	},
	Guest {
		frame: FrameId,
		generation: u64,
		event: ChannelEvent<GuestToSidebar>,
	},
}

async fn forward<In>(
	mut events: ChannelEvents<In>,
	tx: mpsc::UnboundedSender<Inbound>,
	wrap: impl Fn(ChannelEvent<In>) -> Inbound,
) {
	while let Some(event) = events.recv().await {
		if tx.send(wrap(event)).is_err() {
			return;
		}
	}
}

fn answer(reply: Option<Responder>) {
	if let Some(reply) = reply
		&& let Err(error) = reply.ok(&())
	{
		tracing::warn!(%error, "failed to answer channel call");
	}
}

fn parked_key(record: &Annotation, tag: &Tag) -> ParkedKey {
	match &record.id {
		Some(id) => ParkedKey::Id(id.clone()),
		None => ParkedKey::Tag(tag.clone()),
	}
}

/// Actor owning the sidebar's links to the host and to every guest frame.
pub struct FrameSyncService {
	rx: mpsc::Receiver<FrameSyncCmd>,
	store: StoreHandle,
	revisions: watch::Receiver<u64>,
	inbound_tx: mpsc::UnboundedSender<Inbound>,
	inbound_rx: mpsc::UnboundedReceiver<Inbound>,
	host: Option<(u64, HostChannel)>,
	guests: Registry,
	generations: GenerationClock,
	anchoring: AnchoringCoalescer,
	last_public_count: Option<usize>,
	last_features: FeatureFlags,
	last_content_info: Option<ContentInfo>,
}

impl FrameSyncService {
	/// Spawns the frame sync actor over `store`.
	pub fn start(store: StoreHandle, config: FrameSyncConfig) -> FrameSyncHandle {
		let (tx, rx) = mpsc::channel(256);
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let (last_features, last_content_info) = store.read(|s| {
			(
				s.session().profile().features.clone(),
				s.frames().content_info().cloned(),
			)
		});

		let service = Self {
			rx,
			revisions: store.subscribe(),
			store,
			inbound_tx,
			inbound_rx,
			host: None,
			guests: Registry::default(),
			generations: GenerationClock::new(),
			anchoring: AnchoringCoalescer::new(config.anchoring_debounce),
			last_public_count: None,
			last_features,
			last_content_info,
		};

		tokio::spawn(service.run());
		FrameSyncHandle::new(tx)
	}

	async fn run(mut self) {
		loop {
			tokio::select! {
				cmd = self.rx.recv() => {
					let Some(cmd) = cmd else {
						break;
					};
					if !self.handle_cmd(cmd) {
						break;
					}
				}
				Some(inbound) = self.inbound_rx.recv() => {
					self.handle_inbound(inbound);
				}
				Ok(()) = self.revisions.changed() => {
					self.on_store_changed();
				}
				_ = self.anchoring.ready(), if self.anchoring.is_armed() => {
					self.flush_anchoring();
				}
			}
		}
		self.teardown();
		tracing::debug!("frame sync stopped");
	}

	/// Returns false once the actor should stop.
	fn handle_cmd(&mut self, cmd: FrameSyncCmd) -> bool {
		match cmd {
			FrameSyncCmd::ConnectHost { port, reply } => {
				let _ = reply.send(self.connect_host(port));
			}
			FrameSyncCmd::ConnectGuest { port, source_id, reply } => {
				let _ = reply.send(self.connect_guest(port, source_id));
			}
			FrameSyncCmd::HoverAnnotations { tags } => self.hover_annotations(tags),
			FrameSyncCmd::ScrollToAnnotation { tag, reply } => {
				let _ = reply.send(self.scroll_to_annotation(&tag, true));
			}
			FrameSyncCmd::SetHighlightsVisible { visible } => self.set_highlights_visible(visible),
			FrameSyncCmd::NotifyHost { event, reply } => {
				let _ = reply.send(self.notify_host(&event));
			}
			FrameSyncCmd::Frames { reply } => {
				let _ = reply.send(self.guests.snapshot());
			}
			FrameSyncCmd::Shutdown { reply } => {
				self.teardown();
				let _ = reply.send(());
				return false;
			}
		}
		true
	}

	fn connect_host(&mut self, port: Port) -> Result<()> {
		let (channel, events) = HostChannel::new();
		channel.connect(port)?;
		let generation = self.generations.next();
		tokio::spawn(forward(events, self.inbound_tx.clone(), move |event| Inbound::Host {
			generation,
			event,
		}));
		if let Some((_, old)) = self.host.replace((generation, channel)) {
			old.destroy();
		}
		tracing::info!("host connected");

		self.tell_host(SidebarToHost::FeatureFlagsUpdated(self.last_features.clone()));
		self.last_public_count = None;
		self.update_public_count();
		Ok(())
	}

	fn connect_guest(&mut self, port: Port, source_id: Option<String>) -> Result<()> {
		let frame = FrameId(source_id);
		let (channel, events) = GuestChannel::new();
		channel.connect(port)?;
		let generation = self.generations.next();
		let id = frame.clone();
		tokio::spawn(forward(events, self.inbound_tx.clone(), move |event| Inbound::Guest {
			frame: id.clone(),
			generation,
			event,
		}));

		let (visible, features, content_info) = self.store.read(|s| {
			(
				s.session().highlights_visible(),
				s.session().profile().features.clone(),
				s.frames().content_info().cloned(),
			)
		});
		channel.notify(&SidebarToGuest::SetHighlightsVisible(visible))?;
		channel.notify(&SidebarToGuest::FeatureFlagsUpdated(features))?;
		if let Some(info) = content_info {
			channel.notify(&SidebarToGuest::ShowContentInfo(info))?;
		}

		let attach = self.guests.attach(frame.clone(), generation, channel);
		tracing::debug!(%frame, ?attach, "guest connected");
		Ok(())
	}

	fn handle_inbound(&mut self, inbound: Inbound) {
		match inbound {
			Inbound::Host { generation, event } => {
				if self.host.as_ref().map(|(g, _)| *g) != Some(generation) {
					tracing::trace!(generation, "dropping event from replaced host link");
					return;
				}
				self.handle_host_event(event);
			}
			Inbound::Guest {
				frame,
				generation,
				event,
			} => {
				if !self.guests.is_current(&frame, generation) {
					tracing::trace!(%frame, generation, "dropping event from stale guest link");
					return;
				}
				self.handle_guest_event(&frame, generation, event);
			}
		}
	}

	fn handle_host_event(&mut self, event: ChannelEvent<HostToSidebar>) {
		match event {
			ChannelEvent::Connected => tracing::debug!("host link confirmed"),
			ChannelEvent::Event { event, reply } => {
				match event {
					HostToSidebar::SidebarOpened => self.store.update(|s| s.set_sidebar_opened(true)),
					HostToSidebar::SetHighlightsVisible(visible) => self.set_highlights_visible(visible),
				}
				answer(reply);
			}
			ChannelEvent::Foreign(msg) => self.handle_offer(msg),
			ChannelEvent::Closed => {
				tracing::info!("host link closed");
				self.host = None;
			}
		}
	}

	/// Connects guests whose discovery offer the host relayed.
	fn handle_offer(&mut self, msg: PortMessage) {
		let Some(offer) = DiscoveryMessage::parse(&msg.data) else {
			tracing::debug!("ignoring unrecognized message on host link");
			return;
		};
		if offer.kind != DiscoveryKind::Offer || offer.frame2 != FrameRole::Sidebar {
			return;
		}
		if offer.frame1 != FrameRole::Guest {
			tracing::debug!(frame1 = %offer.frame1, "ignoring offer from non-guest frame");
			return;
		}
		let Some(port) = msg.ports.into_iter().next() else {
			tracing::warn!(source_id = ?offer.source_id, "guest offer without a port");
			return;
		};
		if let Err(error) = self.connect_guest(port, offer.source_id) {
			tracing::warn!(%error, "failed to connect offered guest");
		}
	}

	fn handle_guest_event(&mut self, frame: &FrameId, generation: u64, event: ChannelEvent<GuestToSidebar>) {
		let (event, reply) = match event {
			ChannelEvent::Connected => {
				tracing::debug!(%frame, "guest link confirmed");
				return;
			}
			ChannelEvent::Foreign(_) => {
				tracing::trace!(%frame, "ignoring foreign message from guest");
				return;
			}
			ChannelEvent::Closed => {
				self.guest_closed(frame, generation);
				return;
			}
			ChannelEvent::Event { event, reply } => (event, reply),
		};

		let method: &'static str = (&event).into();
		tracing::trace!(%frame, method, "guest event");
		match event {
			GuestToSidebar::DocumentInfoChanged(info) => self.describe_guest(frame, info),
			GuestToSidebar::CreateAnnotation(annotation) => self.create_annotation(frame, annotation),
			GuestToSidebar::SyncAnchoringStatus(annotation) => self.report_anchoring(annotation),
			GuestToSidebar::ShowAnnotations { tags, focus } => self.show_annotations(&tags, focus),
			GuestToSidebar::HoverAnnotations(tags) => self.store.update(|s| s.hover_annotations(tags)),
			GuestToSidebar::ToggleAnnotationSelection(tags) => self.store.update(|s| {
				let ids = s.annotations().find_ids_for_tags(&tags);
				s.toggle_selected_annotations(ids);
			}),
			GuestToSidebar::Close => self.guest_closed(frame, generation),
		}
		answer(reply);
	}

	fn guest_closed(&mut self, frame: &FrameId, generation: u64) {
		match self.guests.disconnect(frame, generation) {
			Some(Disconnect::Retained { evicted }) => {
				tracing::debug!(%frame, "retaining persistent guest");
				if let Some(evicted) = evicted {
					self.store.update(|s| s.destroy_frame(&evicted));
					tracing::debug!(frame = %evicted, "dropped oldest retained guest");
				}
			}
			Some(Disconnect::Removed) => {
				self.store.update(|s| s.destroy_frame(frame));
				tracing::debug!(%frame, "guest disconnected");
			}
			None => {}
		}
	}

	fn describe_guest(&mut self, frame: &FrameId, info: DocumentInfo) {
		let Some(described) = self.guests.describe(frame, info.clone()) else {
			return;
		};
		let kind = match &described {
			Described::Fresh => "fresh",
			Described::Rebound(_) => "rebound",
			Described::Changed => "changed",
		};
		tracing::debug!(%frame, uri = %info.uri, kind, "guest described document");

		if let Described::Rebound(annotations) = described
			&& !annotations.is_empty()
			&& let Some(channel) = self.guests.channel(frame)
			&& let Err(error) = channel.notify(&SidebarToGuest::LoadAnnotations(annotations))
		{
			tracing::warn!(%frame, %error, "failed to resend annotations");
		}

		self.store.update(|s| s.connect_frame(FrameInfo::new(frame.clone(), info)));
		self.route_annotations();
	}

	fn create_annotation(&mut self, frame: &FrameId, annotation: Annotation) {
		if !self.store.read(|s| s.session().is_logged_in()) {
			tracing::debug!(%frame, "annotation created while logged out");
			self.tell_host(SidebarToHost::OpenSidebar);
			self.store.update(|s| s.open_panel(Panel::LoginPrompt));
			// Only the creating frame drew the rejected highlight.
			if let Some(tag) = annotation.tag
				&& let Some(channel) = self.guests.channel(frame)
				&& let Err(error) = channel.notify(&SidebarToGuest::DeleteAnnotation(tag))
			{
				tracing::warn!(%frame, %error, "failed to retract rejected annotation");
			}
			return;
		}

		let highlight = annotation.is_highlight();
		let Some(tag) = self.store.create_annotation(annotation) else {
			return;
		};
		let formatted = self
			.store
			.read(|s| s.annotations().find_by_tag(&tag).map(Annotation::format));
		self.guests.mark_loaded(frame, formatted);
		if !highlight {
			self.tell_host(SidebarToHost::OpenSidebar);
		}
		self.tell_host(SidebarToHost::ShowHighlights);
	}

	fn report_anchoring(&mut self, annotation: Annotation) {
		let Some(tag) = annotation.tag else {
			tracing::debug!(id = ?annotation.id, "anchoring report without tag");
			return;
		};
		self.anchoring.report(AnchorReport {
			id: annotation.id,
			tag,
			orphan: annotation.orphan.unwrap_or(false),
		});
	}

	fn flush_anchoring(&mut self) {
		let (outcomes, replays) = self.anchoring.flush(&self.store);
		for outcome in &outcomes {
			if let Some(previous) = &outcome.previous_tag {
				self.guests.rename(previous, &outcome.tag);
			}
		}
		for replay in replays {
			match replay {
				Replay::Scroll(tag) => {
					if let Err(error) = self.scroll_to_annotation(&tag, false) {
						tracing::warn!(%tag, %error, "parked scroll failed");
					}
				}
				Replay::Hover(tags) => self.broadcast(&SidebarToGuest::HoverAnnotations(tags)),
			}
		}
	}

	fn show_annotations(&mut self, tags: &[Tag], focus: bool) {
		self.store.update(|s| {
			let ids = s.annotations().find_ids_for_tags(tags);
			if focus {
				s.set_annotation_focus_request(ids.first().cloned());
			}
			s.select_annotations(ids);
			s.select_tab(Tab::Annotation);
		});
	}

	fn hover_annotations(&mut self, tags: Vec<Tag>) {
		self.anchoring.unpark_hover();
		let waiting = self.store.read(|s| {
			tags.iter().find_map(|tag| {
				s.annotations()
					.find_by_tag(tag)
					.filter(|record| is_waiting_to_anchor(record))
					.map(|record| parked_key(record, tag))
			})
		});
		match waiting {
			Some(key) => {
				tracing::debug!(?key, "parking hover until anchored");
				self.anchoring.park_hover(key, tags);
			}
			None => self.broadcast(&SidebarToGuest::HoverAnnotations(tags)),
		}
	}

	/// Scrolls the guest showing `tag` to it.
	///
	/// A guest showing another segment of the document is first told to navigate there. That
	/// request, like one for an annotation that has not anchored yet, is parked when `park` is
	/// set and replayed after the next anchoring report for the annotation.
	fn scroll_to_annotation(&mut self, tag: &Tag, park: bool) -> Result<()> {
		let record = self
			.store
			.read(|s| s.annotations().find_by_tag(tag).cloned())
			.ok_or_else(|| SyncError::UnknownAnnotation(tag.to_string()))?;

		let frames = self.guests.routable().0;
		let index = frames_for(&record, &frames)
			.first()
			.or(candidate_frames(&record, &frames).first())
			.copied();
		let target = index.map(|i| &frames[i]);

		if let Some(frame) = target
			&& let Some(segment) = &frame.segment
			&& !annotation_matches_segment(&record, segment)
		{
			if let Some(channel) = self.guests.channel(&frame.id) {
				tracing::debug!(frame = %frame.id, %tag, "navigating guest to annotation segment");
				channel.notify(&SidebarToGuest::NavigateToSegment(record.format()))?;
			}
			if park {
				self.anchoring.park_scroll(parked_key(&record, tag));
			}
			return Ok(());
		}

		if park && is_waiting_to_anchor(&record) {
			tracing::debug!(%tag, "parking scroll until anchored");
			self.anchoring.park_scroll(parked_key(&record, tag));
			return Ok(());
		}

		let Some(frame) = target else {
			tracing::debug!(%tag, "no frame shows annotation");
			return Ok(());
		};
		let Some(channel) = self.guests.channel(&frame.id) else {
			return Ok(());
		};
		channel.notify(&SidebarToGuest::ScrollToAnnotation(tag.clone()))?;
		Ok(())
	}

	fn set_highlights_visible(&mut self, visible: bool) {
		self.store.update(|s| s.set_highlights_visible(visible));
		self.broadcast(&SidebarToGuest::SetHighlightsVisible(visible));
	}

	fn notify_host(&self, event: &SidebarToHost) -> Result<()> {
		match &self.host {
			Some((_, host)) => Ok(host.notify(event)?),
			None => Err(margin_rpc::Error::Closed.into()),
		}
	}

	fn tell_host(&self, event: SidebarToHost) {
		if let Err(error) = self.notify_host(&event) {
			let method: &'static str = (&event).into();
			tracing::debug!(method, %error, "host event dropped");
		}
	}

	fn broadcast(&self, event: &SidebarToGuest) {
		for (frame, channel) in self.guests.channels() {
			if let Err(error) = channel.notify(event) {
				let method: &'static str = event.into();
				tracing::warn!(%frame, method, %error, "failed to notify guest");
			}
		}
	}

	fn on_store_changed(&mut self) {
		self.revisions.borrow_and_update();
		self.route_annotations();
		self.sync_session_state();
		self.update_public_count();
	}

	/// Loads and unloads annotations so every guest holds exactly what routes to it.
	fn route_annotations(&mut self) {
		let diffs = {
			let (frames, loaded) = self.guests.routable();
			if frames.is_empty() {
				return;
			}
			let diffs = self
				.store
				.read(|s| routing::plan(s.annotations().all(), &frames, &loaded));
			frames.into_iter().zip(diffs).collect::<Vec<_>>()
		};

		for (frame, diff) in diffs {
			if diff.is_empty() {
				continue;
			}
			let Some(channel) = self.guests.channel(&frame.id) else {
				continue;
			};
			for tag in &diff.unload {
				if let Err(error) = channel.notify(&SidebarToGuest::DeleteAnnotation(tag.clone())) {
					tracing::warn!(frame = %frame.id, %tag, %error, "failed to unload annotation");
				}
			}
			if !diff.load.is_empty()
				&& let Err(error) = channel.notify(&SidebarToGuest::LoadAnnotations(diff.load.clone()))
			{
				tracing::warn!(frame = %frame.id, %error, "failed to load annotations");
			}
			tracing::debug!(
				frame = %frame.id,
				loaded = diff.load.len(),
				unloaded = diff.unload.len(),
				"routed annotations"
			);
			self.guests.mark_unloaded(&frame.id, &diff.unload);
			self.guests.mark_loaded(&frame.id, diff.load);
		}
	}

	fn sync_session_state(&mut self) {
		let (features, content_info) = self.store.read(|s| {
			(
				s.session().profile().features.clone(),
				s.frames().content_info().cloned(),
			)
		});
		if features != self.last_features {
			self.last_features = features.clone();
			self.broadcast(&SidebarToGuest::FeatureFlagsUpdated(features.clone()));
			self.tell_host(SidebarToHost::FeatureFlagsUpdated(features));
		}
		if content_info != self.last_content_info {
			self.last_content_info = content_info.clone();
			if let Some(info) = content_info {
				self.broadcast(&SidebarToGuest::ShowContentInfo(info));
			}
		}
	}

	/// Tells the host how many public annotations the page has once every frame finished loading.
	fn update_public_count(&mut self) {
		if self.host.is_none() {
			return;
		}
		let (complete, count) = self.store.read(|s| {
			(
				s.frames().all_fetches_complete(),
				routing::public_count(s.annotations().all()),
			)
		});
		if !complete {
			return;
		}
		if count == 0 || self.last_public_count != Some(count) {
			self.last_public_count = Some(count);
			self.tell_host(SidebarToHost::PublicAnnotationCountChanged(count));
		}
	}

	fn teardown(&mut self) {
		self.guests.clear();
		if let Some((_, host)) = self.host.take() {
			host.destroy();
		}
	}
}
