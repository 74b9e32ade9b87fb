use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use margin_config::StreamerSection;
use margin_proto::push::{ClientMessage, NotificationAction, ServerMessage};
use margin_proto::{Annotation, AnnotationId, Profile};
use margin_worker::{GenerationClock, GenerationToken, ReconnectPolicy, TimerHandle, TimerSet};
use tokio::sync::{mpsc, watch};

use super::commands::StreamerCmd;
use super::handle::StreamerHandle;
use super::transport::{Connector, StreamEndpoint, Transport, TransportEvent, authorized_url};
use crate::error::Result;
use crate::store::StoreHandle;

/// How long changes applied in immediate mode stay highlighted.
pub const HIGHLIGHT_DURATION: Duration = Duration::from_secs(2);

/// Request id of the identity check sent on every connection.
const WHOAMI_ID: u64 = 1;

/// Streamer settings.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
	pub reconnect: ReconnectPolicy,
	/// Apply changes as they arrive instead of buffering them, and accept every group.
	pub apply_immediately: bool,
	pub highlight_duration: Duration,
}

impl Default for StreamerConfig {
	fn default() -> Self {
		Self {
			reconnect: ReconnectPolicy::default(),
			apply_immediately: false,
			highlight_duration: HIGHLIGHT_DURATION,
		}
	}
}

impl From<&StreamerSection> for StreamerConfig {
	fn from(section: &StreamerSection) -> Self {
		Self {
			reconnect: ReconnectPolicy {
				base: section.reconnect_base(),
				max_attempts: section.max_reconnect_attempts,
			},
			apply_immediately: section.apply_immediately,
			highlight_duration: section.highlight_duration(),
		}
	}
}

/// Push connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	/// A connection attempt is in flight.
	Connecting,
	Open,
	/// Waiting before retry number `attempt`.
	Reconnecting { attempt: u32 },
	/// The retry budget is spent. Only an explicit connect starts over.
	GaveUp,
}

/// Results fed back into the actor, tagged with the attempt that produced them.
enum Internal {
	Opened { generation: u64, result: Result<Transport> },
	RetryDue { generation: u64 },
}

/// The one piece of connection work in flight, if any.
enum Pending {
	Connecting(GenerationToken),
	Waiting { generation: u64, timer: TimerHandle },
}

impl Pending {
	fn generation(&self) -> u64 {
		match self {
			Self::Connecting(token) => token.generation(),
			Self::Waiting { generation, .. } => *generation,
		}
	}

	fn cancel(&self) {
		match self {
			Self::Connecting(token) => token.cancel(),
			Self::Waiting { timer, .. } => timer.cancel(),
		}
	}
}

struct Socket {
	outgoing: mpsc::UnboundedSender<String>,
	incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

async fn next_event(socket: &mut Option<Socket>) -> TransportEvent {
	match socket {
		Some(socket) => socket
			.incoming
			.recv()
			.await
			.unwrap_or(TransportEvent::Closed { code: None }),
		None => std::future::pending().await,
	}
}

/// Actor keeping one push connection alive and feeding its notifications into the store.
pub struct StreamerService {
	rx: mpsc::Receiver<StreamerCmd>,
	store: StoreHandle,
	revisions: watch::Receiver<u64>,
	endpoint: Arc<dyn StreamEndpoint>,
	connector: Arc<dyn Connector>,
	config: StreamerConfig,
	client_id: String,
	config_messages: IndexMap<String, ClientMessage>,
	state: watch::Sender<ConnectionState>,
	generations: GenerationClock,
	pending: Option<Pending>,
	socket: Option<Socket>,
	internal_tx: mpsc::UnboundedSender<Internal>,
	internal_rx: mpsc::UnboundedReceiver<Internal>,
	attempts: u32,
	timers: TimerSet,
	/// Set by the first connect; from then on a new user forces a reconnect.
	watched_userid: Option<Option<String>>,
	warned_kinds: HashSet<String>,
}

impl StreamerService {
	/// Spawns the streamer actor. Nothing connects until [`StreamerHandle::connect`].
	pub fn start(
		store: StoreHandle,
		endpoint: Arc<dyn StreamEndpoint>,
		connector: Arc<dyn Connector>,
		config: StreamerConfig,
	) -> StreamerHandle {
		let (tx, rx) = mpsc::channel(64);
		let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
		let (internal_tx, internal_rx) = mpsc::unbounded_channel();
		let client_id = uuid::Uuid::new_v4().simple().to_string();

		let service = Self {
			rx,
			revisions: store.subscribe(),
			store,
			endpoint,
			connector,
			config,
			client_id: client_id.clone(),
			config_messages: IndexMap::new(),
			state,
			generations: GenerationClock::new(),
			pending: None,
			socket: None,
			internal_tx,
			internal_rx,
			attempts: 0,
			timers: TimerSet::new(),
			watched_userid: None,
			warned_kinds: HashSet::new(),
		};

		tokio::spawn(service.run());
		StreamerHandle::new(tx, state_rx, client_id)
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
				Some(internal) = self.internal_rx.recv() => {
					self.handle_internal(internal);
				}
				event = next_event(&mut self.socket) => {
					self.handle_transport_event(event);
				}
				Ok(()) = self.revisions.changed() => {
					self.on_store_changed();
				}
			}
		}
		self.teardown();
		self.timers.cancel_all();
		tracing::debug!("streamer stopped");
	}

	/// Returns false once the actor should stop.
	fn handle_cmd(&mut self, cmd: StreamerCmd) -> bool {
		match cmd {
			StreamerCmd::Connect { reply } => {
				self.connect();
				let _ = reply.send(());
			}
			StreamerCmd::Reconnect { reply } => {
				self.reconnect();
				let _ = reply.send(());
			}
			StreamerCmd::Disconnect { reply } => {
				self.teardown();
				self.set_state(ConnectionState::Disconnected);
				let _ = reply.send(());
			}
			StreamerCmd::SetConfig { key, message, reply } => {
				self.set_config(key, message);
				let _ = reply.send(());
			}
			StreamerCmd::ApplyPendingUpdates { reply } => {
				let _ = reply.send(self.apply_pending_updates());
			}
			StreamerCmd::Shutdown { reply } => {
				self.teardown();
				self.set_state(ConnectionState::Disconnected);
				let _ = reply.send(());
				return false;
			}
		}
		true
	}

	fn set_state(&self, state: ConnectionState) {
		self.state.send_if_modified(|current| {
			let changed = *current != state;
			*current = state;
			changed
		});
	}

	fn connect(&mut self) {
		if self.watched_userid.is_none() {
			self.watched_userid = Some(self.store.read(|s| s.session().userid().map(String::from)));
		}
		if self.socket.is_some() || matches!(self.pending, Some(Pending::Connecting(_))) {
			return;
		}
		self.attempts = 0;
		self.open();
	}

	fn reconnect(&mut self) {
		self.teardown();
		self.attempts = 0;
		self.open();
	}

	/// Drops the socket and cancels any attempt or scheduled retry.
	fn teardown(&mut self) {
		if let Some(pending) = self.pending.take() {
			pending.cancel();
		}
		if self.socket.take().is_some() {
			tracing::debug!("push transport closed locally");
		}
	}

	/// Starts a connection attempt, superseding any other pending work.
	fn open(&mut self) {
		if let Some(pending) = self.pending.take() {
			pending.cancel();
		}
		let token = self.generations.start();
		let generation = token.generation();
		let endpoint = Arc::clone(&self.endpoint);
		let connector = Arc::clone(&self.connector);
		let tx = self.internal_tx.clone();
		let cancel = token.clone();

		tokio::spawn(async move {
			let result = tokio::select! {
				biased;
				_ = cancel.cancelled() => return,
				result = async {
					let url = authorized_url(endpoint.as_ref()).await?;
					connector.connect(&url).await
				} => result,
			};
			let _ = tx.send(Internal::Opened { generation, result });
		});

		self.pending = Some(Pending::Connecting(token));
		self.set_state(ConnectionState::Connecting);
		tracing::debug!(generation, attempt = self.attempts, "opening push transport");
	}

	fn handle_internal(&mut self, internal: Internal) {
		let generation = match &internal {
			Internal::Opened { generation, .. } | Internal::RetryDue { generation } => *generation,
		};
		if self.pending.as_ref().map(Pending::generation) != Some(generation) {
			tracing::trace!(generation, "dropping superseded connection work");
			return;
		}
		self.pending = None;

		match internal {
			Internal::Opened { result: Ok(transport), .. } => self.on_open(transport),
			Internal::Opened { result: Err(error), .. } => {
				tracing::warn!(%error, "failed to open push transport");
				self.schedule_retry();
			}
			Internal::RetryDue { .. } => self.open(),
		}
	}

	fn on_open(&mut self, transport: Transport) {
		let Transport { outgoing, incoming } = transport;
		self.socket = Some(Socket { outgoing, incoming });
		self.attempts = 0;
		self.set_state(ConnectionState::Open);
		tracing::info!(client_id = %self.client_id, "streamer connected");

		self.send(&ClientMessage::client_id(&self.client_id));
		self.send(&ClientMessage::whoami(WHOAMI_ID));
		for message in self.config_messages.values() {
			self.send(message);
		}
	}

	fn schedule_retry(&mut self) {
		self.socket = None;
		self.attempts += 1;
		let Some(delay) = self.config.reconnect.delay(self.attempts) else {
			tracing::error!(
				attempts = self.attempts - 1,
				"gave up reconnecting to the push service"
			);
			self.set_state(ConnectionState::GaveUp);
			return;
		};

		let generation = self.generations.next();
		let tx = self.internal_tx.clone();
		let timer = self.timers.schedule("streamer.reconnect", delay, async move {
			let _ = tx.send(Internal::RetryDue { generation });
		});
		self.pending = Some(Pending::Waiting { generation, timer });
		self.set_state(ConnectionState::Reconnecting { attempt: self.attempts });
		tracing::debug!(attempt = self.attempts, ?delay, "scheduled push reconnect");
	}

	fn handle_transport_event(&mut self, event: TransportEvent) {
		match event {
			TransportEvent::Message(text) => self.handle_message(&text),
			event if event.is_normal_close() => {
				tracing::debug!(?event, "push transport closed");
				self.socket = None;
				self.set_state(ConnectionState::Disconnected);
			}
			TransportEvent::Closed { code } => {
				tracing::warn!(?code, "push transport closed unexpectedly");
				self.schedule_retry();
			}
			TransportEvent::Error(error) => {
				tracing::warn!(%error, "push transport failed");
				self.schedule_retry();
			}
		}
	}

	fn send(&self, message: &ClientMessage) {
		if let Some(socket) = &self.socket
			&& socket.outgoing.send(message.to_text()).is_err()
		{
			tracing::debug!("push transport gone before send");
		}
	}

	fn set_config(&mut self, key: String, message: ClientMessage) {
		if self.socket.is_some() {
			self.send(&message);
		}
		tracing::debug!(%key, "push config registered");
		self.config_messages.insert(key, message);
	}

	fn handle_message(&mut self, text: &str) {
		let message = match ServerMessage::decode(text) {
			Ok(Some(message)) => message,
			Ok(None) => return,
			Err(error) => {
				tracing::warn!(%error, "malformed push message");
				return;
			}
		};

		match message {
			ServerMessage::AnnotationNotification { action, payload } => self.on_notification(action, payload),
			ServerMessage::SessionChange { model } => {
				tracing::debug!(userid = ?model.userid, "push session change");
				self.store.update(|s| {
					s.update_profile(Profile {
						userid: model.userid,
						features: model.features,
						..Profile::default()
					});
					s.load_groups(model.groups);
				});
			}
			ServerMessage::WhoYouAre { userid } => {
				let local = self.store.read(|s| s.session().userid().map(String::from));
				if local != userid {
					tracing::warn!(remote = ?userid, local = ?local, "push user does not match logged-in user");
				}
			}
			ServerMessage::Unsupported { kind } => {
				if self.warned_kinds.insert(kind.clone()) {
					tracing::warn!(%kind, "received unsupported push message");
				}
			}
		}
	}

	fn on_notification(&mut self, action: NotificationAction, payload: Vec<Annotation>) {
		let immediate = self.config.apply_immediately;
		tracing::trace!(?action, count = payload.len(), "push notification");
		match action {
			NotificationAction::Create | NotificationAction::Update | NotificationAction::Past => {
				self.store
					.update(|s| s.receive_real_time_updates(payload, Vec::new(), immediate));
			}
			NotificationAction::Delete => {
				let ids: Vec<AnnotationId> = payload.into_iter().filter_map(|a| a.id).collect();
				self.store
					.update(|s| s.receive_real_time_updates(Vec::new(), ids, immediate));
			}
		}
		if immediate {
			self.apply_pending_updates();
		}
	}

	fn apply_pending_updates(&mut self) -> Vec<AnnotationId> {
		let applied = self.store.apply_pending_updates();
		if self.config.apply_immediately && !applied.is_empty() {
			self.store.update(|s| s.highlight_annotations(applied.iter().cloned()));
			let store = self.store.clone();
			let ids = applied.clone();
			self.timers
				.schedule("streamer.unhighlight", self.config.highlight_duration, async move {
					store.update(|s| s.unhighlight_annotations(&ids));
				});
		}
		applied
	}

	fn on_store_changed(&mut self) {
		self.revisions.borrow_and_update();
		let Some(watched) = &self.watched_userid else {
			return;
		};
		let userid = self.store.read(|s| s.session().userid().map(String::from));
		if *watched != userid {
			tracing::info!(userid = ?userid, "user changed, reconnecting push transport");
			self.watched_userid = Some(userid);
			self.reconnect();
		}
	}
}
