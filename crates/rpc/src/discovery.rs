//! Discovery handshake that hands channel ports to the contexts a link joins.
//!
//! # Mental model
//!
//! The host owns a [`PortProvider`] listening on its [`Window`]. A context that wants a link
//! runs a [`PortFinder`], which posts a `request` naming its own role and the target role to the
//! host window until an `offer` carrying one port comes back. The provider creates a fresh
//! [`MessageChannel`] per request and delivers the other port to the target:
//!
//! | Request | Requester receives | Other port goes to |
//! |---|---|---|
//! | `sidebar -> host` | port 1 of the pre-created sidebar-host channel | the host, as [`FrameConnected`] |
//! | `guest -> host` | port 1 of a fresh channel | the host, as [`FrameConnected`] |
//! | `guest -> sidebar`, `notebook -> sidebar` | port 1 of a fresh channel | the sidebar, as an offer over the sidebar-host channel |
//!
//! Because the sidebar-host channel exists from the start, offers for the sidebar buffer in it
//! until the sidebar has connected and starts reading, so a guest that appears first is never
//! lost.
//!
//! # Invariants
//!
//! - A request is serviced at most once per `requestId`; finders repeat requests while polling.
//! - Requests whose origin or role pair is not on the allow-list are ignored without reply and
//!   reported once per distinct message.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use margin_config::DiscoverySection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::port::{MessageChannel, Port, PortSender};

/// Origin value matching any requester.
pub const ANY_ORIGIN: &str = "*";

/// Role a context plays in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameRole {
	/// A content frame that anchors annotations.
	Guest,
	/// The page embedding guests and the sidebar.
	Host,
	/// The annotation sidebar.
	Sidebar,
	/// The full-screen notebook view.
	Notebook,
}

impl fmt::Display for FrameRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Guest => "guest",
			Self::Host => "host",
			Self::Sidebar => "sidebar",
			Self::Notebook => "notebook",
		})
	}
}

/// Discovery message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
	/// A finder asks for a port.
	Request,
	/// The provider hands a port out.
	Offer,
}

/// A discovery handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
	/// Requesting role.
	pub frame1: FrameRole,
	/// Target role.
	pub frame2: FrameRole,
	/// Message kind.
	#[serde(rename = "type")]
	pub kind: DiscoveryKind,
	/// Correlates an offer with its request.
	pub request_id: String,
	/// Requester's frame id, forwarded so the target can tell sources apart.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_id: Option<String>,
}

impl DiscoveryMessage {
	/// Parses a value, returning `None` for anything that is not a discovery message.
	pub fn parse(value: &Value) -> Option<Self> {
		serde_json::from_value(value.clone()).ok()
	}

	fn to_value(&self) -> Value {
		serde_json::to_value(self).unwrap_or(Value::Null)
	}

	/// The offer answering this request.
	pub fn to_offer(&self) -> Self {
		Self {
			kind: DiscoveryKind::Offer,
			..self.clone()
		}
	}

	fn answers(&self, request: &DiscoveryMessage) -> bool {
		self.kind == DiscoveryKind::Offer
			&& self.frame1 == request.frame1
			&& self.frame2 == request.frame2
			&& self.request_id == request.request_id
	}
}

/// A message delivered to a [`Window`].
#[derive(Debug)]
pub struct WindowMessage {
	/// Payload.
	pub data: Value,
	/// Origin of the sending context.
	pub origin: String,
	/// Where replies go.
	pub source: WindowHandle,
	/// Transferred ports.
	pub ports: Vec<Port>,
}

/// Addressable handle to a context's top-level inbox.
#[derive(Debug, Clone)]
pub struct WindowHandle {
	origin: Arc<str>,
	tx: mpsc::UnboundedSender<WindowMessage>,
}

impl WindowHandle {
	/// Origin of the context owning the window.
	pub fn origin(&self) -> &str {
		&self.origin
	}

	/// Delivers a message to this window on behalf of `from`.
	pub fn post(&self, data: Value, from: &WindowHandle, ports: Vec<Port>) -> bool {
		let msg = WindowMessage {
			data,
			origin: from.origin.to_string(),
			source: from.clone(),
			ports,
		};
		self.tx.send(msg).is_ok()
	}
}

/// A context's top-level inbox.
#[derive(Debug)]
pub struct Window {
	handle: WindowHandle,
	rx: mpsc::UnboundedReceiver<WindowMessage>,
}

impl Window {
	/// Creates a window for a context served from `origin`.
	pub fn new(origin: impl Into<Arc<str>>) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self {
			handle: WindowHandle { origin: origin.into(), tx },
			rx,
		}
	}

	/// Handle others use to post to this window.
	pub fn handle(&self) -> WindowHandle {
		self.handle.clone()
	}

	/// Waits for the next message.
	pub async fn recv(&mut self) -> Option<WindowMessage> {
		self.rx.recv().await
	}
}

/// A link endpoint handed to the host.
#[derive(Debug)]
pub struct FrameConnected {
	/// Role of the context on the other end.
	pub role: FrameRole,
	/// Requester's frame id, if it sent one.
	pub source_id: Option<String>,
	/// The host's end of the link.
	pub port: Port,
}

struct AllowedRequest {
	frame1: FrameRole,
	frame2: FrameRole,
	origin: String,
}

/// Host-side discovery endpoint.
pub struct PortProvider {
	host: WindowHandle,
	allowed: Vec<AllowedRequest>,
	handled: HashSet<String>,
	reported: HashSet<String>,
	sidebar_host: Option<(Port, Port)>,
	sidebar_host_tx: PortSender,
	connected: mpsc::UnboundedSender<FrameConnected>,
}

impl PortProvider {
	/// Creates a provider answering on behalf of `host`, trusting `apps_origin` for sidebar and
	/// notebook requests.
	///
	/// Returns the stream of host-side link endpoints.
	pub fn new(host: WindowHandle, apps_origin: &str) -> (Self, mpsc::UnboundedReceiver<FrameConnected>) {
		let (connected, rx) = mpsc::unbounded_channel();
		let (port1, port2) = MessageChannel::new();
		let allow = |frame1, frame2, origin: &str| AllowedRequest {
			frame1,
			frame2,
			origin: origin.to_string(),
		};
		let provider = Self {
			host,
			allowed: vec![
				allow(FrameRole::Guest, FrameRole::Host, ANY_ORIGIN),
				allow(FrameRole::Guest, FrameRole::Sidebar, ANY_ORIGIN),
				allow(FrameRole::Sidebar, FrameRole::Host, apps_origin),
				allow(FrameRole::Notebook, FrameRole::Sidebar, apps_origin),
			],
			handled: HashSet::new(),
			reported: HashSet::new(),
			sidebar_host_tx: port2.sender(),
			sidebar_host: Some((port1, port2)),
			connected,
		};
		(provider, rx)
	}

	/// Creates a provider trusting the configured apps origin.
	pub fn from_config(
		host: WindowHandle,
		config: &DiscoverySection,
	) -> (Self, mpsc::UnboundedReceiver<FrameConnected>) {
		Self::new(host, &config.apps_origin)
	}

	fn report(&mut self, message: String) {
		if self.reported.insert(message.clone()) {
			tracing::warn!("{message}");
		}
	}

	fn is_allowed(&self, request: &DiscoveryMessage, origin: &str) -> bool {
		self.allowed.iter().any(|allowed| {
			allowed.frame1 == request.frame1
				&& allowed.frame2 == request.frame2
				&& (allowed.origin == ANY_ORIGIN || allowed.origin == origin)
		})
	}

	/// Services one message delivered to the host window.
	pub fn handle_message(&mut self, msg: WindowMessage) {
		let Some(request) = DiscoveryMessage::parse(&msg.data) else {
			return;
		};
		if request.kind != DiscoveryKind::Request {
			return;
		}

		if !self.is_allowed(&request, &msg.origin) {
			self.report(format!(
				"ignored invalid port request for channel {}-{} from {}",
				request.frame1, request.frame2, msg.origin
			));
			return;
		}
		if !self.handled.insert(request.request_id.clone()) {
			return;
		}

		let offer = request.to_offer();
		let is_sidebar_host = request.frame1 == FrameRole::Sidebar && request.frame2 == FrameRole::Host;
		let (port1, port2) = if is_sidebar_host {
			match self.sidebar_host.take() {
				Some(pair) => pair,
				None => {
					self.report("sidebar-host channel was already handed out".to_string());
					return;
				}
			}
		} else {
			MessageChannel::new()
		};

		tracing::debug!(frame1 = %request.frame1, frame2 = %request.frame2, source_id = ?request.source_id, "offering port");
		msg.source.post(offer.to_value(), &self.host, vec![port1]);

		match request.frame2 {
			FrameRole::Sidebar => {
				self.sidebar_host_tx.post_with_ports(offer.to_value(), vec![port2]);
			}
			FrameRole::Host => {
				let _ = self.connected.send(FrameConnected {
					role: request.frame1,
					source_id: request.source_id,
					port: port2,
				});
			}
			FrameRole::Guest | FrameRole::Notebook => {}
		}
	}

	/// Services the host window until cancelled.
	pub async fn run(mut self, mut window: Window, cancel: CancellationToken) {
		loop {
			let msg = tokio::select! {
				biased;
				_ = cancel.cancelled() => break,
				msg = window.recv() => msg,
			};
			let Some(msg) = msg else {
				break;
			};
			self.handle_message(msg);
		}
	}
}

/// Client-side discovery: asks the host for a port to a target role.
pub struct PortFinder {
	host: WindowHandle,
	window: Window,
	source: FrameRole,
	source_id: Option<String>,
	poll_interval: Duration,
	timeout: Duration,
}

impl PortFinder {
	/// Creates a finder for a context playing `source`, reachable through `window`.
	pub fn new(host: WindowHandle, window: Window, source: FrameRole) -> Self {
		Self {
			host,
			window,
			source,
			source_id: None,
			poll_interval: Duration::from_millis(250),
			timeout: Duration::from_secs(20),
		}
	}

	/// Sets the frame id forwarded with requests.
	#[must_use]
	pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
		self.source_id = Some(source_id.into());
		self
	}

	/// Sets how often the request is repeated and when to give up.
	#[must_use]
	pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
		self.poll_interval = poll_interval;
		self.timeout = timeout;
		self
	}

	/// Takes poll interval and timeout from the configuration file.
	#[must_use]
	pub fn with_config(self, config: &DiscoverySection) -> Self {
		self.with_timing(config.poll_interval(), config.timeout())
	}

	/// Requests a port connected to `target`, repeating until an offer arrives.
	pub async fn discover(&mut self, target: FrameRole) -> Result<Port> {
		let request = DiscoveryMessage {
			frame1: self.source,
			frame2: target,
			kind: DiscoveryKind::Request,
			request_id: uuid::Uuid::new_v4().simple().to_string(),
			source_id: self.source_id.clone(),
		};
		let own = self.window.handle();
		let deadline = tokio::time::sleep(self.timeout);
		tokio::pin!(deadline);
		let mut poll = tokio::time::interval(self.poll_interval);

		loop {
			tokio::select! {
				_ = &mut deadline => {
					tracing::warn!(%target, "port discovery timed out");
					return Err(Error::DiscoveryTimeout(target));
				}
				_ = poll.tick() => {
					self.host.post(request.to_value(), &own, Vec::new());
				}
				msg = self.window.recv() => {
					let Some(mut msg) = msg else {
						return Err(Error::Closed);
					};
					let is_answer = DiscoveryMessage::parse(&msg.data).is_some_and(|offer| offer.answers(&request));
					if is_answer && let Some(port) = msg.ports.pop() {
						tracing::debug!(%target, "port discovered");
						return Ok(port);
					}
				}
			}
		}
	}
}
