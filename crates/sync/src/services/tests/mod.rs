//! Service-level tests for the sync actors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use margin_proto::events::{GuestToSidebar, HostToSidebar, SidebarToGuest, SidebarToHost};
use margin_proto::{Annotation, DocumentInfo, Profile, Selector, Target};
use margin_rpc::{Channel, ChannelEvent, ChannelEvents, MessageChannel};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use crate::error::{Result, SyncError};
use crate::services::frame_sync::FrameSyncHandle;
use crate::services::streamer::{Connector, Transport, TransportPeer};
use crate::store::StoreHandle;


/// Lets every runnable task settle. Time is paused, so this only advances the clock once idle.
pub(super) async fn settle() {
	tokio::time::sleep(Duration::from_millis(1)).await;
}

/// The far end of a link as a test double sees it.
pub(super) struct TestPeer<Out, In> {
	pub channel: Channel<Out, In>,
	pub events: ChannelEvents<In>,
}

impl<Out, In> TestPeer<Out, In>
where
	Out: serde::Serialize,
	In: serde::de::DeserializeOwned + Clone + Send + 'static,
{
	fn bind(port: margin_rpc::Port) -> Self {
		let (channel, events) = Channel::new();
		channel.connect(port).expect("bind test peer");
		Self { channel, events }
	}

	pub fn send(&self, event: Out) {
		self.channel.notify(&event).expect("send to sidebar");
	}

	/// Next event payload, skipping lifecycle noise. `None` on close or after 500ms.
	pub async fn recv_event(&mut self) -> Option<In> {
		loop {
			let next = tokio::time::timeout(Duration::from_millis(500), self.events.recv());
			match next.await.ok().flatten()? {
				ChannelEvent::Event { event, .. } => return Some(event),
				ChannelEvent::Connected | ChannelEvent::Foreign(_) => continue,
				ChannelEvent::Closed => return None,
			}
		}
	}

	/// Event payloads already delivered.
	pub fn drain(&mut self) -> Vec<In> {
		let mut out = Vec::new();
		while let Some(event) = self.events.try_recv() {
			if let ChannelEvent::Event { event, .. } = event {
				out.push(event);
			}
		}
		out
	}
}

pub(super) type TestGuest = TestPeer<GuestToSidebar, SidebarToGuest>;
pub(super) type TestHost = TestPeer<HostToSidebar, SidebarToHost>;

/// Connects a guest and swallows the greeting it gets on connect.
pub(super) async fn connect_guest(sync: &FrameSyncHandle, id: Option<&str>) -> TestGuest {
	let (near, far) = MessageChannel::new();
	sync.connect_guest(near, id.map(String::from))
		.await
		.expect("connect guest");
	let mut guest = TestGuest::bind(far);
	settle().await;
	guest.drain();
	guest
}

pub(super) async fn connect_host(sync: &FrameSyncHandle) -> TestHost {
	let (near, far) = MessageChannel::new();
	sync.connect_host(near).await.expect("connect host");
	let mut host = TestHost::bind(far);
	settle().await;
	host.drain();
	host
}

pub(super) fn document(uri: &str) -> DocumentInfo {
	DocumentInfo {
		uri: uri.into(),
		..DocumentInfo::default()
	}
}

/// A saved annotation with a text selector, so it waits for a guest to anchor it.
pub(super) fn anchorable(id: &str, uri: &str) -> Annotation {
	let mut record = Annotation::saved(id, uri);
	record.target = Some(vec![Target::with_selectors(
		uri,
		vec![Selector(json!({"type": "TextQuoteSelector", "exact": id}))],
	)]);
	record
}

pub(super) fn log_in(store: &StoreHandle, userid: &str) {
	store.update(|s| {
		s.update_profile(Profile {
			userid: Some(userid.into()),
			..Profile::default()
		})
	});
}

/// In-memory push connector. Every successful connect hands the server side to the test.
pub(super) struct MemoryConnector {
	pub attempts: Arc<Mutex<Vec<(Instant, Url)>>>,
	pub refuse: Arc<Mutex<bool>>,
	peers: mpsc::UnboundedSender<TransportPeer>,
}

impl MemoryConnector {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportPeer>) {
		let (peers, rx) = mpsc::unbounded_channel();
		let connector = Self {
			attempts: Arc::default(),
			refuse: Arc::default(),
			peers,
		};
		(connector, rx)
	}
}

#[async_trait]
impl Connector for MemoryConnector {
	async fn connect(&self, url: &Url) -> Result<Transport> {
		self.attempts.lock().push((Instant::now(), url.clone()));
		if *self.refuse.lock() {
			return Err(SyncError::Transport("connection refused".into()));
		}
		let (transport, peer) = Transport::pair();
		let _ = self.peers.send(peer);
		Ok(transport)
	}
}
