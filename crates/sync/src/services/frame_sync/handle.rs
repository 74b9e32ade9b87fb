use margin_proto::Tag;
use margin_proto::events::SidebarToHost;
use margin_rpc::Port;
use tokio::sync::{mpsc, oneshot};

use super::commands::FrameSyncCmd;
use super::registry::FrameSnapshot;
use crate::error::{Result, SyncError};

/// Handle for communicating with the [`super::FrameSyncService`].
#[derive(Clone, Debug)]
pub struct FrameSyncHandle {
	tx: mpsc::Sender<FrameSyncCmd>,
}

impl FrameSyncHandle {
	/// Wraps a command sender in a typed handle.
	pub fn new(tx: mpsc::Sender<FrameSyncCmd>) -> Self {
		Self { tx }
	}

	async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> FrameSyncCmd) -> Result<T> {
		let (reply, rx) = oneshot::channel();
		self.tx.send(cmd(reply)).await.map_err(|_| SyncError::Shutdown)?;
		rx.await.map_err(|_| SyncError::Shutdown)
	}

	/// Binds the host link. Guest offers relayed by the host are connected automatically.
	pub async fn connect_host(&self, port: Port) -> Result<()> {
		self.request(|reply| FrameSyncCmd::ConnectHost { port, reply }).await?
	}

	/// Binds a guest link directly, bypassing the host relay.
	pub async fn connect_guest(&self, port: Port, source_id: Option<String>) -> Result<()> {
		self.request(|reply| FrameSyncCmd::ConnectGuest { port, source_id, reply })
			.await?
	}

	pub async fn hover_annotations(&self, tags: Vec<Tag>) -> Result<()> {
		self.tx
			.send(FrameSyncCmd::HoverAnnotations { tags })
			.await
			.map_err(|_| SyncError::Shutdown)
	}

	pub async fn scroll_to_annotation(&self, tag: Tag) -> Result<()> {
		self.request(|reply| FrameSyncCmd::ScrollToAnnotation { tag, reply }).await?
	}

	pub async fn set_highlights_visible(&self, visible: bool) -> Result<()> {
		self.tx
			.send(FrameSyncCmd::SetHighlightsVisible { visible })
			.await
			.map_err(|_| SyncError::Shutdown)
	}

	pub async fn notify_host(&self, event: SidebarToHost) -> Result<()> {
		self.request(|reply| FrameSyncCmd::NotifyHost { event, reply }).await?
	}

	/// Current guest links, including retained ones.
	pub async fn frames(&self) -> Result<Vec<FrameSnapshot>> {
		self.request(|reply| FrameSyncCmd::Frames { reply }).await
	}

	/// Closes every link and stops the actor. Idempotent.
	pub async fn shutdown(&self) {
		let _ = self.request(|reply| FrameSyncCmd::Shutdown { reply }).await;
	}
}
