use margin_proto::AnnotationId;
use margin_proto::push::ClientMessage;
use tokio::sync::{mpsc, oneshot, watch};

use super::commands::StreamerCmd;
use super::service::ConnectionState;
use crate::error::{Result, SyncError};

/// Handle for communicating with the [`super::StreamerService`].
#[derive(Clone, Debug)]
pub struct StreamerHandle {
	tx: mpsc::Sender<StreamerCmd>,
	state: watch::Receiver<ConnectionState>,
	client_id: String,
}

impl StreamerHandle {
	pub fn new(tx: mpsc::Sender<StreamerCmd>, state: watch::Receiver<ConnectionState>, client_id: String) -> Self {
		Self { tx, state, client_id }
	}

	async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> StreamerCmd) -> Result<T> {
		let (reply, rx) = oneshot::channel();
		self.tx.send(cmd(reply)).await.map_err(|_| SyncError::Shutdown)?;
		rx.await.map_err(|_| SyncError::Shutdown)
	}

	/// Starts connecting. Returns once the attempt is under way, not once it is open.
	pub async fn connect(&self) -> Result<()> {
		self.request(|reply| StreamerCmd::Connect { reply }).await
	}

	pub async fn reconnect(&self) -> Result<()> {
		self.request(|reply| StreamerCmd::Reconnect { reply }).await
	}

	pub async fn disconnect(&self) -> Result<()> {
		self.request(|reply| StreamerCmd::Disconnect { reply }).await
	}

	/// Registers `message` under `key`. Sent now if connected, and again after every reconnect.
	pub async fn set_config(&self, key: impl Into<String>, message: ClientMessage) -> Result<()> {
		let key = key.into();
		self.request(|reply| StreamerCmd::SetConfig { key, message, reply })
			.await
	}

	/// Merges every buffered change. Returns the ids of applied updates.
	pub async fn apply_pending_updates(&self) -> Result<Vec<AnnotationId>> {
		self.request(|reply| StreamerCmd::ApplyPendingUpdates { reply }).await
	}

	/// Id sent to the server so it can skip echoing this client's own changes.
	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	/// Connection state changes.
	pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
		self.state.clone()
	}

	/// Closes the connection and stops the actor. Idempotent.
	pub async fn shutdown(&self) {
		let _ = self.request(|reply| StreamerCmd::Shutdown { reply }).await;
	}
}
