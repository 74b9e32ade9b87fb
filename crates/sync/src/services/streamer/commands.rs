use margin_proto::AnnotationId;
use margin_proto::push::ClientMessage;
use tokio::sync::oneshot;

/// Commands for the streamer actor.
#[derive(Debug)]
pub enum StreamerCmd {
	/// Open the push connection unless it is already open or opening.
	Connect { reply: oneshot::Sender<()> },
	/// Tear down any connection and open a fresh one.
	Reconnect { reply: oneshot::Sender<()> },
	Disconnect { reply: oneshot::Sender<()> },
	/// Register a message that is resent on every connection, replacing one with the same key.
	SetConfig {
		key: String,
		message: ClientMessage,
		reply: oneshot::Sender<()>,
	},
	/// Merge buffered changes into the collection.
	ApplyPendingUpdates {
		reply: oneshot::Sender<Vec<AnnotationId>>,
	},
	Shutdown { reply: oneshot::Sender<()> },
}
