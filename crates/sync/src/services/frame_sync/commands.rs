use margin_proto::Tag;
use margin_proto::events::SidebarToHost;
use margin_rpc::Port;
use tokio::sync::oneshot;

use super::registry::FrameSnapshot;
use crate::error::Result;

/// Commands for the frame sync actor.
#[derive(Debug)]
pub enum FrameSyncCmd {
	/// Bind the link to the host frame. Replaces any previous host link.
	ConnectHost {
		port: Port,
		reply: oneshot::Sender<Result<()>>,
	},
	/// Bind a link to a guest frame.
	ConnectGuest {
		port: Port,
		/// Frame id the guest announced during discovery.
		source_id: Option<String>,
		reply: oneshot::Sender<Result<()>>,
	},
	/// Hover annotations in every guest.
	HoverAnnotations { tags: Vec<Tag> },
	/// Scroll the guest showing an annotation to it, navigating segments first if needed.
	ScrollToAnnotation {
		tag: Tag,
		reply: oneshot::Sender<Result<()>>,
	},
	SetHighlightsVisible { visible: bool },
	NotifyHost {
		event: SidebarToHost,
		reply: oneshot::Sender<Result<()>>,
	},
	Frames {
		reply: oneshot::Sender<Vec<FrameSnapshot>>,
	},
	/// Close every link and stop.
	Shutdown { reply: oneshot::Sender<()> },
}
