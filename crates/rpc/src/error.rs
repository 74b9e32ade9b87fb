//! Error types for channels and discovery.

use thiserror::Error;

use crate::discovery::FrameRole;

/// Errors returned to the caller awaiting a channel operation.
#[derive(Debug, Error)]
pub enum Error {
	/// The channel was destroyed or the peer went away before a reply arrived.
	#[error("channel closed")]
	Closed,

	/// `connect` was called on a channel that is already bound to a port.
	#[error("channel is already connected")]
	AlreadyConnected,

	/// The peer handled the call and reported a failure.
	#[error("remote error: {0}")]
	Remote(String),

	/// A payload could not be encoded or a reply could not be decoded.
	#[error("codec error: {0}")]
	Codec(#[from] serde_json::Error),

	/// No offer arrived for a discovery request in time.
	#[error("timed out discovering {0} port")]
	DiscoveryTimeout(FrameRole),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;
