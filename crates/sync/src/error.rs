use thiserror::Error;

/// Errors surfaced by the synchronization services.
#[derive(Debug, Error)]
pub enum SyncError {
	/// The addressed service has stopped.
	#[error("service is shut down")]
	Shutdown,
	#[error(transparent)]
	Rpc(#[from] margin_rpc::Error),
	/// No annotation is known under the given id or tag.
	#[error("unknown annotation {0}")]
	UnknownAnnotation(String),
	/// The push endpoint could not be reached or rejected the connection.
	#[error("transport: {0}")]
	Transport(String),
	#[error("invalid push url: {0}")]
	Url(#[from] url::ParseError),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
