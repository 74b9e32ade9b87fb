//! Push transports.
//!
//! The streamer only needs text frames in both directions and a close signal, so a transport
//! is a pair of channels produced by a [`Connector`]. Where to connect, and with which
//! credentials, comes from a [`StreamEndpoint`].

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{Result, SyncError};

/// Close code for a connection ended on purpose.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code for a peer that is going away, e.g. a server restart.
pub const GOING_AWAY: u16 = 1001;

/// Something that happened on an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
	Message(String),
	/// The connection ended. `code` follows websocket close codes when the transport has them.
	Closed {
		code: Option<u16>,
	},
	Error(String),
}

impl TransportEvent {
	/// True for closes that should not trigger a reconnect.
	pub fn is_normal_close(&self) -> bool {
		matches!(self, Self::Closed { code: Some(NORMAL_CLOSURE | GOING_AWAY) })
	}
}

/// An open transport. Dropping `outgoing` closes the connection.
#[derive(Debug)]
pub struct Transport {
	pub outgoing: mpsc::UnboundedSender<String>,
	pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The far side of a [`Transport`]: frames sent by the client and a sender for server events.
#[derive(Debug)]
pub struct TransportPeer {
	pub sent: mpsc::UnboundedReceiver<String>,
	pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
	/// Creates a transport and the peer end that drives it.
	pub fn pair() -> (Self, TransportPeer) {
		let (outgoing, sent) = mpsc::unbounded_channel();
		let (events, incoming) = mpsc::unbounded_channel();
		(Self { outgoing, incoming }, TransportPeer { sent, events })
	}
}

/// Opens push transports.
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(&self, url: &Url) -> Result<Transport>;
}

/// Resolves the push endpoint and the credentials to present to it.
#[async_trait]
pub trait StreamEndpoint: Send + Sync {
	async fn websocket_url(&self) -> Result<Url>;

	/// Token for the current user, if any.
	async fn access_token(&self) -> Result<Option<String>>;
}

/// Endpoint with a fixed URL and optional token.
#[derive(Debug, Clone)]
pub struct StaticEndpoint {
	url: Url,
	token: Option<String>,
}

impl StaticEndpoint {
	pub fn new(url: Url, token: Option<String>) -> Self {
		Self { url, token }
	}

	/// Parses `url`.
	pub fn parse(url: &str, token: Option<String>) -> Result<Self> {
		Ok(Self::new(Url::parse(url)?, token))
	}
}

#[async_trait]
impl StreamEndpoint for StaticEndpoint {
	async fn websocket_url(&self) -> Result<Url> {
		Ok(self.url.clone())
	}

	async fn access_token(&self) -> Result<Option<String>> {
		Ok(self.token.clone())
	}
}

/// Appends `access_token` to the endpoint URL when a token is available.
pub async fn authorized_url(endpoint: &dyn StreamEndpoint) -> Result<Url> {
	let mut url = endpoint.websocket_url().await?;
	let token = endpoint.access_token().await.inspect_err(|error| {
		tracing::error!(%error, "failed to fetch token for push authentication");
	})?;
	if let Some(token) = token {
		url.query_pairs_mut().append_pair("access_token", &token);
	}
	Ok(url)
}

/// Newline-delimited JSON over TCP.
///
/// The first line written is the request target (path and query) of the URL, so servers can
/// authenticate the `access_token` parameter. Every later line is one message.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesConnector;

#[async_trait]
impl Connector for JsonLinesConnector {
	async fn connect(&self, url: &Url) -> Result<Transport> {
		let host = url
			.host_str()
			.ok_or_else(|| SyncError::Transport(format!("no host in {url}")))?;
		let port = url
			.port_or_known_default()
			.ok_or_else(|| SyncError::Transport(format!("no port for {url}")))?;
		let stream = TcpStream::connect((host, port)).await?;
		let (reader, mut writer) = stream.into_split();

		let mut target = url.path().to_string();
		if let Some(query) = url.query() {
			target.push('?');
			target.push_str(query);
		}
		target.push('\n');
		writer.write_all(target.as_bytes()).await?;
		tracing::debug!(%host, port, "push transport connected");

		let (transport, TransportPeer { mut sent, events }) = Transport::pair();

		tokio::spawn(async move {
			let mut lines = BufReader::new(reader).lines();
			loop {
				let event = match lines.next_line().await {
					Ok(Some(line)) if line.trim().is_empty() => continue,
					Ok(Some(line)) => TransportEvent::Message(line),
					Ok(None) => TransportEvent::Closed { code: None },
					Err(error) => TransportEvent::Error(error.to_string()),
				};
				let last = !matches!(event, TransportEvent::Message(_));
				if events.send(event).is_err() || last {
					return;
				}
			}
		});

		tokio::spawn(async move {
			while let Some(mut text) = sent.recv().await {
				text.push('\n');
				if let Err(error) = writer.write_all(text.as_bytes()).await {
					tracing::debug!(%error, "push transport write failed");
					break;
				}
			}
			let _ = writer.shutdown().await;
		});

		Ok(transport)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use tokio::io::AsyncReadExt;
	use tokio::net::TcpListener;

	use super::*;

	#[test]
	fn close_classification() {
		assert!(TransportEvent::Closed { code: Some(1000) }.is_normal_close());
		assert!(TransportEvent::Closed { code: Some(1001) }.is_normal_close());
		assert!(!TransportEvent::Closed { code: Some(1006) }.is_normal_close());
		assert!(!TransportEvent::Closed { code: None }.is_normal_close());
		assert!(!TransportEvent::Error("reset".into()).is_normal_close());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn token_lands_in_query() {
		let endpoint = StaticEndpoint::parse("ws://example.com/ws", Some("secret".into())).unwrap();
		let url = authorized_url(&endpoint).await.unwrap();
		assert_eq!(url.as_str(), "ws://example.com/ws?access_token=secret");

		let anonymous = StaticEndpoint::parse("ws://example.com/ws", None).unwrap();
		assert_eq!(authorized_url(&anonymous).await.unwrap().query(), None);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn json_lines_round_trip() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let server = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			socket.write_all(b"{\"type\":\"whoyouare\"}\n").await.unwrap();
			socket.shutdown().await.unwrap();
			let mut received = String::new();
			socket.read_to_string(&mut received).await.unwrap();
			received
		});

		let url = Url::parse(&format!("ws://127.0.0.1:{port}/ws?access_token=t")).unwrap();
		let mut transport = JsonLinesConnector.connect(&url).await.unwrap();
		transport.outgoing.send("{\"type\":\"whoami\"}".into()).unwrap();

		assert_eq!(
			transport.incoming.recv().await,
			Some(TransportEvent::Message("{\"type\":\"whoyouare\"}".into()))
		);
		assert_eq!(transport.incoming.recv().await, Some(TransportEvent::Closed { code: None }));

		drop(transport);
		assert_eq!(server.await.unwrap(), "/ws?access_token=t\n{\"type\":\"whoami\"}\n");
	}
}
