//! Point-to-point call/event channels between isolated contexts.
//!
//! This crate provides the messaging layer every pair of contexts (host, sidebar, guests) talks
//! over:
//! * [`MessageChannel`]: an entangled pair of transferable [`Port`]s
//! * [`Channel`]: a typed call/notify link bound to one port
//! * [`PortProvider`] / [`PortFinder`]: the discovery handshake that hands ports out
//! * [`protocol`]: the frame-rpc envelope spoken on the wire

#![warn(missing_docs)]

pub mod channel;
pub mod discovery;
pub mod error;
pub mod port;
pub mod protocol;

pub use channel::{Channel, ChannelEvent, ChannelEvents, Responder};
pub use discovery::{
	DiscoveryKind, DiscoveryMessage, FrameConnected, FrameRole, PortFinder, PortProvider, Window,
	WindowHandle, WindowMessage,
};
pub use error::{Error, Result};
pub use port::{MessageChannel, Port, PortMessage, PortSender};
pub use protocol::{CounterIdGen, RpcFrame};
