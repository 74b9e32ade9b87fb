//! Push-stream synchronization.
//!
//! # Purpose
//!
//! Keeps one connection to the server's push endpoint and reconciles its change notifications
//! with the annotation collection.
//!
//! # Mental model
//!
//! ```text
//! Disconnected ──connect──> Connecting ──opened──> Open ──unexpected close──> Reconnecting{n}
//!                               ^                                                  │
//!                               └──────────────── retry timer ─────────────────────┘
//!                                                                                  │ budget spent
//!                                                                                  v
//!                                                                               GaveUp
//! ```
//!
//! Every attempt and every scheduled retry carries a generation. Results from superseded
//! generations are dropped, so an explicit `reconnect` can never race an older attempt.
//!
//! In buffered mode, notifications land in the store's pending sets until
//! `apply_pending_updates`. In immediate mode they are applied on arrival and the changed
//! annotations stay highlighted for a short while.
//!
//! # Invariants
//!
//! - Registered config messages are resent, in registration order, on every open.
//! - Closes with code 1000 or 1001 never schedule a retry.
//! - A changed user id forces a reconnect once `connect` has been called.

mod commands;
mod handle;
mod service;
pub mod transport;

pub use commands::StreamerCmd;
pub use handle::StreamerHandle;
pub use service::{ConnectionState, HIGHLIGHT_DURATION, StreamerConfig, StreamerService};
pub use transport::{Connector, JsonLinesConnector, StaticEndpoint, StreamEndpoint, Transport, TransportEvent, TransportPeer};
