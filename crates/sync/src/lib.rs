//! Sidebar-side annotation synchronization.
//!
//! # Purpose
//!
//! Holds the canonical annotation collection and keeps it in step with two outside worlds: the
//! guest frames that display annotations in documents, and the server's push stream.
//!
//! # Mental model
//!
//! ```text
//!   guests ──channel──> FrameSyncService ──┐
//!                                          ├──> StoreHandle (single source of truth)
//!   server ──push────> StreamerService ────┘          │
//!                                                     └── revision watch ──> routing pass
//! ```
//!
//! The [`store::Store`] is plain data mutated through [`store::StoreHandle::update`]. Each
//! update bumps a revision counter that the actors watch, so a burst of mutations wakes them
//! once.
//!
//! # Key types
//!
//! | Type | Role |
//! |---|---|
//! | [`store::StoreHandle`] | Shared owner of the collection and its satellite state |
//! | [`services::frame_sync::FrameSyncHandle`] | Guest and host links, annotation routing |
//! | [`services::streamer::StreamerHandle`] | Push connection |
//! | [`SyncError`] | Errors returned to handle callers |

pub mod error;
pub mod services;
pub mod store;

pub use error::{Result, SyncError};
pub use services::frame_sync::{FrameSyncConfig, FrameSyncHandle, FrameSyncService};
pub use services::streamer::{ConnectionState, StreamerConfig, StreamerHandle, StreamerService};
pub use store::{Route, StoreHandle};
