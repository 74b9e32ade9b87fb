//! Frame registry and annotation router.
//!
//! # Purpose
//!
//! Owns the sidebar's channel to the host and one channel per connected guest frame. Keeps
//! every guest loaded with exactly the annotations that belong to its document and relays user
//! intent (hover, scroll, selection, creation) between guests and the collection.
//!
//! # Mental model
//!
//! The service is an actor. Channel traffic from every link is funneled into one queue, each
//! event tagged with the generation of the link that produced it, so a replaced or closed link
//! can never act on the registry again. After any store revision the router recomputes which
//! frames should hold which annotations and sends only the difference.
//!
//! # Key types
//!
//! | Type | Role |
//! |---|---|
//! | [`FrameSyncService`] | The actor |
//! | [`FrameSyncHandle`] | Typed command sender |
//! | [`FrameSnapshot`] | Introspection view of one guest |
//!
//! # Invariants
//!
//! - A guest is never sent an annotation it already holds, nor a reply.
//! - A persistent guest that returns on the same URI gets its previous annotations back
//!   without a store round trip.
//! - Anchoring reports reach the store in batches, one revision per batch.

mod commands;
mod handle;
mod registry;
mod routing;
mod service;

pub use commands::FrameSyncCmd;
pub use handle::FrameSyncHandle;
pub use registry::{FrameSnapshot, GuestState};
pub use routing::{FrameDiff, RouteFrame, candidate_frames, frames_for, plan, public_count};
pub use service::{FrameSyncConfig, FrameSyncService};
