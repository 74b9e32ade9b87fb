//! Wire types for cross-context annotation sync.
//!
//! # Purpose
//!
//! Everything that crosses a context boundary is defined here: annotation records as the server
//! and the sidebar see them, the reduced [`FormattedAnnotation`] shape that guests receive, frame
//! document descriptions, the four typed event contracts spoken over channels, and the push
//! transport messages exchanged with the server.
//!
//! # Mental model
//!
//! The sidebar owns full [`Annotation`] records. Guests are untrusted and only ever see
//! [`FormattedAnnotation`]. Each link between two contexts speaks one direction-specific event
//! enum per side ([`events::GuestToSidebar`], [`events::SidebarToGuest`], and so on), so a method
//! name outside the contract cannot be expressed.
//!
//! # Key types
//!
//! | Type | Meaning |
//! |---|---|
//! | [`Annotation`] | Full record owned by the sidebar; local-only fields are `$`-prefixed on the wire |
//! | [`Tag`] | Session-local identity assigned on first sight, never reused |
//! | [`FrameId`] | Guest frame identity; `None` is the main frame filling the host |
//! | [`DocumentInfo`] | What a guest reports about its loaded document |
//! | [`push::ServerMessage`] | Classified message from the push endpoint |

pub mod cfi;
pub mod events;
pub mod push;
pub mod types;

pub use types::*;
