//! Actor services driving the store.

pub mod anchoring;
pub mod frame_sync;
pub mod streamer;

#[cfg(test)]
mod tests;
