//! Scheduling primitives shared by the sync services.
//!
//! * [`TimerSet`]: cancelable delayed tasks owned by a component and cancelled with it
//! * [`Debounce`]: a restartable trailing deadline for actor select loops
//! * [`GenerationClock`] / [`GenerationToken`]: supersede stale work after a restart
//! * [`ReconnectPolicy`]: exponential backoff with a retry budget

mod backoff;
mod timer;
mod token;

pub use backoff::ReconnectPolicy;
pub use timer::{Debounce, TimerHandle, TimerSet};
pub use token::{GenerationClock, GenerationToken};
