//! Producer side of a session: the long-poll loop, offset tracking and the
//! retry backoff.

pub mod backoff;
pub(crate) mod fetch;
pub mod offset;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use offset::OffsetTracker;
