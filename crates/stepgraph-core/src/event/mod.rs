//! Run event bus.
//!
//! The executor publishes a `RunEvent` for every step transition; observers
//! subscribe to the whole stream or to a single run.

pub mod bus;

pub use bus::{EventBus, RunSubscription};
