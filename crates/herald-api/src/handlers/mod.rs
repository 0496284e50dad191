//! HTTP request handlers for the Herald API.
//!
//! - `health` - liveness and store health probes
//! - `drain` - operator-triggered retry drain
//! - `events` - event feed running the immediate dispatch

pub mod drain;
pub mod events;
pub mod health;

pub use drain::trigger_drain;
pub use events::ingest_event;
pub use health::{health_check, liveness_check};
