//! Outbound webhook delivery and retry engine.
//!
//! Turns domain events into destination-specific payloads, attempts delivery
//! and durably retries failures under a bounded time budget.
//!
//! # Architecture
//!
//! 1. **Dispatch** - [`Dispatcher`] resolves the team's subscribed endpoints,
//!    [`classify`]s each URL, formats the payload and attempts delivery once.
//! 2. **Enqueue** - failed attempts are written to the retry store with a due
//!    time computed by [`RetryPolicy`]. One record exists per (endpoint,
//!    event) pair.
//! 3. **Drain** - [`DrainScheduler`] is triggered externally, claims due
//!    records oldest-first and retries them until its deadline.
//!
//! Claims are conditional updates, so overlapping drain runs never attempt
//! the same record twice.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use herald_core::{Clock, RealClock};
//! use herald_delivery::{
//!     storage::mock::MockDeliveryStorage, ClientConfig, DeliveryClient, DrainConfig,
//!     DrainScheduler, PayloadFormatter, RetryPolicy,
//! };
//!
//! # async fn example() -> herald_delivery::Result<()> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let scheduler = DrainScheduler::new(
//!     Arc::new(MockDeliveryStorage::new()),
//!     Arc::new(DeliveryClient::new(ClientConfig::default())?),
//!     PayloadFormatter::default(),
//!     RetryPolicy::default(),
//!     clock.clone(),
//!     DrainConfig::default(),
//! )?;
//!
//! let processed = scheduler.drain(clock.now() + Duration::from_secs(50)).await?;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod client;
pub mod dispatcher;
pub mod drain;
pub mod error;
pub mod format;
pub mod retry;
pub mod storage;

pub use classify::classify;
pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResult};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use drain::{DrainConfig, DrainReport, DrainScheduler};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use format::{FormatterConfig, PayloadFormatter, WirePayload};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};

/// Default number of records fetched per drain query.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default number of attempts in flight during a drain.
pub const DEFAULT_DRAIN_CONCURRENCY: usize = 4;
