//! Core domain models, storage repositories and time abstractions.
//!
//! Provides strongly-typed identifiers, the domain event feed consumed by the
//! delivery engine, the persisted delivery record and its state machine, and
//! the PostgreSQL repositories backing the retry store. All other crates
//! depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    ActingUser, DeliveryId, DeliveryRecord, DeliveryStatus, DestinationKind, DomainEvent,
    EndpointId, EventId, EventSource, EventType, TeamId, TeamRef, UserId, WebhookEndpoint,
};
pub use time::{Clock, RealClock, TestClock};
