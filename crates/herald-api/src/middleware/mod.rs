//! HTTP middleware for request processing.
//!
//! Provides the operator secret check guarding every `/internal/*` route.
pub mod auth;
