//! Destination-specific payload formatting.
//!
//! Formatting is pure: the same event and destination always yield the same
//! wire payload. Generic endpoints receive a stable JSON envelope while Discord
//! webhooks receive an embed document built per event type.

use bytes::Bytes;
use herald_core::{DestinationKind, DomainEvent};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod discord;
pub mod generic;

/// Default base URL for integration logos shown in Discord footers.
pub const DEFAULT_ASSET_BASE_URL: &str = "https://assets.herald.dev";

/// Settings shared by all payload builders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatterConfig {
    /// Base URL that integration logo paths are resolved against.
    pub asset_base_url: String,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self { asset_base_url: DEFAULT_ASSET_BASE_URL.to_string() }
    }
}

impl FormatterConfig {
    /// Resolves an asset path against the configured base URL.
    pub fn asset_url(&self, path: &str) -> String {
        format!("{}/{}", self.asset_base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

/// Serialized body sent to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WirePayload(serde_json::Value);

impl WirePayload {
    /// Wraps an already-built JSON document.
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Borrows the JSON document.
    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Consumes the payload, returning the JSON document.
    pub fn into_json(self) -> serde_json::Value {
        self.0
    }

    /// Encodes the request body.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }
}

impl From<serde_json::Value> for WirePayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Builds wire payloads for any destination kind.
#[derive(Debug, Clone, Default)]
pub struct PayloadFormatter {
    config: FormatterConfig,
}

impl PayloadFormatter {
    /// Creates a formatter with the given settings.
    pub fn new(config: FormatterConfig) -> Self {
        Self { config }
    }

    /// Returns the formatter settings.
    pub fn config(&self) -> &FormatterConfig {
        &self.config
    }

    /// Formats `event` for a destination of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::UnsupportedEventType` when the destination has
    /// no builder for the event type. Generic formatting never fails.
    pub fn format(&self, event: &DomainEvent, destination: DestinationKind) -> Result<WirePayload> {
        match destination {
            DestinationKind::Generic => Ok(generic::envelope(event)),
            DestinationKind::Discord => discord::embed(event, &self.config),
        }
    }
}
