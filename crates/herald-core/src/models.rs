//! Core domain models and strongly-typed identifiers.
//!
//! Defines the domain events emitted by the licensing platform, the webhook
//! endpoints teams configure, and the persisted delivery record that the
//! retry store manages, together with its forward-only state machine.

use std::{collections::HashSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single domain event instance.
    ///
    /// Together with [`EndpointId`] it forms the deduplication key of the
    /// retry store.
    EventId
);
uuid_id!(
    /// Identifier of a team-configured webhook endpoint.
    EndpointId
);
uuid_id!(
    /// Identifier of a persisted delivery record.
    DeliveryId
);
uuid_id!(
    /// Identifier of the team that owns endpoints and events.
    TeamId
);
uuid_id!(
    /// Identifier of a dashboard user.
    UserId
);

/// Kind of domain event emitted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A license was issued.
    LicenseCreated,
    /// A license was modified.
    LicenseUpdated,
    /// A license was revoked or removed.
    LicenseDeleted,
    /// A customer record was created.
    CustomerCreated,
    /// A customer record was modified.
    CustomerUpdated,
    /// A customer record was removed.
    CustomerDeleted,
    /// A product was created.
    ProductCreated,
    /// A product was modified.
    ProductUpdated,
    /// A product was removed.
    ProductDeleted,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::LicenseCreated,
        Self::LicenseUpdated,
        Self::LicenseDeleted,
        Self::CustomerCreated,
        Self::CustomerUpdated,
        Self::CustomerDeleted,
        Self::ProductCreated,
        Self::ProductUpdated,
        Self::ProductDeleted,
    ];

    /// Wire name, e.g. `LICENSE_CREATED`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LicenseCreated => "LICENSE_CREATED",
            Self::LicenseUpdated => "LICENSE_UPDATED",
            Self::LicenseDeleted => "LICENSE_DELETED",
            Self::CustomerCreated => "CUSTOMER_CREATED",
            Self::CustomerUpdated => "CUSTOMER_UPDATED",
            Self::CustomerDeleted => "CUSTOMER_DELETED",
            Self::ProductCreated => "PRODUCT_CREATED",
            Self::ProductUpdated => "PRODUCT_UPDATED",
            Self::ProductDeleted => "PRODUCT_DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// Where a domain event originated.
///
/// Unrecognised wire values decode to [`EventSource::Unknown`] so that newer
/// producers never break formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSource {
    /// A user acting through the web dashboard.
    Dashboard,
    /// A call authenticated with a team API key.
    ApiKey,
    /// The Stripe billing integration.
    StripeIntegration,
    /// The Discord bot integration.
    DiscordIntegration,
    /// The BuiltByBit marketplace integration.
    BuiltByBitIntegration,
    /// The Polymart marketplace integration.
    PolymartIntegration,
    /// Any source this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Reference to the team an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRef {
    /// Team identifier.
    pub id: TeamId,
    /// Display name.
    pub name: String,
}

/// The user who triggered an event, stripped of credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActingUser {
    /// User identifier.
    pub id: UserId,
    /// Email address shown in notifications.
    pub email: String,
    /// Avatar URL, if the user has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// An occurrence inside the platform that may need external notification.
///
/// Immutable once constructed. The delivery engine snapshots it at enqueue
/// time so retries replay exactly what the first attempt saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Unique identifier of this occurrence.
    pub id: EventId,
    /// What happened.
    pub event_type: EventType,
    /// Who or what caused it.
    pub source: EventSource,
    /// Owning team.
    pub team: TeamRef,
    /// Dashboard user, when one is known.
    #[serde(default)]
    pub acting_user: Option<ActingUser>,
    /// Event-specific fields.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Creates an event with a fresh identifier and no acting user.
    pub fn new(
        event_type: EventType,
        source: EventSource,
        team: TeamRef,
        data: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self { id: EventId::new(), event_type, source, team, acting_user: None, data, occurred_at }
    }

    /// Attaches the acting user.
    #[must_use]
    pub fn with_acting_user(mut self, user: ActingUser) -> Self {
        self.acting_user = Some(user);
        self
    }
}

/// A webhook destination configured by a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Endpoint identifier.
    pub id: EndpointId,
    /// Owning team.
    pub team_id: TeamId,
    /// Destination URL.
    pub url: String,
    /// Disabled endpoints receive nothing.
    pub enabled: bool,
    /// Event types this endpoint wants.
    pub event_types: HashSet<EventType>,
}

impl WebhookEndpoint {
    /// Whether this endpoint should receive events of the given type.
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.enabled && self.event_types.contains(&event_type)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for WebhookEndpoint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let event_types: Vec<String> = row.try_get("event_types")?;

        Ok(Self {
            id: row.try_get("id")?,
            team_id: row.try_get("team_id")?,
            url: row.try_get("url")?,
            enabled: row.try_get("enabled")?,
            event_types: event_types.iter().filter_map(|s| s.parse().ok()).collect(),
        })
    }
}

/// How a destination URL must be addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Any HTTP endpoint; receives the JSON envelope.
    Generic,
    /// A Discord incoming webhook; receives an embed document.
    Discord,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::Discord => write!(f, "discord"),
        }
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(Self::Generic),
            "discord" => Ok(Self::Discord),
            _ => Err(format!("invalid destination kind: {s}")),
        }
    }
}

/// Retry store state machine.
///
/// ```text
/// Pending -> InProgress        (claim)
/// InProgress -> Delivered      (success)
/// InProgress -> Pending        (failure, attempts remain)
/// InProgress -> Failed         (failure, attempts exhausted)
/// InProgress -> Pending        (stale claim reclaimed)
/// ```
///
/// `Delivered` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Awaiting its next attempt.
    Pending,
    /// Claimed by a drain run.
    InProgress,
    /// Delivered successfully.
    Delivered,
    /// Gave up after exhausting attempts.
    Failed,
}

impl DeliveryStatus {
    /// Whether no further transition may be applied.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Pending | Self::Delivered | Self::Failed)
        )
    }

    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A delivery that failed at least once and is managed by the retry store.
///
/// Exactly one record exists per (endpoint, event) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Record identifier.
    pub id: DeliveryId,
    /// Endpoint the delivery targets.
    pub endpoint_id: EndpointId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Endpoint URL at enqueue time.
    pub target_url: String,
    /// Destination classification at enqueue time.
    pub destination: DestinationKind,
    /// Snapshot of the domain event.
    pub event: DomainEvent,
    /// Snapshot of the formatted wire payload.
    ///
    /// `None` only for rows written without a payload; the drain formats
    /// those from `event`.
    pub payload: Option<serde_json::Value>,
    /// Current state.
    pub status: DeliveryStatus,
    /// Number of failed attempts so far, starting at 1.
    pub attempt_count: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: DateTime<Utc>,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// Most recent HTTP status, if the destination answered.
    pub last_status_code: Option<u16>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Builds the record written after the first failed attempt.
    #[allow(clippy::too_many_arguments)]
    pub fn first_failure(
        endpoint: &WebhookEndpoint,
        event: &DomainEvent,
        destination: DestinationKind,
        payload: serde_json::Value,
        status: DeliveryStatus,
        next_attempt_at: DateTime<Utc>,
        last_error: Option<String>,
        last_status_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            endpoint_id: endpoint.id,
            event_id: event.id,
            target_url: endpoint.url.clone(),
            destination,
            event: event.clone(),
            payload: Some(payload),
            status,
            attempt_count: 1,
            next_attempt_at,
            last_error,
            last_status_code,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record is eligible for an attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_attempt_at <= now
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let destination: String = row.try_get("destination")?;
        let event: sqlx::types::Json<DomainEvent> = row.try_get("event")?;
        let payload: Option<sqlx::types::Json<serde_json::Value>> = row.try_get("payload")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;
        let last_status_code: Option<i32> = row.try_get("last_status_code")?;

        Ok(Self {
            id: row.try_get("id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            event_id: row.try_get("event_id")?,
            target_url: row.try_get("target_url")?,
            destination: destination.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            event: event.0,
            payload: payload.map(|p| p.0),
            status: row.try_get("status")?,
            attempt_count: attempt_count
                .try_into()
                .map_err(|_| sqlx::Error::Decode("attempt_count cannot be negative".into()))?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            last_status_code: last_status_code.and_then(|code| u16::try_from(code).ok()),
            claimed_at: row.try_get("claimed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
