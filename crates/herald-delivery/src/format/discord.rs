//! Discord embed documents.
//!
//! Each supported event type has its own builder. Builders read `data`
//! leniently: a missing or mistyped field renders as a placeholder instead of
//! failing the delivery.

use herald_core::{DestinationKind, DomainEvent, EventSource, EventType};
use serde::Serialize;
use serde_json::Value;

use super::{FormatterConfig, WirePayload};
use crate::error::{DeliveryError, Result};

/// Rendered in place of missing data fields.
pub const PLACEHOLDER: &str = "N/A";

const COLOR_CREATED: u32 = 0x22C5_5E;
const COLOR_UPDATED: u32 = 0x3B82_F6;
const COLOR_DELETED: u32 = 0xEF44_44;

// Discord rejects embeds exceeding these.
const MAX_TITLE_CHARS: usize = 256;
const MAX_DESCRIPTION_CHARS: usize = 4096;
const MAX_FIELD_VALUE_CHARS: usize = 1024;

/// Embed footer identifying who or what caused the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Footer {
    /// Footer caption.
    pub text: String,
    /// Small icon left of the caption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct Embed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    color: u32,
    fields: Vec<EmbedField>,
    footer: Footer,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct EmbedField {
    name: &'static str,
    value: String,
    inline: bool,
}

impl EmbedField {
    fn new(name: &'static str, value: String) -> Self {
        Self { name, value: truncate(&value, MAX_FIELD_VALUE_CHARS), inline: true }
    }

    fn wide(name: &'static str, value: String) -> Self {
        Self { inline: false, ..Self::new(name, value) }
    }
}

/// Human-readable label for an event source.
pub const fn source_label(source: EventSource) -> &'static str {
    match source {
        EventSource::Dashboard => "Dashboard",
        EventSource::ApiKey => "API Key",
        EventSource::StripeIntegration => "Stripe",
        EventSource::DiscordIntegration => "Discord",
        EventSource::BuiltByBitIntegration => "BuiltByBit",
        EventSource::PolymartIntegration => "Polymart",
        EventSource::Unknown => "Unknown",
    }
}

/// Logo path for an integration source, relative to the asset base URL.
pub const fn source_logo(source: EventSource) -> Option<&'static str> {
    match source {
        EventSource::ApiKey => Some("logos/api-key.png"),
        EventSource::StripeIntegration => Some("logos/stripe.png"),
        EventSource::DiscordIntegration => Some("logos/discord.png"),
        EventSource::BuiltByBitIntegration => Some("logos/builtbybit.png"),
        EventSource::PolymartIntegration => Some("logos/polymart.png"),
        EventSource::Dashboard | EventSource::Unknown => None,
    }
}

/// Builds the footer for `event`.
///
/// Dashboard events show the acting user, or "Unknown User" when none is
/// attached. Every other source shows its label and logo.
pub fn footer(event: &DomainEvent, config: &FormatterConfig) -> Footer {
    if event.source == EventSource::Dashboard {
        return match &event.acting_user {
            Some(user) => Footer { text: user.email.clone(), icon_url: user.image_url.clone() },
            None => Footer { text: "Unknown User".to_string(), icon_url: None },
        };
    }

    Footer {
        text: source_label(event.source).to_string(),
        icon_url: source_logo(event.source).map(|path| config.asset_url(path)),
    }
}

/// Builds `{"embeds": [..]}` for `event`.
///
/// # Errors
///
/// Returns `DeliveryError::UnsupportedEventType` for product events, which
/// have no Discord rendering.
pub fn embed(event: &DomainEvent, config: &FormatterConfig) -> Result<WirePayload> {
    let embed = match event.event_type {
        EventType::LicenseCreated => license_embed(event, "License Created", COLOR_CREATED),
        EventType::LicenseUpdated => license_embed(event, "License Updated", COLOR_UPDATED),
        EventType::LicenseDeleted => license_embed(event, "License Deleted", COLOR_DELETED),
        EventType::CustomerCreated => customer_embed(event, "Customer Created", COLOR_CREATED),
        EventType::CustomerUpdated => customer_embed(event, "Customer Updated", COLOR_UPDATED),
        EventType::CustomerDeleted => customer_embed(event, "Customer Deleted", COLOR_DELETED),
        EventType::ProductCreated | EventType::ProductUpdated | EventType::ProductDeleted => {
            return Err(DeliveryError::unsupported_event_type(
                event.event_type,
                DestinationKind::Discord,
            ));
        },
    };

    let embed = Embed {
        footer: footer(event, config),
        timestamp: event.occurred_at.to_rfc3339(),
        ..embed
    };

    Ok(WirePayload::new(serde_json::json!({ "embeds": [serde_json::to_value(embed)?] })))
}

fn license_embed(event: &DomainEvent, title: &str, color: u32) -> Embed {
    let data = &event.data;

    let expiration = match text(data, &["/expirationType"]).as_deref() {
        Some("NEVER") => "Never".to_string(),
        _ => text(data, &["/expirationDate", "/expiresAt"]).unwrap_or_else(placeholder),
    };

    let fields = vec![
        EmbedField::wide(
            "License Key",
            text(data, &["/licenseKey", "/key"])
                .map_or_else(placeholder, |key| format!("`{key}`")),
        ),
        EmbedField::new(
            "Customer",
            text(data, &["/customer/email", "/customer/fullName", "/customerEmail"])
                .unwrap_or_else(placeholder),
        ),
        EmbedField::new("Products", list(data, "/products")),
        EmbedField::new("Expires", expiration),
        EmbedField::new("IP Limit", limit(data, "/ipLimit")),
        EmbedField::new("Seat Limit", limit(data, "/seatLimit")),
    ];

    base_embed(event, title, color, fields)
}

fn customer_embed(event: &DomainEvent, title: &str, color: u32) -> Embed {
    let data = &event.data;

    let fields = vec![
        EmbedField::new("Email", text(data, &["/email"]).unwrap_or_else(placeholder)),
        EmbedField::new(
            "Name",
            text(data, &["/fullName", "/name"]).unwrap_or_else(placeholder),
        ),
        EmbedField::new("Username", text(data, &["/username"]).unwrap_or_else(placeholder)),
        EmbedField::new(
            "Discord",
            text(data, &["/discordAccount/username", "/discordId"]).unwrap_or_else(placeholder),
        ),
    ];

    base_embed(event, title, color, fields)
}

fn base_embed(event: &DomainEvent, title: &str, color: u32, fields: Vec<EmbedField>) -> Embed {
    Embed {
        title: truncate(title, MAX_TITLE_CHARS),
        description: Some(truncate(
            &format!("Team **{}**", event.team.name),
            MAX_DESCRIPTION_CHARS,
        )),
        color,
        fields,
        footer: Footer { text: String::new(), icon_url: None },
        timestamp: String::new(),
    }
}

fn placeholder() -> String {
    PLACEHOLDER.to_string()
}

/// First present scalar among `pointers`, rendered as text.
fn text(data: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|pointer| match data.pointer(pointer)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// Comma-separated names from an array of strings or `{name}` objects.
fn list(data: &Value, pointer: &str) -> String {
    let names: Vec<String> = data
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => text(item, &["/name"]),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if names.is_empty() {
        placeholder()
    } else {
        names.join(", ")
    }
}

/// A numeric limit, where an explicit null means unlimited.
fn limit(data: &Value, pointer: &str) -> String {
    match data.pointer(pointer) {
        Some(Value::Null) => "Unlimited".to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => placeholder(),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use herald_core::{ActingUser, TeamId, TeamRef, UserId};
    use serde_json::json;

    use super::*;

    fn event(event_type: EventType, source: EventSource, data: Value) -> DomainEvent {
        DomainEvent::new(
            event_type,
            source,
            TeamRef { id: TeamId::new(), name: "Acme".to_string() },
            data,
            Utc::now(),
        )
    }

    fn config() -> FormatterConfig {
        FormatterConfig { asset_base_url: "https://cdn.test".to_string() }
    }

    #[test]
    fn dashboard_footer_shows_acting_user() {
        let event = event(EventType::LicenseCreated, EventSource::Dashboard, json!({}))
            .with_acting_user(ActingUser {
                id: UserId::new(),
                email: "owner@acme.test".to_string(),
                image_url: Some("https://cdn.acme.test/me.png".to_string()),
            });

        assert_eq!(
            footer(&event, &config()),
            Footer {
                text: "owner@acme.test".to_string(),
                icon_url: Some("https://cdn.acme.test/me.png".to_string()),
            }
        );
    }

    #[test]
    fn dashboard_footer_without_user_is_unknown_user() {
        let event = event(EventType::LicenseCreated, EventSource::Dashboard, json!({}));

        assert_eq!(
            footer(&event, &config()),
            Footer { text: "Unknown User".to_string(), icon_url: None }
        );
    }

    #[test]
    fn integration_footer_shows_label_and_logo() {
        let event = event(EventType::LicenseCreated, EventSource::StripeIntegration, json!({}));

        assert_eq!(
            footer(&event, &config()),
            Footer {
                text: "Stripe".to_string(),
                icon_url: Some("https://cdn.test/logos/stripe.png".to_string()),
            }
        );
    }

    #[test]
    fn unknown_source_footer_has_no_logo() {
        let event = event(EventType::CustomerCreated, EventSource::Unknown, json!({}));

        let footer = footer(&event, &config());
        assert_eq!(footer.text, "Unknown");
        assert_eq!(footer.icon_url, None);

        let json = serde_json::to_value(&footer).unwrap();
        assert!(json.get("icon_url").is_none());
    }

    #[test]
    fn every_source_has_a_label() {
        for source in [
            EventSource::Dashboard,
            EventSource::ApiKey,
            EventSource::StripeIntegration,
            EventSource::DiscordIntegration,
            EventSource::BuiltByBitIntegration,
            EventSource::PolymartIntegration,
            EventSource::Unknown,
        ] {
            assert!(!source_label(source).is_empty());
        }
    }

    #[test]
    fn license_embed_reads_data_fields() {
        let event = event(
            EventType::LicenseCreated,
            EventSource::ApiKey,
            json!({
                "licenseKey": "ABCD-1234",
                "customer": {"email": "buyer@example.com"},
                "products": [{"name": "Pro"}, "Addon"],
                "expirationType": "NEVER",
                "ipLimit": null,
                "seatLimit": 5
            }),
        );

        let payload = embed(&event, &config()).unwrap().into_json();
        let embed = &payload["embeds"][0];

        assert_eq!(embed["title"], "License Created");
        assert_eq!(embed["color"], COLOR_CREATED);
        assert_eq!(embed["description"], "Team **Acme**");
        assert_eq!(embed["footer"]["text"], "API Key");

        let fields = embed["fields"].as_array().unwrap();
        let value = |name: &str| {
            fields.iter().find(|f| f["name"] == name).map(|f| f["value"].clone()).unwrap()
        };
        assert_eq!(value("License Key"), "`ABCD-1234`");
        assert_eq!(value("Customer"), "buyer@example.com");
        assert_eq!(value("Products"), "Pro, Addon");
        assert_eq!(value("Expires"), "Never");
        assert_eq!(value("IP Limit"), "Unlimited");
        assert_eq!(value("Seat Limit"), "5");
    }

    #[test]
    fn missing_fields_render_as_placeholder() {
        let event = event(EventType::CustomerDeleted, EventSource::Dashboard, json!("garbage"));

        let payload = embed(&event, &config()).unwrap().into_json();
        let fields = payload["embeds"][0]["fields"].as_array().unwrap().clone();

        assert!(!fields.is_empty());
        for field in fields {
            assert_eq!(field["value"], PLACEHOLDER);
        }
    }

    #[test]
    fn product_events_are_unsupported() {
        for event_type in
            [EventType::ProductCreated, EventType::ProductUpdated, EventType::ProductDeleted]
        {
            let err = embed(&event(event_type, EventSource::ApiKey, json!({})), &config())
                .unwrap_err();
            assert!(matches!(err, DeliveryError::UnsupportedEventType { .. }));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn long_values_are_truncated() {
        let long = "x".repeat(2_000);
        let truncated = truncate(&long, MAX_FIELD_VALUE_CHARS);
        assert_eq!(truncated.chars().count(), MAX_FIELD_VALUE_CHARS);
        assert!(truncated.ends_with('…'));
    }
}
