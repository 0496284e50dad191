//! JSON envelope for generic HTTP endpoints.

use herald_core::DomainEvent;
use serde_json::json;

use super::WirePayload;

/// Builds `{eventType, source, team, user, data, timestamp}` for `event`.
///
/// `timestamp` is the event's occurrence time in RFC 3339. The acting user is
/// reduced to id and email.
pub fn envelope(event: &DomainEvent) -> WirePayload {
    let user = event
        .acting_user
        .as_ref()
        .map(|user| json!({ "id": user.id, "email": user.email }));

    WirePayload::new(json!({
        "eventType": event.event_type,
        "source": event.source,
        "team": { "id": event.team.id, "name": event.team.name },
        "user": user,
        "data": event.data,
        "timestamp": event.occurred_at.to_rfc3339(),
    }))
}
