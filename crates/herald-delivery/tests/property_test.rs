//! Property-based tests for backoff, classification and formatting.

use std::time::Duration;

use chrono::Utc;
use herald_core::{
    DestinationKind, DomainEvent, EventSource, EventType, TeamId, TeamRef,
};
use herald_delivery::{
    classify,
    format::{discord, FormatterConfig},
    DeliveryError, PayloadFormatter, RetryDecision, RetryPolicy,
};
use proptest::prelude::*;
use serde_json::json;

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u64..600, 1u64..100, 1u32..20).prop_map(|(base, cap_factor, max_attempts)| RetryPolicy {
        max_attempts,
        base_delay: Duration::from_secs(base),
        max_delay: Duration::from_secs(base * cap_factor),
        jitter_factor: 0.0,
    })
}

fn event_type_strategy() -> impl Strategy<Value = EventType> {
    prop::sample::select(EventType::ALL.to_vec())
}

fn source_strategy() -> impl Strategy<Value = EventSource> {
    prop::sample::select(vec![
        EventSource::Dashboard,
        EventSource::ApiKey,
        EventSource::StripeIntegration,
        EventSource::DiscordIntegration,
        EventSource::BuiltByBitIntegration,
        EventSource::PolymartIntegration,
        EventSource::Unknown,
    ])
}

proptest! {
    #[test]
    fn backoff_is_monotonic_up_to_the_cap(policy in policy_strategy(), n in 1u32..64) {
        let current = policy.delay_for(n);
        let next = policy.delay_for(n + 1);

        prop_assert!(next >= current);
        prop_assert!(next <= policy.max_delay);
        prop_assert!(current >= policy.base_delay.min(policy.max_delay));
    }

    #[test]
    fn attempt_counts_only_grow(policy in policy_strategy(), previous in 0u32..30) {
        let decision = policy.decide(previous, &DeliveryError::timeout(10_000), Utc::now());

        prop_assert_eq!(decision.attempt_count(), previous + 1);
        if let RetryDecision::Retry { attempt_count, .. } = decision {
            prop_assert!(attempt_count < policy.max_attempts);
        }
    }

    #[test]
    fn classify_is_total(url in ".*") {
        let kind = classify(&url);
        prop_assert!(kind == DestinationKind::Generic || kind == DestinationKind::Discord);
    }

    #[test]
    fn discord_webhook_paths_are_recognised(
        host in prop::sample::select(vec![
            "discord.com", "discordapp.com", "ptb.discord.com", "canary.discordapp.com",
        ]),
        version in prop::option::of(1u8..20),
        id in "[0-9]{5,20}",
        token in "[A-Za-z0-9_-]{10,68}",
    ) {
        let version = version.map(|v| format!("v{v}/")).unwrap_or_default();
        let url = format!("https://{host}/api/{version}webhooks/{id}/{token}");

        prop_assert_eq!(classify(&url), DestinationKind::Discord);
        prop_assert_eq!(classify(&url.replacen("https", "http", 1)), DestinationKind::Generic);
    }

    #[test]
    fn generic_formatting_never_fails(
        event_type in event_type_strategy(),
        source in source_strategy(),
        key in "[a-z]{1,10}",
        value in any::<i64>(),
    ) {
        let event = DomainEvent::new(
            event_type,
            source,
            TeamRef { id: TeamId::new(), name: "Acme".to_string() },
            json!({ key: value }),
            Utc::now(),
        );

        let payload = PayloadFormatter::default().format(&event, DestinationKind::Generic);
        prop_assert!(payload.is_ok());
    }

    #[test]
    fn footers_always_have_text(source in source_strategy()) {
        let event = DomainEvent::new(
            EventType::LicenseCreated,
            source,
            TeamRef { id: TeamId::new(), name: "Acme".to_string() },
            json!(null),
            Utc::now(),
        );

        let footer = discord::footer(&event, &FormatterConfig::default());
        prop_assert!(!footer.text.is_empty());
        if source == EventSource::Unknown {
            prop_assert!(footer.icon_url.is_none());
        }
    }
}
