//! Destination classification for webhook URLs.

use herald_core::DestinationKind;
use reqwest::Url;

const DISCORD_HOSTS: &[&str] = &["discord.com", "discordapp.com"];
const DISCORD_SUBDOMAINS: &[&str] = &["ptb", "canary"];

/// Decides how a target URL must be addressed.
///
/// A URL is [`DestinationKind::Discord`] only when it is an absolute `https`
/// URL on a Discord host whose path is an incoming-webhook path, either
/// `/api/webhooks/...` or versioned as `/api/v10/webhooks/...`. Anything else,
/// including strings that do not parse, is [`DestinationKind::Generic`].
pub fn classify(url: &str) -> DestinationKind {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return DestinationKind::Generic;
    };

    if parsed.scheme() != "https" {
        return DestinationKind::Generic;
    }

    let Some(host) = parsed.host_str() else {
        return DestinationKind::Generic;
    };

    if is_discord_host(host) && is_webhook_path(parsed.path()) {
        DestinationKind::Discord
    } else {
        DestinationKind::Generic
    }
}

fn is_discord_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    DISCORD_HOSTS.iter().any(|base| {
        host == *base
            || DISCORD_SUBDOMAINS
                .iter()
                .any(|sub| host.strip_prefix(sub).and_then(|rest| rest.strip_prefix('.')) == Some(base))
    })
}

fn is_webhook_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix("/api/") else {
        return false;
    };

    let rest = match rest.strip_prefix('v') {
        Some(versioned) => {
            let digits = versioned.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                return false;
            }
            match versioned[digits..].strip_prefix('/') {
                Some(after_version) => after_version,
                None => return false,
            }
        },
        None => rest,
    };

    rest.strip_prefix("webhooks/").is_some_and(|id| !id.is_empty())
}
