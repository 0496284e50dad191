//! Operator secret authentication for internal routes.
//!
//! The drain trigger and event feed are called by a scheduler or by the
//! platform itself, never by end users. Both present a shared secret as a
//! bearer token. Comparison is done on SHA-256 digests in constant time, and
//! a service without a configured secret rejects every internal request.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::AppState;

/// Digest of the configured operator secret.
#[derive(Clone, Default)]
pub struct OperatorSecret {
    digest: Option<[u8; 32]>,
}

impl OperatorSecret {
    /// Builds from the configured value. Blank secrets count as unset.
    pub fn new(secret: Option<&str>) -> Self {
        let digest = secret.filter(|s| !s.trim().is_empty()).map(digest);
        Self { digest }
    }

    /// Whether a secret is configured.
    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    /// Checks a presented token against the configured secret.
    pub fn verify(&self, presented: &str) -> Result<(), AuthError> {
        let expected = self.digest.ok_or(AuthError::NotConfigured)?;
        let actual = digest(presented);

        let diff = expected.iter().zip(actual.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(AuthError::InvalidSecret)
        }
    }
}

impl std::fmt::Debug for OperatorSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorSecret").field("configured", &self.is_configured()).finish()
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Extracts the bearer token from the Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Reasons an internal request is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token was presented.
    MissingHeader,
    /// The token does not match the configured secret.
    InvalidSecret,
    /// The service has no secret to compare against.
    NotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "success": false, "error": "Unauthorized" });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Axum middleware that requires the operator secret.
pub async fn operator_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let outcome = match extract_bearer(req.headers()) {
        Some(token) => state.operator_secret.verify(token),
        None if state.operator_secret.is_configured() => Err(AuthError::MissingHeader),
        None => Err(AuthError::NotConfigured),
    };

    match outcome {
        Ok(()) => Ok(next.run(req).await),
        Err(AuthError::NotConfigured) => {
            error!(path = %req.uri().path(), "operator secret not configured, rejecting request");
            Err(AuthError::NotConfigured)
        },
        Err(e) => {
            warn!(path = %req.uri().path(), reason = ?e, "unauthorized internal request");
            Err(e)
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer cron-secret"));

        assert_eq!(extract_bearer(&headers), Some("cron-secret"));
    }

    #[test]
    fn extract_bearer_returns_none_without_header() {
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn extract_bearer_ignores_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz"));

        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn matching_secret_verifies() {
        let secret = OperatorSecret::new(Some("cron-secret"));
        assert_eq!(secret.verify("cron-secret"), Ok(()));
        assert_eq!(secret.verify("cron-secret2"), Err(AuthError::InvalidSecret));
        assert_eq!(secret.verify(""), Err(AuthError::InvalidSecret));
    }

    #[test]
    fn unconfigured_secret_rejects_everything() {
        for configured in [None, Some(""), Some("  ")] {
            let secret = OperatorSecret::new(configured);
            assert!(!secret.is_configured());
            assert_eq!(secret.verify("anything"), Err(AuthError::NotConfigured));
        }
    }

    #[test]
    fn debug_output_hides_the_secret() {
        let secret = OperatorSecret::new(Some("cron-secret"));
        assert!(!format!("{secret:?}").contains("cron-secret"));
    }
}
