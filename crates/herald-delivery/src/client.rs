//! HTTP client performing single delivery attempts.
//!
//! One call is one POST bounded by the configured timeout. The outcome is
//! reported as a [`DeliveryResult`], never as an `Err`, so callers can feed
//! every failure straight into the retry policy. The client never touches
//! the retry store.

use std::time::{Duration, Instant};

use herald_core::{DestinationKind, EventId};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    format::WirePayload,
};

/// Responses larger than this are not read further.
const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// Portion of the response body kept for diagnostics.
const MAX_DIAGNOSTIC_BYTES: usize = 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout covering connect, send and response.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: format!("Herald-Webhooks/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
        }
    }
}

/// One outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest<'a> {
    /// Destination URL.
    pub url: &'a str,
    /// Body to send.
    pub payload: &'a WirePayload,
    /// How the destination is addressed.
    pub destination: DestinationKind,
    /// Event being delivered.
    pub event_id: EventId,
    /// 1-based number of this attempt.
    pub attempt_number: u32,
}

/// Classified outcome of a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// 2xx received within the timeout.
    pub success: bool,
    /// HTTP status, if the destination answered.
    pub status_code: Option<u16>,
    /// Failure cause, `None` on success.
    pub error: Option<DeliveryError>,
    /// Wall time spent on the call.
    pub duration: Duration,
}

impl DeliveryResult {
    fn delivered(status_code: u16, duration: Duration) -> Self {
        Self { success: true, status_code: Some(status_code), error: None, duration }
    }

    fn failed(error: DeliveryError, duration: Duration) -> Self {
        Self { success: false, status_code: error.status_code(), error: Some(error), duration }
    }

    /// Classified failure message, e.g. `client error: HTTP 404`.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// HTTP client for webhook delivery.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the timeout is zero or
    /// the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeout must be positive"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Performs one delivery attempt.
    ///
    /// Generic destinations additionally receive `X-Herald-Event-Id` and
    /// `X-Herald-Attempt`. Discord destinations receive only the body.
    pub async fn attempt(&self, request: &DeliveryRequest<'_>) -> DeliveryResult {
        let span = info_span!(
            "webhook_attempt",
            event_id = %request.event_id,
            url = %request.url,
            destination = %request.destination,
            attempt = request.attempt_number
        );

        async move {
            let start = Instant::now();

            let body = match request.payload.to_bytes() {
                Ok(body) => body,
                Err(e) => return DeliveryResult::failed(e, start.elapsed()),
            };

            let mut http_request = self
                .client
                .post(request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);

            if request.destination == DestinationKind::Generic {
                http_request = http_request
                    .header("X-Herald-Event-Id", request.event_id.to_string())
                    .header("X-Herald-Attempt", request.attempt_number.to_string());
            }

            tracing::debug!("sending webhook");

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let error = self.categorize(&e);
                    let duration = start.elapsed();
                    tracing::warn!(
                        duration_ms = duration.as_millis() as u64,
                        error = %error,
                        "webhook request failed"
                    );
                    return DeliveryResult::failed(error, duration);
                },
            };

            let status = response.status();
            let status_code = status.as_u16();

            if status.is_success() {
                let duration = start.elapsed();
                tracing::info!(
                    status = status_code,
                    duration_ms = duration.as_millis() as u64,
                    "webhook delivered"
                );
                return DeliveryResult::delivered(status_code, duration);
            }

            let body = read_diagnostic_body(response).await;
            let error = DeliveryError::from_status(status_code, body);
            let duration = start.elapsed();

            tracing::warn!(
                status = status_code,
                duration_ms = duration.as_millis() as u64,
                "webhook rejected by destination"
            );

            DeliveryResult::failed(error, duration)
        }
        .instrument(span)
        .await
    }

    fn categorize(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            return DeliveryError::timeout(
                u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
            );
        }
        if error.is_builder() {
            return DeliveryError::configuration(format!("invalid request: {error}"));
        }
        DeliveryError::network(error.to_string())
    }
}

/// Reads at most [`MAX_RESPONSE_BODY_BYTES`] and keeps a short excerpt.
async fn read_diagnostic_body(mut response: reqwest::Response) -> String {
    let mut buffer = Vec::new();

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                buffer.extend_from_slice(&chunk);
                if buffer.len() >= MAX_RESPONSE_BODY_BYTES {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("failed to read response body: {e}");
                break;
            },
        }
    }

    if buffer.len() > MAX_DIAGNOSTIC_BYTES {
        let suffix = "... (truncated)";
        let excerpt = String::from_utf8_lossy(&buffer[..MAX_DIAGNOSTIC_BYTES - suffix.len()]);
        format!("{excerpt}{suffix}")
    } else {
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn payload() -> WirePayload {
        WirePayload::new(json!({"eventType": "LICENSE_CREATED"}))
    }

    fn request<'a>(url: &'a str, payload: &'a WirePayload) -> DeliveryRequest<'a> {
        DeliveryRequest {
            url,
            payload,
            destination: DestinationKind::Generic,
            event_id: EventId::new(),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_json(json!({"eventType": "LICENSE_CREATED"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let url = format!("{}/webhook", mock_server.uri());
        let payload = payload();

        let result = client.attempt(&request(&url, &payload)).await;

        assert!(result.success);
        assert_eq!(result.status_code, Some(204));
        assert!(result.error_message().is_none());
    }

    #[tokio::test]
    async fn client_error_is_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let url = format!("{}/webhook", mock_server.uri());
        let payload = payload();

        let result = client.attempt(&request(&url, &payload)).await;

        assert!(!result.success);
        assert_eq!(result.status_code, Some(404));
        assert_eq!(result.error_message().as_deref(), Some("client error: HTTP 404"));
        match result.error {
            Some(DeliveryError::ClientError { body, .. }) => assert_eq!(body, "Not Found"),
            other => unreachable!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let url = format!("{}/webhook", mock_server.uri());
        let payload = payload();

        let result = client.attempt(&request(&url, &payload)).await;

        assert!(!result.success);
        assert_eq!(result.error_message().as_deref(), Some("server error: HTTP 502"));
    }

    #[tokio::test]
    async fn slow_destination_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        })
        .unwrap();
        let url = format!("{}/webhook", mock_server.uri());
        let payload = payload();

        let result = client.attempt(&request(&url, &payload)).await;

        assert!(!result.success);
        assert_eq!(result.status_code, None);
        assert_eq!(result.error_message().as_deref(), Some("request timeout after 100ms"));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();
        let payload = payload();

        let result = client.attempt(&request("http://127.0.0.1:1/webhook", &payload)).await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(DeliveryError::NetworkError { .. })));
        assert!(result.error_message().unwrap().starts_with("network connection failed"));
    }

    #[tokio::test]
    async fn generic_destinations_get_metadata_headers() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header_exists("X-Herald-Event-Id"))
            .and(matchers::header("X-Herald-Attempt", "3"))
            .and(matchers::header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let url = format!("{}/webhook", mock_server.uri());
        let payload = payload();
        let request = DeliveryRequest { attempt_number: 3, ..request(&url, &payload) };

        assert!(client.attempt(&request).await.success);
    }

    #[tokio::test]
    async fn large_error_bodies_are_truncated() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(200_000)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let url = format!("{}/webhook", mock_server.uri());
        let payload = payload();

        let result = client.attempt(&request(&url, &payload)).await;

        match result.error {
            Some(DeliveryError::ServerError { body, .. }) => {
                assert_eq!(body.len(), MAX_DIAGNOSTIC_BYTES);
                assert!(body.ends_with("(truncated)"));
            },
            other => unreachable!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = DeliveryClient::new(ClientConfig {
            timeout: Duration::ZERO,
            ..ClientConfig::default()
        });
        assert!(matches!(result, Err(DeliveryError::ConfigurationError { .. })));
    }
}
