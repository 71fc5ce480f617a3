//! Resilient JSON transport shared by every source adapter.
//!
//! Owns the per-source request pacing, retry/backoff and error classification
//! so that adapters only deal with URLs and payload shapes.
//!
//! | Outcome | Behaviour | Error after retries |
//! |---------|-----------|---------------------|
//! | transport timeout | retry with backoff | [`SourceErrorKind::Timeout`](crate::SourceErrorKind::Timeout) |
//! | connect/other transport error | retry with backoff | `Api { status: None }` |
//! | 5xx / 408 | retry with backoff | `Api { status }` |
//! | 429 | retry after `Retry-After` (or backoff) | `RateLimited { retry_after }` |
//! | 401 / 403 | no retry | `AuthFailure` |
//! | other 4xx | no retry | `Api { status }` |
//! | 2xx with invalid JSON | no retry | `Parse { field: "body" }` |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::data_source::{SourceAvailability, SourceError, HEALTH_CHECK_TIMEOUT};
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::retry::{parse_retry_after, RetryConfig, RetryDecision};
use crate::throttling::RequestPacer;
use crate::SourceCode;

/// Probe latency above which a responsive source is reported as degraded.
const SLOW_PROBE_THRESHOLD: Duration = Duration::from_secs(2);

pub struct ResilientTransport {
    source: SourceCode,
    client: Arc<dyn HttpClient>,
    retry: RetryConfig,
    pacer: RequestPacer,
    request_timeout: Duration,
    open: AtomicBool,
}

impl ResilientTransport {
    pub fn new(source: SourceCode, client: Arc<dyn HttpClient>) -> Self {
        Self {
            source,
            client,
            retry: RetryConfig::default(),
            pacer: RequestPacer::unpaced(),
            request_timeout: Duration::from_secs(30),
            open: AtomicBool::new(false),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.pacer = RequestPacer::new(min_interval);
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn source(&self) -> &SourceCode {
        &self.source
    }

    pub fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            tracing::debug!(source = %self.source, "transport opened");
        }
    }

    /// Returns whether the transport was open. Closing an idle transport is a no-op.
    pub fn close(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open {
            tracing::debug!(source = %self.source, "transport closed");
        }
        was_open
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Sends `request` with pacing and retries and decodes the JSON body.
    ///
    /// An empty body or a 204 decodes to [`Value::Null`].
    pub async fn get_json(&self, request: HttpRequest) -> Result<Value, SourceError> {
        if !self.is_open() {
            return Err(SourceError::unavailable(
                self.source.clone(),
                "adapter is closed; call open() first",
            ));
        }

        let request = request.with_timeout(self.request_timeout);
        let mut attempt = 0_u32;

        loop {
            self.pacer.wait().await;
            let outcome = self.client.execute(request.clone()).await;

            let (decision, error) = match outcome {
                Ok(response) if response.is_success() => return self.decode(&response),
                Ok(response) => match self.classify_status(&response, attempt) {
                    Ok((decision, error)) => (decision, error),
                    Err(final_error) => return Err(final_error),
                },
                Err(error) if error.is_timeout() => (
                    self.retry.after_transient_failure(attempt),
                    SourceError::timeout(
                        self.source.clone(),
                        format!("request timed out: {}", error.message()),
                    ),
                ),
                Err(error) => (
                    self.retry.after_transient_failure(attempt),
                    SourceError::api(
                        self.source.clone(),
                        None,
                        format!("transport error: {}", error.message()),
                    ),
                ),
            };

            match decision {
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        source = %self.source,
                        attempts = attempt + 1,
                        error = %error,
                        "giving up after retries"
                    );
                    return Err(error);
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(
                        source = %self.source,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Single unretried request bounded by [`HEALTH_CHECK_TIMEOUT`].
    pub async fn probe(&self, request: HttpRequest) -> SourceAvailability {
        let request = request.with_timeout(HEALTH_CHECK_TIMEOUT);
        let started = Instant::now();
        let outcome = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.client.execute(request)).await;

        match outcome {
            Ok(Ok(response)) if response.is_success() => {
                if started.elapsed() > SLOW_PROBE_THRESHOLD {
                    SourceAvailability::Degraded
                } else {
                    SourceAvailability::Available
                }
            }
            Ok(Ok(response)) if response.status == 429 => SourceAvailability::Degraded,
            Ok(Ok(response)) => {
                tracing::debug!(source = %self.source, status = response.status, "probe failed");
                SourceAvailability::Unavailable
            }
            Ok(Err(error)) => {
                tracing::debug!(source = %self.source, error = %error, "probe failed");
                SourceAvailability::Unavailable
            }
            Err(_) => SourceAvailability::Unavailable,
        }
    }

    /// Non-2xx handling: `Ok` carries a retry decision, `Err` is final.
    fn classify_status(
        &self,
        response: &HttpResponse,
        attempt: u32,
    ) -> Result<(RetryDecision, SourceError), SourceError> {
        let status = response.status;
        match status {
            401 | 403 => Err(SourceError::auth_failure(
                self.source.clone(),
                format!("upstream rejected credentials with status {status}"),
            )),
            400 | 422 => Err(SourceError::invalid_request(
                self.source.clone(),
                format!("upstream rejected the query with status {status}"),
            )),
            429 => {
                let hint = parse_retry_after(response.header("retry-after"));
                Ok((
                    self.retry.after_rate_limit(attempt, hint),
                    SourceError::rate_limited(
                        self.source.clone(),
                        hint,
                        "upstream rate limit exceeded",
                    ),
                ))
            }
            status if RetryConfig::is_retryable_status(status) => Ok((
                self.retry.after_transient_failure(attempt),
                SourceError::api(
                    self.source.clone(),
                    Some(status),
                    format!("upstream returned status {status}"),
                ),
            )),
            status => Err(SourceError::api(
                self.source.clone(),
                Some(status),
                format!("upstream returned status {status}"),
            )),
        }
    }

    fn decode(&self, response: &HttpResponse) -> Result<Value, SourceError> {
        if response.status == 204 || response.body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&response.body).map_err(|error| {
            SourceError::parse(
                self.source.clone(),
                "body",
                format!("invalid JSON response: {error}"),
            )
        })
    }
}

impl std::fmt::Debug for ResilientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientTransport")
            .field("source", &self.source)
            .field("retry", &self.retry)
            .field("pacer", &self.pacer)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::SourceErrorKind;
    use crate::http_client::{HttpError, ScriptedHttpClient};

    const URL: &str = "https://api.test/items";

    fn transport(client: Arc<ScriptedHttpClient>, retries: u32) -> ResilientTransport {
        let transport = ResilientTransport::new(SourceCode::parse("test").expect("valid"), client)
            .with_retry(RetryConfig::fixed(Duration::from_millis(1), retries));
        transport.open();
        transport
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.push(URL, Ok(HttpResponse::new(503, "")));
        client.push(URL, Ok(HttpResponse::new(502, "")));
        client.push_json(URL, r#"{"ok":true}"#);

        let value = transport(client.clone(), 3)
            .get_json(HttpRequest::get(URL))
            .await
            .expect("third attempt succeeds");

        assert_eq!(value["ok"], true);
        assert_eq!(client.recorded_requests().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.push(URL, Ok(HttpResponse::new(404, "")));

        let error = transport(client.clone(), 3)
            .get_json(HttpRequest::get(URL))
            .await
            .expect_err("404 is final");

        assert_eq!(error.kind(), SourceErrorKind::Api { status: Some(404) });
        assert_eq!(client.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn auth_failures_are_distinct_and_final() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.push(URL, Ok(HttpResponse::new(401, "")));

        let error = transport(client.clone(), 3)
            .get_json(HttpRequest::get(URL))
            .await
            .expect_err("401 is final");

        assert_eq!(error.kind(), SourceErrorKind::AuthFailure);
        assert_eq!(client.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_surfaces_hint() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.push(URL, Ok(HttpResponse::new(429, "").with_header("Retry-After", "0")));

        let error = transport(client.clone(), 2)
            .get_json(HttpRequest::get(URL))
            .await
            .expect_err("rate limit persists");

        assert_eq!(
            error.kind(),
            SourceErrorKind::RateLimited {
                retry_after: Some(Duration::ZERO)
            }
        );
        assert_eq!(client.recorded_requests().len(), 3);
    }

    #[tokio::test]
    async fn transport_timeouts_map_to_timeout_kind() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.push(URL, Err(HttpError::timeout("deadline elapsed")));

        let error = transport(client.clone(), 1)
            .get_json(HttpRequest::get(URL))
            .await
            .expect_err("timeouts persist");

        assert_eq!(error.kind(), SourceErrorKind::Timeout);
        assert_eq!(client.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.push_json(URL, "<html>");

        let error = transport(client, 0)
            .get_json(HttpRequest::get(URL))
            .await
            .expect_err("html is not json");

        assert_eq!(error.kind(), SourceErrorKind::Parse { field: "body" });
    }

    #[tokio::test]
    async fn closed_transport_refuses_requests() {
        let client = Arc::new(ScriptedHttpClient::new());
        let transport = transport(client.clone(), 0);

        assert!(transport.close());
        assert!(!transport.close());

        let error = transport
            .get_json(HttpRequest::get(URL))
            .await
            .expect_err("closed transport");
        assert_eq!(error.kind(), SourceErrorKind::Unavailable);
        assert!(client.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn probe_maps_statuses_to_availability() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.push_json("https://api.test/ok", "{}");
        client.push("https://api.test/busy", Ok(HttpResponse::new(429, "")));
        client.push("https://api.test/down", Ok(HttpResponse::new(500, "")));
        let transport = transport(client, 0);

        assert_eq!(
            transport.probe(HttpRequest::get("https://api.test/ok")).await,
            SourceAvailability::Available
        );
        assert_eq!(
            transport.probe(HttpRequest::get("https://api.test/busy")).await,
            SourceAvailability::Degraded
        );
        assert_eq!(
            transport.probe(HttpRequest::get("https://api.test/down")).await,
            SourceAvailability::Unavailable
        );
    }
}
