//! HTTP transport: request shaping, retry ladder, 429 handling, and
//! raw-byte response capture.
//!
//! The transport never judges a response body: it hands bytes (and
//! retry accounting) back to the dispatcher, which decodes them and lets
//! the status interpreter decide. The transport's own job ends at "got a
//! response" or "ran out of retries".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::endpoint::{HttpMethod, RequestOptions};
use crate::error::{Error, Result};
use crate::resolver::ResolvedRequest;

use super::header_value;

/// Conventional desktop-browser user agent applied when the caller does
/// not override it.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";

/// Failed attempts slower than this are not retried: a slow failure is
/// most likely a server-side timeout that a retry would only repeat.
pub const QUICK_FAILURE_MS: u64 = 5_000;

/// Accumulated 429 wait budget.
const DEFAULT_MAX_RATE_LIMIT_WAIT_MS: u64 = 60_000;

/// Cap for any single 429 wait.
const MAX_SINGLE_WAIT_SECS: u64 = 3_600;

/// Bytes of raw body kept for HTML sniffing.
pub(crate) const RAW_PREFIX_LIMIT: usize = 1024;

/// Rate-limit accounting attached to an outcome that saw a 429.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    /// Last observed `Retry-After` header value, verbatim.
    pub retry_after: Option<String>,
    /// Total time spent waiting on 429 responses.
    pub total_waited_ms: u64,
    /// True when the final response is a 429 that exhausted the budget.
    pub budget_exceeded: bool,
}

/// Raw result of one HTTP execution (after retries).
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub retries_attempted: u32,
    pub rate_limit: Option<RateLimitInfo>,
    expected_json: bool,
}

impl HttpOutcome {
    /// Whether the request was made expecting a JSON response.
    pub fn expects_json(&self) -> bool {
        self.expected_json
    }
}

/// HTTP transport backed by two shared clients: one verifying TLS, one
/// permissive for scraping backends with broken certificates.
pub struct HttpTransport {
    verified: Client,
    permissive: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let verified = Client::builder()
            .gzip(true)
            .deflate(true)
            .build()
            .expect("http client");
        let permissive = Client::builder()
            .gzip(true)
            .deflate(true)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("permissive http client");
        Self {
            verified,
            permissive,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Execute a resolved request, honoring the retry policy:
    /// - non-429 failures retry up to `options.retries` times, and only
    ///   when the failed attempt was quick;
    /// - 429s wait on their own counter (`Retry-After`, else
    ///   exponential `10^k + jitter`) under an accumulated budget;
    /// - network errors retry with linear backoff.
    pub async fn execute(
        &self,
        request: &ResolvedRequest,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<HttpOutcome> {
        let client = if options.verify_tls {
            &self.verified
        } else {
            &self.permissive
        };

        let mut status_retries: u32 = 0;
        let mut network_retries: u32 = 0;
        let mut rate_limit_waited = Duration::ZERO;
        let mut rate_limit_attempt: u32 = 0;
        let mut last_retry_after: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let builder = self.build_request(client, request, options)?;
            let started = Instant::now();

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = builder.send() => result,
            };

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    if network_retries >= options.retries {
                        return Err(Error::transport(
                            format!("request to {} failed: {err}", request.full_url()),
                            network_retries,
                        ));
                    }
                    network_retries += 1;
                    let delay =
                        Duration::from_millis(options.retry_delay_ms * u64::from(network_retries));
                    debug!(
                        url = %request.full_url(),
                        attempt = network_retries,
                        "network error, retrying after {delay:?}: {err}"
                    );
                    cancellable_sleep(delay, cancel).await?;
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let headers = collect_headers(&response);
                let retry_after = header_value(&headers, "retry-after").map(str::to_string);
                last_retry_after = retry_after.clone();

                let wait = retry_after
                    .as_deref()
                    .and_then(parse_retry_after)
                    .unwrap_or_else(|| exponential_backoff(rate_limit_attempt));
                let wait = wait.min(Duration::from_secs(MAX_SINGLE_WAIT_SECS));

                let budget = Duration::from_millis(DEFAULT_MAX_RATE_LIMIT_WAIT_MS);
                if rate_limit_waited + wait > budget {
                    warn!(
                        url = %request.full_url(),
                        waited_ms = rate_limit_waited.as_millis() as u64,
                        "rate limit wait budget exceeded, surfacing 429"
                    );
                    return self
                        .finish(
                            response,
                            request,
                            status_retries + network_retries,
                            Some(RateLimitInfo {
                                retry_after: last_retry_after,
                                total_waited_ms: rate_limit_waited.as_millis() as u64,
                                budget_exceeded: true,
                            }),
                        )
                        .await;
                }

                debug!(
                    url = %request.full_url(),
                    wait_ms = wait.as_millis() as u64,
                    "429 received, waiting"
                );
                cancellable_sleep(wait, cancel).await?;
                rate_limit_waited += wait;
                rate_limit_attempt += 1;
                continue;
            }

            if !(200..300).contains(&status) {
                let elapsed = started.elapsed();
                let quick = elapsed < Duration::from_millis(QUICK_FAILURE_MS);
                if quick && status_retries < options.retries {
                    status_retries += 1;
                    debug!(
                        url = %request.full_url(),
                        status,
                        attempt = status_retries,
                        "error status on quick attempt, retrying"
                    );
                    cancellable_sleep(Duration::from_millis(options.retry_delay_ms), cancel)
                        .await?;
                    continue;
                }
            }

            let rate_limit = (rate_limit_attempt > 0).then(|| RateLimitInfo {
                retry_after: last_retry_after.clone(),
                total_waited_ms: rate_limit_waited.as_millis() as u64,
                budget_exceeded: false,
            });
            return self
                .finish(response, request, status_retries + network_retries, rate_limit)
                .await;
        }
    }

    fn build_request(
        &self,
        client: &Client,
        request: &ResolvedRequest,
        options: &RequestOptions,
    ) -> Result<reqwest::RequestBuilder> {
        let method = request.method.unwrap_or(HttpMethod::Get);
        let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| Error::Fatal(format!("invalid method: {e}")))?;

        let mut builder = client
            .request(reqwest_method, request.full_url())
            .timeout(Duration::from_millis(options.timeout_ms));

        if !request.query_params.is_empty() {
            builder = builder.query(&request.query_params);
        }

        let mut has_accept = false;
        let mut has_user_agent = false;
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("accept") {
                has_accept = true;
            }
            if name.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            builder = builder.header(name, value);
        }
        if !has_accept {
            builder = builder.header("Accept", "*/*");
        }
        if !has_user_agent {
            builder = builder.header("User-Agent", DEFAULT_USER_AGENT);
        }

        if !method.is_bodyless() {
            match &request.body {
                Some(Value::String(text)) => {
                    builder = builder.body(text.clone());
                }
                Some(value) => {
                    builder = builder.json(value);
                }
                None => {}
            }
        }

        Ok(builder)
    }

    async fn finish(
        &self,
        response: reqwest::Response,
        request: &ResolvedRequest,
        retries_attempted: u32,
        rate_limit: Option<RateLimitInfo>,
    ) -> Result<HttpOutcome> {
        let status = response.status().as_u16();
        let headers = collect_headers(&response);
        let content_type = header_value(&headers, "content-type").map(str::to_string);
        let expected_json = expects_json(request);

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(format!("failed to read response body: {e}"), retries_attempted))?
            .to_vec();

        Ok(HttpOutcome {
            status,
            headers,
            body,
            content_type,
            retries_attempted,
            rate_limit,
            expected_json,
        })
    }
}

/// JSON is expected unless the request's Accept header names HTML.
fn expects_json(request: &ResolvedRequest) -> bool {
    request
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("accept"))
        .map(|(_, value)| !value.to_ascii_lowercase().contains("html"))
        .unwrap_or(true)
}

fn collect_headers(response: &reqwest::Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Parse a `Retry-After` header: integer seconds or an HTTP-date.
/// Anything else falls through to exponential backoff.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(Duration::from_secs(delta.num_seconds().max(0) as u64))
}

/// `10^k` seconds plus up to one second of jitter.
fn exponential_backoff(attempt: u32) -> Duration {
    let base = 10u64.saturating_pow(attempt.min(4));
    let jitter_ms = rand::thread_rng().gen_range(0..1_000);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::AuthType;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new()
    }

    fn request_for(server_url: &str) -> ResolvedRequest {
        ResolvedRequest {
            method: Some(HttpMethod::Get),
            url_host: server_url.to_string(),
            url_path: "/items".to_string(),
            headers: Vec::new(),
            query_params: Vec::new(),
            body: None,
            authentication: AuthType::None,
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("1"), Some(Duration::from_secs(1)));
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let header = future.to_rfc2822();
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed >= Duration::from_secs(85) && parsed <= Duration::from_secs(95));
    }

    #[test]
    fn test_parse_retry_after_garbage_falls_through() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_past_http_date_waits_zero() {
        let past = chrono::Utc::now() - chrono::Duration::seconds(90);
        assert_eq!(parse_retry_after(&past.to_rfc2822()), Some(Duration::ZERO));
    }

    #[test]
    fn test_expects_json_by_default_and_accept() {
        let mut request = request_for("http://x");
        assert!(expects_json(&request));
        request
            .headers
            .push(("Accept".to_string(), "text/html".to_string()));
        assert!(!expects_json(&request));
    }

    #[tokio::test]
    async fn test_happy_path_with_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("Accept", "*/*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .mount(&server)
            .await;

        let outcome = transport()
            .execute(
                &request_for(&server.uri()),
                &RequestOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.retries_attempted, 0);
        assert_eq!(outcome.body, serde_json::to_vec(&json!([{"id": 1}])).unwrap());
    }

    #[tokio::test]
    async fn test_query_params_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let mut request = request_for(&server.uri());
        request.query_params.push(("page".to_string(), "2".to_string()));

        let outcome = transport()
            .execute(&request, &RequestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, 200);
    }

    #[tokio::test]
    async fn test_quick_failure_retries_then_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let options = RequestOptions::default()
            .with_retries(1)
            .with_retry_delay_ms(10);
        let outcome = transport()
            .execute(&request_for(&server.uri()), &options, &CancellationToken::new())
            .await
            .unwrap();

        // One retry happened (2 calls total); the 500 comes back for the
        // interpreter rather than becoming a transport error.
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.retries_attempted, 1);
    }

    #[tokio::test]
    async fn test_429_with_retry_after_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("Retry-After", "1"),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let started = Instant::now();
        let outcome = transport()
            .execute(
                &request_for(&server.uri()),
                &RequestOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(outcome.status, 200);
        let info = outcome.rate_limit.unwrap();
        assert!(!info.budget_exceeded);
        assert_eq!(info.retry_after.as_deref(), Some("1"));
        assert!(info.total_waited_ms >= 1_000);
    }

    #[tokio::test]
    async fn test_429_budget_exhaustion_surfaces_response() {
        let server = MockServer::start().await;
        // Retry-After far beyond the 60 s budget: surfaced immediately.
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("Retry-After", "3600"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = transport()
            .execute(
                &request_for(&server.uri()),
                &RequestOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, 429);
        let info = outcome.rate_limit.unwrap();
        assert!(info.budget_exceeded);
        assert_eq!(info.retry_after.as_deref(), Some("3600"));
    }

    #[tokio::test]
    async fn test_network_error_exhausts_retries() {
        // Nothing listens on this port.
        let request = request_for("http://127.0.0.1:1");
        let options = RequestOptions::default()
            .with_retries(2)
            .with_retry_delay_ms(5);
        let err = transport()
            .execute(&request, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Transport {
                retries_attempted, ..
            } => assert_eq!(retries_attempted, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_honored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let transport = transport();
        let request = request_for(&server.uri());
        let options = RequestOptions::default();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { transport.execute(&request, &options, &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_body_elided_for_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let mut request = request_for(&server.uri());
        request.body = Some(json!({"should": "not be sent"}));

        // wiremock would not match a GET with a body mismatch here; the
        // call succeeding proves the body was dropped.
        let outcome = transport()
            .execute(&request, &RequestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, 200);
    }
}
