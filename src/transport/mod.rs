//! Transport dispatch: routing a resolved request to HTTP, Postgres, or
//! the FTP family by the scheme of its `url_host`.
//!
//! Non-HTTP transports return a synthetic `200` on success and are
//! always single-shot; the pagination controller never iterates them.

mod ftp;
mod http;
mod postgres;

pub use ftp::{FtpOperation, FtpTransport};
pub use http::{HttpOutcome, HttpTransport, RateLimitInfo, QUICK_FAILURE_MS};
pub use postgres::{PoolRegistry, PostgresTransport};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::decode::{ContentDecoder, DefaultDecoder};
use crate::endpoint::{RequestOptions, ResponseEnvelope};
use crate::error::Result;
use crate::resolver::ResolvedRequest;

/// Which transport a URL routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Postgres,
    Ftp,
}

impl TransportKind {
    /// Select by scheme prefix. Anything unrecognized is HTTP.
    pub fn for_url(url_host: &str) -> Self {
        let lowered = url_host.trim_start().to_ascii_lowercase();
        if lowered.starts_with("postgres://") || lowered.starts_with("postgresql://") {
            Self::Postgres
        } else if lowered.starts_with("ftp://")
            || lowered.starts_with("ftps://")
            || lowered.starts_with("sftp://")
        {
            Self::Ftp
        } else {
            Self::Http
        }
    }

    /// Whether the pagination controller may iterate this transport.
    pub fn supports_pagination(&self) -> bool {
        matches!(self, Self::Http)
    }
}

/// Result of one dispatch: the normalized envelope plus the raw byte
/// prefix and format expectation the interpreter needs.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub envelope: ResponseEnvelope,
    /// Undecoded prefix of the body (HTML detection). Empty for
    /// non-HTTP transports.
    pub raw_prefix: Vec<u8>,
    /// Whether the caller expected JSON back.
    pub expected_json: bool,
    /// Retries performed by the transport.
    pub retries_attempted: u32,
    /// Rate-limit accounting, when a 429 was involved.
    pub rate_limit: Option<RateLimitInfo>,
}

/// Routes resolved requests to their transport.
pub struct Dispatcher {
    http: HttpTransport,
    postgres: PostgresTransport,
    ftp: FtpTransport,
    decoder: Arc<dyn ContentDecoder>,
}

impl Dispatcher {
    /// Build a dispatcher with the default decoder and a fresh pool
    /// registry.
    pub fn new() -> Self {
        Self::with_registry(PoolRegistry::new())
    }

    /// Build a dispatcher sharing an existing pool registry. The
    /// registry is process-scoped state owned by the embedder.
    pub fn with_registry(registry: PoolRegistry) -> Self {
        let decoder: Arc<dyn ContentDecoder> = Arc::new(DefaultDecoder::new());
        Self {
            http: HttpTransport::new(),
            postgres: PostgresTransport::new(registry),
            ftp: FtpTransport::new(Arc::clone(&decoder)),
            decoder,
        }
    }

    /// Swap the content decoder (HTTP response decoding and FTP `get`
    /// parsing both use it).
    pub fn with_decoder(mut self, decoder: Arc<dyn ContentDecoder>) -> Self {
        self.ftp = FtpTransport::new(Arc::clone(&decoder));
        self.decoder = decoder;
        self
    }

    /// The registry backing the Postgres transport.
    pub fn pool_registry(&self) -> &PoolRegistry {
        self.postgres.registry()
    }

    /// Execute one resolved request on the transport its URL selects.
    pub async fn dispatch(
        &self,
        request: &ResolvedRequest,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        match TransportKind::for_url(&request.url_host) {
            TransportKind::Http => self.dispatch_http(request, options, cancel).await,
            TransportKind::Postgres => {
                let data = self.postgres.execute(request, options, cancel).await?;
                Ok(synthetic_outcome(data))
            }
            TransportKind::Ftp => {
                let data = self.ftp.execute(request, options, cancel).await?;
                Ok(synthetic_outcome(data))
            }
        }
    }

    async fn dispatch_http(
        &self,
        request: &ResolvedRequest,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let outcome = self.http.execute(request, options, cancel).await?;

        let raw_prefix: Vec<u8> = outcome
            .body
            .iter()
            .copied()
            .take(http::RAW_PREFIX_LIMIT)
            .collect();
        let expected_json = outcome.expects_json();
        let data = self
            .decoder
            .parse(&outcome.body, outcome.content_type.as_deref());

        Ok(DispatchOutcome {
            envelope: ResponseEnvelope {
                data,
                status_code: outcome.status,
                headers: outcome.headers,
            },
            raw_prefix,
            expected_json,
            retries_attempted: outcome.retries_attempted,
            rate_limit: outcome.rate_limit,
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn synthetic_outcome(data: Value) -> DispatchOutcome {
    DispatchOutcome {
        envelope: ResponseEnvelope::synthetic_ok(data),
        raw_prefix: Vec::new(),
        expected_json: false,
        retries_attempted: 0,
        rate_limit: None,
    }
}

/// Case-insensitive header lookup.
pub(crate) fn header_value<'a>(
    headers: &'a HashMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_routing() {
        assert_eq!(
            TransportKind::for_url("postgres://db:5432/main"),
            TransportKind::Postgres
        );
        assert_eq!(
            TransportKind::for_url("postgresql://db/main"),
            TransportKind::Postgres
        );
        assert_eq!(TransportKind::for_url("ftp://files.example.com"), TransportKind::Ftp);
        assert_eq!(TransportKind::for_url("ftps://files.example.com"), TransportKind::Ftp);
        assert_eq!(TransportKind::for_url("sftp://files.example.com"), TransportKind::Ftp);
        assert_eq!(
            TransportKind::for_url("https://api.example.com"),
            TransportKind::Http
        );
        assert_eq!(TransportKind::for_url("api.example.com"), TransportKind::Http);
    }

    #[test]
    fn test_only_http_paginates() {
        assert!(TransportKind::Http.supports_pagination());
        assert!(!TransportKind::Postgres.supports_pagination());
        assert!(!TransportKind::Ftp.supports_pagination());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "10".to_string());
        assert_eq!(header_value(&headers, "retry-after"), Some("10"));
        assert_eq!(header_value(&headers, "RETRY-AFTER"), Some("10"));
        assert_eq!(header_value(&headers, "x-missing"), None);
    }
}
