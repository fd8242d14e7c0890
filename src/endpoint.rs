//! Shared data model: step configuration, pagination, request options,
//! and the response envelope.
//!
//! An [`Endpoint`] is the immutable per-attempt snapshot of one step's
//! request configuration. The healing agent replaces the whole snapshot
//! rather than mutating it, so equality and serde round-tripping matter
//! more than in-place ergonomics.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// HTTP verb for a step. Absent for non-HTTP transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Verbs that never carry a request body.
    pub fn is_bodyless(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Delete | Self::Options)
    }

    /// Whether the verb implies the instruction intends to retrieve data.
    pub fn is_retrieval(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How credentials are attached to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    #[default]
    None,
    Header,
    QueryParam,
    Oauth2,
}

/// Pagination strategy for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaginationType {
    /// 1-indexed page counter.
    PageBased,
    /// 0-indexed row offset.
    OffsetBased,
    /// Opaque cursor extracted from each response.
    CursorBased,
}

impl PaginationType {
    /// Name of the substitution variable this strategy requires in the
    /// request surface.
    pub fn variable_name(&self) -> &'static str {
        match self {
            Self::PageBased => "page",
            Self::OffsetBased => "offset",
            Self::CursorBased => "cursor",
        }
    }
}

/// Default page size used when a pagination config does not set one.
pub const DEFAULT_PAGE_SIZE: &str = "50";

/// Pagination configuration attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    #[serde(rename = "type")]
    pub pagination_type: PaginationType,
    /// Page size as a template string (it may itself contain `<<vars>>`).
    #[serde(default = "default_page_size")]
    pub page_size: String,
    /// Dot-path into the raw response that yields the next cursor.
    /// Required for cursor-based pagination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_path: Option<String>,
    /// Sandboxed expression deciding when to stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_condition: Option<String>,
}

fn default_page_size() -> String {
    DEFAULT_PAGE_SIZE.to_string()
}

impl PaginationConfig {
    pub fn new(pagination_type: PaginationType) -> Self {
        Self {
            pagination_type,
            page_size: default_page_size(),
            cursor_path: None,
            stop_condition: None,
        }
    }

    pub fn with_page_size(mut self, page_size: impl Into<String>) -> Self {
        self.page_size = page_size.into();
        self
    }

    pub fn with_cursor_path(mut self, path: impl Into<String>) -> Self {
        self.cursor_path = Some(path.into());
        self
    }

    pub fn with_stop_condition(mut self, source: impl Into<String>) -> Self {
        self.stop_condition = Some(source.into());
        self
    }
}

/// One step's request/response configuration.
///
/// Header order is preserved (some backends are order-sensitive in
/// practice), hence the `Vec` of pairs instead of a map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    /// Scheme plus host, e.g. `https://api.example.com` or
    /// `postgres://db.internal:5432/main`.
    pub url_host: String,
    #[serde(default)]
    pub url_path: String,
    /// Ordered header templates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query_params: HashMap<String, String>,
    /// Template string or structured body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub authentication: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,
    /// Dot-path used to descend into the raw response before joining
    /// pages. `$` means identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    /// Human description of what this step should achieve. Drives both
    /// healing prompts and response evaluation.
    #[serde(default)]
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
}

impl Endpoint {
    pub fn new(url_host: impl Into<String>) -> Self {
        Self {
            url_host: url_host.into(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.url_path = path.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn with_data_path(mut self, path: impl Into<String>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// The full URL (host + path) without query string.
    pub fn full_url(&self) -> String {
        let host = self.url_host.trim_end_matches('/');
        if self.url_path.is_empty() {
            host.to_string()
        } else if self.url_path.starts_with('/') {
            format!("{host}{}", self.url_path)
        } else {
            format!("{host}/{}", self.url_path)
        }
    }

    /// Every template string of the request surface, concatenated.
    ///
    /// Pagination misconfiguration detection scans this text for the
    /// strategy's variable name before the first request is issued.
    pub fn request_surface(&self) -> String {
        let mut surface = String::new();
        surface.push_str(&self.url_host);
        surface.push_str(&self.url_path);
        for (name, value) in &self.headers {
            surface.push_str(name);
            surface.push_str(value);
        }
        for (name, value) in &self.query_params {
            surface.push_str(name);
            surface.push_str(value);
        }
        if let Some(body) = &self.body {
            match body {
                Value::String(s) => surface.push_str(s),
                other => surface.push_str(&other.to_string()),
            }
        }
        surface
    }

    /// A masked-ready JSON echo of this config for diagnostics. The
    /// caller is expected to pass the result through the masker.
    pub fn diagnostic_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Cache behavior hint, passed through to the caller's cache layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_mode: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Non-429 retry budget.
    pub retries: u32,
    /// Delay between non-429 retries, milliseconds.
    pub retry_delay_ms: u64,
    /// Optional completion webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Verify TLS certificates on outgoing HTTPS. Off reproduces the
    /// scrape-anything behavior of permissive deployments.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_verify_tls() -> bool {
    true
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cache_mode: None,
            timeout_ms: 60_000,
            retries: 1,
            retry_delay_ms: 1_000,
            webhook_url: None,
            verify_tls: true,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }
}

/// Normalized result of one step execution.
///
/// `data` is fully decoded: binary payloads have been parsed by content
/// inference and JSON-looking strings have been parsed. Consumers never
/// see raw byte buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub data: Value,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ResponseEnvelope {
    /// Envelope for a non-HTTP transport success.
    pub fn synthetic_ok(data: Value) -> Self {
        Self {
            data,
            status_code: 200,
            headers: HashMap::new(),
        }
    }
}
