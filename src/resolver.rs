//! Variable resolution for `<<expr>>` placeholders.
//!
//! Template strings in an endpoint are resolved against a merged scope of
//! payload, credentials, and pagination variables. A placeholder holds
//! either a bare identifier, a dotted path, or an arrow function that is
//! evaluated in the sandbox with the scope bound as `sourceData`.

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

use crate::endpoint::{AuthType, Endpoint, HttpMethod};
use crate::error::{Error, Result};
use crate::mask::mask_credentials;
use crate::sandbox::Sandbox;

/// Pagination variables injected into the scope for one iteration.
#[derive(Debug, Clone, Default)]
pub struct PaginationVars {
    pub page: u64,
    pub offset: u64,
    pub cursor: Option<Value>,
    pub page_size: String,
}

/// Build the merged variable scope for one resolution pass.
///
/// Later sources win: pagination variables supersede same-named payload
/// or credential entries, which is what lets a fresh iteration override
/// the previous `page`/`offset`/`cursor`.
pub fn build_scope(
    payload: &Value,
    credentials: &HashMap<String, String>,
    pagination: Option<&PaginationVars>,
    current_item: Option<&Value>,
) -> Map<String, Value> {
    let mut scope = Map::new();
    if let Value::Object(map) = payload {
        for (k, v) in map {
            scope.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in credentials {
        scope.insert(k.clone(), Value::String(v.clone()));
    }
    if let Some(vars) = pagination {
        scope.insert("page".to_string(), Value::Number(vars.page.into()));
        scope.insert("offset".to_string(), Value::Number(vars.offset.into()));
        scope.insert(
            "cursor".to_string(),
            vars.cursor.clone().unwrap_or(Value::Null),
        );
        scope.insert(
            "pageSize".to_string(),
            Value::String(vars.page_size.clone()),
        );
    }
    if let Some(item) = current_item {
        scope.insert("currentItem".to_string(), item.clone());
    }
    scope
}

/// The fully resolved request for one transport dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub method: Option<HttpMethod>,
    pub url_host: String,
    pub url_path: String,
    pub headers: Vec<(String, String)>,
    pub query_params: Vec<(String, String)>,
    pub body: Option<Value>,
    pub authentication: AuthType,
}

impl ResolvedRequest {
    /// Full URL without query string.
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
}

/// Resolves `<<expr>>` placeholders over a scope.
pub struct Resolver {
    sandbox: Sandbox,
    placeholder_re: Regex,
    base64_re: Regex,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(Sandbox::new())
    }
}

impl Resolver {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            // Non-greedy across newlines: arrow bodies may span lines.
            placeholder_re: Regex::new(r"(?s)<<(.+?)>>").expect("placeholder regex"),
            base64_re: Regex::new(r"^[A-Za-z0-9+/=]+$").expect("base64 regex"),
        }
    }

    /// Resolve a whole endpoint into a dispatchable request.
    pub async fn resolve_endpoint(
        &self,
        endpoint: &Endpoint,
        scope: &Map<String, Value>,
        credentials: &HashMap<String, String>,
    ) -> Result<ResolvedRequest> {
        let url_host = self
            .resolve_template(&endpoint.url_host, scope, credentials)
            .await?;
        let url_path = self
            .resolve_template(&endpoint.url_path, scope, credentials)
            .await?;

        let mut headers = Vec::with_capacity(endpoint.headers.len());
        for (name, template) in &endpoint.headers {
            let value = self.resolve_template(template, scope, credentials).await?;
            if is_droppable(&value) {
                continue;
            }
            let value = if name.eq_ignore_ascii_case("authorization") {
                self.normalize_authorization(&value)
            } else {
                value
            };
            headers.push((name.clone(), value));
        }

        let mut query_params = Vec::with_capacity(endpoint.query_params.len());
        for (name, template) in &endpoint.query_params {
            let value = self.resolve_template(template, scope, credentials).await?;
            if is_droppable(&value) {
                continue;
            }
            query_params.push((name.clone(), value));
        }
        // HashMap iteration order is arbitrary; emit deterministically.
        query_params.sort_by(|a, b| a.0.cmp(&b.0));

        let body = match &endpoint.body {
            Some(body) => Some(self.resolve_value(body, scope, credentials).await?),
            None => None,
        };

        Ok(ResolvedRequest {
            method: endpoint.method,
            url_host,
            url_path,
            headers,
            query_params,
            body,
            authentication: endpoint.authentication,
        })
    }

    /// Resolve every placeholder in a template string.
    pub async fn resolve_template(
        &self,
        template: &str,
        scope: &Map<String, Value>,
        credentials: &HashMap<String, String>,
    ) -> Result<String> {
        let placeholders: Vec<(std::ops::Range<usize>, String)> = self
            .placeholder_re
            .captures_iter(template)
            .map(|captures| {
                let whole = captures.get(0).expect("match");
                let expr = captures.get(1).expect("group").as_str().trim().to_string();
                (whole.range(), expr)
            })
            .collect();

        let mut out = String::with_capacity(template.len());
        let mut last_end = 0;
        for (range, expr) in placeholders {
            out.push_str(&template[last_end..range.start]);
            let value = self
                .resolve_expression(&expr, template, scope, credentials)
                .await?;
            out.push_str(&stringify(&value));
            last_end = range.end;
        }
        out.push_str(&template[last_end..]);
        Ok(out)
    }

    /// Resolve placeholders inside a structured value.
    ///
    /// A string that is exactly one placeholder substitutes the typed
    /// value; strings with embedded placeholders interpolate as text.
    pub async fn resolve_value(
        &self,
        value: &Value,
        scope: &Map<String, Value>,
        credentials: &HashMap<String, String>,
    ) -> Result<Value> {
        match value {
            Value::String(template) => {
                let trimmed = template.trim();
                if let Some(captures) = self.placeholder_re.captures(trimmed) {
                    let whole = captures.get(0).expect("match");
                    if whole.start() == 0 && whole.end() == trimmed.len() {
                        let expr = captures.get(1).expect("group").as_str().trim();
                        return self
                            .resolve_expression(expr, template, scope, credentials)
                            .await;
                    }
                }
                let text = self.resolve_template(template, scope, credentials).await?;
                // A stringified JSON body is pre-parsed into structured
                // form; parse failure leaves the string untouched.
                let sniff = text.trim_start();
                if sniff.starts_with('{') || sniff.starts_with('[') {
                    if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                        return Ok(parsed);
                    }
                }
                Ok(Value::String(text))
            }
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(Box::pin(self.resolve_value(item, scope, credentials)).await?);
                }
                Ok(Value::Array(resolved))
            }
            Value::Object(map) => {
                let mut resolved = Map::new();
                for (k, v) in map {
                    resolved.insert(
                        k.clone(),
                        Box::pin(self.resolve_value(v, scope, credentials)).await?,
                    );
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    async fn resolve_expression(
        &self,
        expr: &str,
        template: &str,
        scope: &Map<String, Value>,
        credentials: &HashMap<String, String>,
    ) -> Result<Value> {
        if Sandbox::is_arrow(expr) {
            return self
                .sandbox
                .evaluate(expr, &[Value::Object(scope.clone())])
                .await
                .map_err(|err| {
                    Error::code_execution(mask_credentials(
                        &format!(
                            "Expression '{expr}' failed in template '{template}': {err}. \
                             Available variables: {}",
                            available_names(scope)
                        ),
                        credentials,
                    ))
                });
        }

        match lookup_path(scope, expr) {
            Some(value) => Ok(value.clone()),
            // An unset cursor resolves to the empty string so the first
            // pagination request can go out without a cursor value.
            None if expr == "cursor" => Ok(Value::String(String::new())),
            None => Err(Error::undefined_variable(mask_credentials(
                &format!(
                    "Variable '{expr}' is not defined in template '{template}'. \
                     Available variables: {}",
                    available_names(scope)
                ),
                credentials,
            ))),
        }
    }

    /// Collapse duplicated auth prefixes and base64-encode Basic
    /// credentials that are not already encoded.
    fn normalize_authorization(&self, value: &str) -> String {
        let mut value = value.to_string();
        if let Some(rest) = value.strip_prefix("Basic Basic ") {
            value = format!("Basic {rest}");
        }
        if let Some(rest) = value.strip_prefix("Bearer Bearer ") {
            value = format!("Bearer {rest}");
        }
        if let Some(credential) = value.strip_prefix("Basic ") {
            if !credential.is_empty() && !self.base64_re.is_match(credential) {
                use base64::Engine as _;
                let encoded = base64::engine::general_purpose::STANDARD.encode(credential);
                return format!("Basic {encoded}");
            }
        }
        value
    }
}

/// Dotted-path lookup in the scope. `a.b.c` descends through objects;
/// numeric segments index arrays.
fn lookup_path<'a>(scope: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = scope.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Template stringification of a resolved value.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Values that must be dropped from headers and query params.
fn is_droppable(value: &str) -> bool {
    value.is_empty() || value == "undefined" || value == "null"
}

fn available_names(scope: &Map<String, Value>) -> String {
    let mut names: Vec<&str> = scope.keys().map(String::as_str).collect();
    names.sort_unstable();
    names.join(", ")
}
