//! Pagination controller: iterate one step until exhaustion.
//!
//! Strategies are page-based (1-indexed), offset-based (0-indexed), and
//! cursor-based. Termination comes from either a user-supplied stop
//! condition (sandboxed) or built-in heuristics (short page, repeated
//! page hash, single-object response). Cycle detection hashes each
//! page's normalized data; misconfigured pagination fails fast with a
//! context the healing agent can act on.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::endpoint::{Endpoint, PaginationType, RequestOptions, ResponseEnvelope};
use crate::error::{Error, Result};
use crate::interpreter::{interpret_response, rate_limit_exhausted_message};
use crate::resolver::{build_scope, PaginationVars, Resolver};
use crate::sandbox::Sandbox;
use crate::transport::{DispatchOutcome, Dispatcher};

/// Hard cap when a stop condition is present.
pub const MAX_PAGINATION_REQUESTS: u32 = 1_000;

/// Hard cap for built-in termination.
pub const MAX_PAGINATION_REQUESTS_WITHOUT_STOP: u32 = 500;

/// Pagination progress exposed to stop conditions as `pageInfo`.
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub page: u64,
    pub offset: u64,
    pub cursor: Option<Value>,
    pub total_fetched: usize,
}

impl PageInfo {
    pub fn to_value(&self) -> Value {
        json!({
            "page": self.page,
            "offset": self.offset,
            "cursor": self.cursor.clone().unwrap_or(Value::Null),
            "totalFetched": self.total_fetched,
        })
    }
}

/// Borrowed collaborators for one paginated step execution.
pub struct PaginationRun<'a> {
    pub endpoint: &'a Endpoint,
    pub payload: &'a Value,
    pub credentials: &'a HashMap<String, String>,
    pub current_item: Option<&'a Value>,
    pub options: &'a RequestOptions,
    pub resolver: &'a Resolver,
    pub dispatcher: &'a Dispatcher,
    pub sandbox: &'a Sandbox,
    pub cancel: &'a CancellationToken,
}

impl PaginationRun<'_> {
    /// Run the full pagination loop and return the merged envelope.
    pub async fn run(self) -> Result<ResponseEnvelope> {
        let pagination = self.endpoint.pagination.as_ref().ok_or_else(|| {
            Error::pagination_config("pagination run invoked without a pagination config")
        })?;

        // The request surface must actually substitute the strategy's
        // variable, otherwise every page would fetch the same data.
        // Checked before any request goes out.
        let variable = pagination.pagination_type.variable_name();
        if !self.endpoint.request_surface().contains(variable) {
            return Err(Error::pagination_config(format!(
                "{:?} pagination requires a '<<{variable}>>' substitution in the URL, headers, \
                 query parameters, or body, but none was found. Add the variable to the request \
                 or remove the pagination config.",
                pagination.pagination_type
            )));
        }

        let has_stop_condition = pagination.stop_condition.is_some();
        let max_requests = if has_stop_condition {
            MAX_PAGINATION_REQUESTS
        } else {
            MAX_PAGINATION_REQUESTS_WITHOUT_STOP
        };

        let mut all_results: Vec<Value> = Vec::new();
        let mut page: u64 = 1;
        let mut offset: u64 = 0;
        let mut cursor: Option<Value> = None;
        let mut has_more = true;
        let mut loop_count: u32 = 0;
        let mut seen_hashes: HashSet<String> = HashSet::new();
        let mut prev_hash: Option<String> = None;
        let mut first_hash: Option<String> = None;
        let mut first_has_data = false;
        let mut object_mode = false;
        let mut last_envelope: Option<ResponseEnvelope> = None;

        while has_more && loop_count < max_requests {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Scope is rebuilt fresh each iteration so the advanced
            // page/offset/cursor values supersede stale ones.
            let page_size = self.resolve_page_size(&pagination.page_size).await?;
            let vars = PaginationVars {
                page,
                offset,
                cursor: cursor.clone(),
                page_size: page_size.to_string(),
            };
            let scope = build_scope(self.payload, self.credentials, Some(&vars), self.current_item);

            let resolved = self
                .resolver
                .resolve_endpoint(self.endpoint, &scope, self.credentials)
                .await?;
            let outcome = self
                .dispatcher
                .dispatch(&resolved, self.options, self.cancel)
                .await?;
            check_status(&outcome, self.endpoint, self.credentials)?;

            let raw_response = outcome.envelope.data.clone();
            let (page_data, data_path_success) =
                walk_data_path(&raw_response, self.endpoint.data_path.as_deref());
            if !data_path_success {
                debug!(
                    data_path = self.endpoint.data_path.as_deref().unwrap_or_default(),
                    "dataPath did not resolve, using raw response"
                );
            }

            let page_hash = hash_value(&page_data);
            let page_has_data = has_data(&page_data);

            // Misconfiguration detection on the second iteration.
            if has_stop_condition && loop_count == 1 {
                if first_hash.as_deref() == Some(page_hash.as_str()) && first_has_data {
                    return Err(Error::pagination_config(format!(
                        "the first two pages returned identical data, so the pagination \
                         parameters are not being applied by the API. Request surface must \
                         substitute '<<{variable}>>' where the API expects it."
                    )));
                }
                if !first_has_data && !page_has_data {
                    return Err(Error::pagination_config(
                        "the first two pages were empty but pagination continued. \
                         Stop condition should detect empty responses."
                            .to_string(),
                    ));
                }
            }

            // Natural termination on a repeated page.
            let mut skip_append = false;
            if loop_count > 0 && prev_hash.as_deref() == Some(page_hash.as_str()) {
                has_more = false;
                skip_append = true;
            }

            if has_more {
                if let Some(source) = &pagination.stop_condition {
                    let info = PageInfo {
                        page,
                        offset,
                        cursor: cursor.clone(),
                        total_fetched: all_results.len(),
                    };
                    let verdict = self
                        .sandbox
                        .evaluate_stop_condition(source, &raw_response, &info.to_value())
                        .await;
                    if let Some(error) = verdict.error {
                        // The sandbox reports errors softly; the
                        // controller surfaces them so healing can fix
                        // the expression.
                        return Err(Error::pagination_config(format!(
                            "stop condition failed to evaluate: {error}. Source: {source}"
                        )));
                    }
                    if verdict.should_stop {
                        has_more = false;
                    }
                } else {
                    match &page_data {
                        Value::Array(items) => {
                            if seen_hashes.contains(&page_hash) {
                                has_more = false;
                                skip_append = true;
                            } else if pagination.pagination_type != PaginationType::CursorBased
                                && (items.len() as u64) < page_size
                            {
                                // Short page ends page/offset iteration;
                                // cursor iteration ends when the cursor
                                // path stops resolving.
                                has_more = false;
                            }
                        }
                        // A plain object response is not paginated:
                        // take it and stop.
                        _ => has_more = false,
                    }
                }
            }

            if !skip_append {
                match &page_data {
                    Value::Array(items) => {
                        all_results.extend(items.iter().cloned());
                    }
                    Value::Object(map) if !map.is_empty() => {
                        if all_results.is_empty() {
                            object_mode = true;
                        }
                        all_results.push(page_data.clone());
                    }
                    _ => {}
                }
            }

            seen_hashes.insert(page_hash.clone());
            if first_hash.is_none() {
                first_hash = Some(page_hash.clone());
                first_has_data = page_has_data;
            }
            prev_hash = Some(page_hash);
            last_envelope = Some(outcome.envelope);
            loop_count += 1;

            // Advance the strategy's variable for the next iteration.
            if has_more {
                match pagination.pagination_type {
                    PaginationType::PageBased => page += 1,
                    PaginationType::OffsetBased => offset += page_size,
                    PaginationType::CursorBased => {
                        let path = pagination.cursor_path.as_deref().unwrap_or_default();
                        match walk_cursor_path(&raw_response, path) {
                            Some(next) if !next.is_null() => cursor = Some(next),
                            // No next cursor: the page we just fetched
                            // was the last one.
                            _ => {
                                cursor = Some(Value::Null);
                                has_more = false;
                            }
                        }
                    }
                }
            } else if pagination.pagination_type == PaginationType::CursorBased {
                let path = pagination.cursor_path.as_deref().unwrap_or_default();
                cursor = Some(walk_cursor_path(&raw_response, path).unwrap_or(Value::Null));
            }
        }

        debug!(
            iterations = loop_count,
            collected = all_results.len(),
            "pagination finished"
        );

        let envelope = last_envelope.ok_or_else(|| {
            Error::pagination_config("pagination loop made no requests".to_string())
        })?;
        let data = merge_results(
            all_results,
            object_mode,
            pagination.pagination_type,
            cursor,
        );
        Ok(ResponseEnvelope {
            data,
            status_code: envelope.status_code,
            headers: envelope.headers,
        })
    }

    async fn resolve_page_size(&self, template: &str) -> Result<u64> {
        let scope = build_scope(self.payload, self.credentials, None, self.current_item);
        let text = self
            .resolver
            .resolve_template(template, &scope, self.credentials)
            .await?;
        Ok(text.trim().parse().unwrap_or(50))
    }
}

/// Fail on error statuses and 2xx-as-error bodies, folding in the
/// rate-limit observation when the 429 budget ran out.
pub(crate) fn check_status(
    outcome: &DispatchOutcome,
    endpoint: &Endpoint,
    credentials: &HashMap<String, String>,
) -> Result<()> {
    let verdict = interpret_response(
        outcome.envelope.status_code,
        &outcome.envelope.data,
        &outcome.raw_prefix,
        outcome.expected_json,
        endpoint,
        credentials,
    );
    if !verdict.should_fail {
        return Ok(());
    }
    let mut message = verdict.message.unwrap_or_default();
    if let Some(info) = &outcome.rate_limit {
        if info.budget_exceeded {
            message = rate_limit_exhausted_message(info.retry_after.as_deref(), &message);
        }
    }
    Err(Error::status_after_retries(
        message,
        outcome.envelope.status_code,
        outcome.retries_attempted,
        Some(outcome.envelope.status_code),
    ))
}

/// Descend into the response along the dot-path. `$` (or nothing) is
/// identity. A missing segment aborts the descent: the raw value comes
/// back with `success = false` instead of a partial or fallback walk.
pub fn walk_data_path(data: &Value, data_path: Option<&str>) -> (Value, bool) {
    let path = match data_path {
        Some(p) if !p.is_empty() && p != "$" => p,
        _ => return (data.clone(), true),
    };
    let mut current = data;
    for segment in path.split('.') {
        if segment == "$" {
            continue;
        }
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return (data.clone(), false),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return (data.clone(), false),
            },
            _ => return (data.clone(), false),
        }
    }
    (current.clone(), true)
}

/// Walk the cursor path on the raw (pre-`dataPath`) response.
fn walk_cursor_path(response: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = response;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                current = items.get(segment.parse::<usize>().ok()?)?;
            }
            _ => return None,
        }
    }
    Some(current.clone())
}

fn has_data(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// SHA-256 of the serialized value; used for repeat and cycle detection.
fn hash_value(value: &Value) -> String {
    let serialized = serde_json::to_string(value).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    format!("{digest:x}")
}

fn merge_results(
    all_results: Vec<Value>,
    object_mode: bool,
    pagination_type: PaginationType,
    cursor: Option<Value>,
) -> Value {
    if pagination_type == PaginationType::CursorBased {
        let next_cursor = cursor.unwrap_or(Value::Null);
        if object_mode && all_results.len() == 1 {
            let mut merged = Map::new();
            merged.insert("next_cursor".to_string(), next_cursor);
            if let Some(Value::Object(map)) = all_results.into_iter().next() {
                for (k, v) in map {
                    merged.insert(k, v);
                }
            }
            return Value::Object(merged);
        }
        let mut merged = Map::new();
        merged.insert("next_cursor".to_string(), next_cursor);
        merged.insert("results".to_string(), Value::Array(all_results));
        return Value::Object(merged);
    }

    let mut all_results = all_results;
    if all_results.len() == 1 {
        all_results.remove(0)
    } else {
        Value::Array(all_results)
    }
}
