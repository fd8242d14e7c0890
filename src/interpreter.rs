//! Status interpretation: deciding whether a transport outcome is a
//! success, a retryable failure, or a hard failure.
//!
//! The tricky part is the 2xx-as-error detection: plenty of backends
//! return HTTP 200 with an error payload. The interpreter inspects the
//! decoded body (and the raw byte prefix for HTML masquerading as JSON)
//! and produces masked diagnostics for everything it rejects.

use std::collections::HashMap;

use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::mask::mask_credentials;

/// Keys whose non-empty value marks a 2xx response as failed.
/// Compared case-insensitively.
const ERROR_KEYS: &[&str] = &[
    "error",
    "errors",
    "error_message",
    "errormessage",
    "failure_reason",
    "failure",
    "failed",
    "error message",
];

/// How deep the error-key search descends into the body.
const ERROR_KEY_SEARCH_DEPTH: u8 = 2;

/// Byte budget examined for the HTML-in-JSON check.
const HTML_SNIFF_LIMIT: usize = 1024;

/// Response preview budget for error-status messages.
const PREVIEW_LIMIT: usize = 1024;

/// Larger preview for 2xx-as-error diagnostics: the body is the whole
/// evidence there, so the step-level report carries more of it.
const BODY_FAILURE_PREVIEW_LIMIT: usize = 2_560;

/// Verdict for one transport outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub should_fail: bool,
    pub message: Option<String>,
}

impl Interpretation {
    fn ok() -> Self {
        Self {
            should_fail: false,
            message: None,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            should_fail: true,
            message: Some(message),
        }
    }
}

/// Interpret a decoded response against its request configuration.
///
/// Pure: no I/O, no retries. The transport has already done its retry
/// ladder by the time this runs. `raw_prefix` is the undecoded byte
/// prefix used for HTML detection; pass an empty slice for non-HTTP
/// transports.
pub fn interpret_response(
    status_code: u16,
    data: &Value,
    raw_prefix: &[u8],
    expected_json: bool,
    endpoint: &Endpoint,
    credentials: &HashMap<String, String>,
) -> Interpretation {
    if !(200..300).contains(&status_code) {
        return Interpretation::fail(error_status_message(
            status_code,
            data,
            endpoint,
            credentials,
        ));
    }

    if expected_json && is_html_prefix(raw_prefix) {
        return Interpretation::fail(mask_credentials(
            &format!(
                "{} {} returned HTML where JSON was expected (status {status_code}). \
                 Response preview: {}. Request config: {}",
                method_of(endpoint),
                endpoint.full_url(),
                preview(data, BODY_FAILURE_PREVIEW_LIMIT),
                endpoint.diagnostic_json()
            ),
            credentials,
        ));
    }

    if let Some(reason) = find_error_in_body(data) {
        return Interpretation::fail(mask_credentials(
            &format!(
                "{} {} returned {status_code} but the body indicates failure: \
                 error key detected ({reason}). Response preview: {}. Request config: {}",
                method_of(endpoint),
                endpoint.full_url(),
                preview(data, BODY_FAILURE_PREVIEW_LIMIT),
                endpoint.diagnostic_json()
            ),
            credentials,
        ));
    }

    Interpretation::ok()
}

/// Message for a non-2xx status.
pub fn error_status_message(
    status_code: u16,
    data: &Value,
    endpoint: &Endpoint,
    credentials: &HashMap<String, String>,
) -> String {
    mask_credentials(
        &format!(
            "{} {} failed with status {status_code}. Response: {}. Request config: {}",
            method_of(endpoint),
            endpoint.full_url(),
            preview(data, PREVIEW_LIMIT),
            endpoint.diagnostic_json()
        ),
        credentials,
    )
}

/// Message prefix for a 429 whose backoff budget ran out.
pub fn rate_limit_exhausted_message(
    retry_after: Option<&str>,
    status_message: &str,
) -> String {
    match retry_after {
        Some(value) => format!(
            "Rate limited (Retry-After: {value}) and the accumulated wait budget was exceeded. \
             {status_message}"
        ),
        None => format!(
            "Rate limited with no Retry-After header and the accumulated wait budget was \
             exceeded. {status_message}"
        ),
    }
}

fn method_of(endpoint: &Endpoint) -> &'static str {
    endpoint.method.map(|m| m.as_str()).unwrap_or("CALL")
}

/// Bounded textual preview of a decoded body.
pub fn preview(data: &Value, limit: usize) -> String {
    let text = match data {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    if text.len() <= limit {
        text
    } else {
        let mut end = limit;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}… [truncated]", &text[..end])
    }
}

/// HTML detection over the raw byte prefix: trim, lowercase, and look
/// for a document leader within the first kilobyte.
pub fn is_html_prefix(raw: &[u8]) -> bool {
    let window = &raw[..raw.len().min(HTML_SNIFF_LIMIT)];
    let text = String::from_utf8_lossy(window);
    let lowered = text.trim_start().to_lowercase();
    lowered.starts_with("<!doctype html") || lowered.starts_with("<html")
}

/// Search the top-level object (or the first element of a top-level
/// array) for failure markers.
fn find_error_in_body(data: &Value) -> Option<String> {
    let target = match data {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let map = target.as_object()?;

    // Numeric code/status fields in the error range.
    for key in ["code", "status"] {
        if let Some(Value::Number(n)) = map.get(key) {
            if let Some(code) = n.as_i64() {
                if (400..=599).contains(&code) {
                    return Some(format!("{key}={code}"));
                }
            }
        }
    }

    search_error_keys(target, ERROR_KEY_SEARCH_DEPTH)
}

fn search_error_keys(value: &Value, depth: u8) -> Option<String> {
    let map = value.as_object()?;
    for (key, entry) in map {
        let lowered = key.to_lowercase();
        if ERROR_KEYS.contains(&lowered.as_str()) && !is_empty_marker(entry) {
            return Some(format!("{key}: {}", preview(entry, 200)));
        }
    }
    if depth > 1 {
        for entry in map.values() {
            if let Some(found) = search_error_keys(entry, depth - 1) {
                return Some(found);
            }
        }
    }
    None
}

/// Values that do not count as an error indication.
fn is_empty_marker(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HttpMethod;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn endpoint() -> Endpoint {
        Endpoint::new("https://api.example.com")
            .with_method(HttpMethod::Get)
            .with_path("/items")
    }

    fn no_creds() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_clean_200_passes() {
        let verdict = interpret_response(
            200,
            &json!({"items": [1, 2]}),
            br#"{"items": [1, 2]}"#,
            true,
            &endpoint(),
            &no_creds(),
        );
        assert_eq!(verdict, Interpretation::ok());
    }

    #[test]
    fn test_error_status_fails_with_context() {
        let verdict = interpret_response(
            404,
            &json!({"detail": "not found"}),
            b"",
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(verdict.should_fail);
        let message = verdict.message.unwrap();
        assert!(message.contains("GET"));
        assert!(message.contains("https://api.example.com/items"));
        assert!(message.contains("404"));
        assert!(message.contains("not found"));
    }

    #[test]
    fn test_2xx_with_error_key() {
        let verdict = interpret_response(
            200,
            &json!({"error": "quota exceeded"}),
            b"{}",
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(verdict.should_fail);
        let message = verdict.message.unwrap();
        assert!(message.contains("error key detected"));
        assert!(message.contains("quota exceeded"));
    }

    #[test]
    fn test_2xx_with_embedded_status_code() {
        let verdict = interpret_response(
            200,
            &json!({"status": 500, "message": "internal"}),
            b"{}",
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(verdict.should_fail);
        assert!(verdict.message.unwrap().contains("status=500"));
    }

    #[test]
    fn test_2xx_status_below_400_passes() {
        let verdict = interpret_response(
            200,
            &json!({"status": 200, "data": []}),
            b"{}",
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(!verdict.should_fail);
    }

    #[test]
    fn test_error_key_search_depth_two() {
        // Depth 2: found under one level of nesting.
        let verdict = interpret_response(
            200,
            &json!({"result": {"errors": ["boom"]}}),
            b"{}",
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(verdict.should_fail);

        // Depth 3: too deep, passes.
        let verdict = interpret_response(
            200,
            &json!({"a": {"b": {"errors": ["boom"]}}}),
            b"{}",
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(!verdict.should_fail);
    }

    #[test]
    fn test_empty_error_markers_pass() {
        for body in [
            json!({"error": null}),
            json!({"error": ""}),
            json!({"errors": []}),
            json!({"failed": false}),
        ] {
            let verdict =
                interpret_response(200, &body, b"{}", true, &endpoint(), &no_creds());
            assert!(!verdict.should_fail, "body {body} must pass");
        }
    }

    #[test]
    fn test_first_array_element_checked() {
        let verdict = interpret_response(
            200,
            &json!([{"failure_reason": "expired token"}]),
            b"[]",
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(verdict.should_fail);
    }

    #[test]
    fn test_html_body_when_json_expected() {
        let raw = b"\n  <!DOCTYPE HTML><html><body>503</body></html>";
        let verdict = interpret_response(
            200,
            &json!(String::from_utf8_lossy(raw).to_string()),
            raw,
            true,
            &endpoint(),
            &no_creds(),
        );
        assert!(verdict.should_fail);
        assert!(verdict.message.unwrap().contains("HTML"));
    }

    #[test]
    fn test_html_body_fine_when_html_expected() {
        let raw = b"<html><body>a page</body></html>";
        let verdict = interpret_response(
            200,
            &json!("a page"),
            raw,
            false,
            &endpoint(),
            &no_creds(),
        );
        assert!(!verdict.should_fail);
    }

    #[test]
    fn test_messages_are_masked() {
        let mut creds = HashMap::new();
        creds.insert("api_token".to_string(), "sekret-value-1".to_string());
        let endpoint = endpoint().with_header("Authorization", "Bearer sekret-value-1");
        let verdict = interpret_response(
            401,
            &json!({"error": "bad token sekret-value-1"}),
            b"",
            true,
            &endpoint,
            &creds,
        );
        let message = verdict.message.unwrap();
        assert!(!message.contains("sekret-value-1"));
    }

    #[test]
    fn test_preview_truncation() {
        let long = "x".repeat(5000);
        let text = preview(&json!(long), 1024);
        assert!(text.len() < 1100);
        assert!(text.ends_with("[truncated]"));
    }

    #[test]
    fn test_rate_limit_message_prefix() {
        let message = rate_limit_exhausted_message(Some("120"), "GET https://x failed");
        assert!(message.starts_with("Rate limited (Retry-After: 120)"));
    }
}
