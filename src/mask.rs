//! Credential masking for diagnostics.
//!
//! Every externally-visible string (error messages, log entries, prompt
//! payload echoes) passes through [`mask_credentials`] before emission.
//! The masker replaces any substring equal to a known credential value
//! with a redaction marker. It never touches credential *names*; those
//! are safe to show and useful for healing.

use serde_json::Value;
use std::collections::HashMap;

/// Replacement marker for masked credential values.
pub const MASK_MARKER: &str = "<<MASKED>>";

/// Credential values shorter than this are not masked. Very short values
/// (ids like "1", country codes) collide with ordinary text and would
/// shred the diagnostic.
pub const MIN_MASK_LENGTH: usize = 4;

/// Replace every occurrence of a credential value in `text` with
/// [`MASK_MARKER`].
///
/// Longer values are replaced first so that a credential which is a
/// substring of another does not leave a partial tail behind. Idempotent:
/// masking already-masked text is a no-op because the marker itself never
/// appears in a credential map.
pub fn mask_credentials(text: &str, credentials: &HashMap<String, String>) -> String {
    let mut values: Vec<&str> = credentials
        .values()
        .map(String::as_str)
        .filter(|v| v.len() >= MIN_MASK_LENGTH)
        .collect();
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));
    values.dedup();

    let mut out = text.to_string();
    for value in values {
        if out.contains(value) {
            out = out.replace(value, MASK_MARKER);
        }
    }
    out
}

/// Deep-mask credential values inside a JSON value.
///
/// Strings are masked in place; keys are left alone. Used when echoing a
/// request config or payload sample into a healing prompt.
pub fn mask_value(value: &Value, credentials: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(mask_credentials(s, credentials)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| mask_value(item, credentials))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask_value(v, credentials)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// True when `text` contains no credential value from `credentials`.
///
/// Equivalent to `mask_credentials(text, creds) == text`; used by tests
/// and debug assertions at emission boundaries.
pub fn is_masked(text: &str, credentials: &HashMap<String, String>) -> bool {
    credentials
        .values()
        .filter(|v| v.len() >= MIN_MASK_LENGTH)
        .all(|v| !text.contains(v.as_str()))
}
