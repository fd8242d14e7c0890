//! Prompt construction for healing episodes.
//!
//! The initial user prompt packs the step instruction, the failed
//! configuration, a relevance-selected documentation excerpt, credential
//! *names* (never values), and a sampled payload shape. Follow-up
//! prompts carry the prior error verbatim; it is already masked by the
//! time it reaches this module.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};

use crate::endpoint::Endpoint;
use crate::mask::mask_value;

/// Character budget for the documentation excerpt.
pub const DOCUMENTATION_BUDGET: usize = 6_000;

/// Character budget for the payload sample.
pub const PAYLOAD_SAMPLE_BUDGET: usize = 2_000;

/// System prompt for the self-healing agent.
pub const SELF_HEALING_SYSTEM_PROMPT: &str = "\
You repair failing API step configurations. You receive the step's \
instruction, the configuration that failed, the error it produced, \
available credential names, a sample of the input payload, and (when \
available) API documentation.

Produce a corrected configuration and call the submit tool with it. \
Placeholders use <<name>> syntax and resolve against the payload, \
credentials, and pagination variables (page, offset, cursor, pageSize). \
Only reference credentials by the names listed. If the failure cannot be \
fixed by changing the configuration (wrong credentials, API gone, \
permission denied at the account level), call abort with a reason \
instead of guessing.";

/// Build the first user prompt of an episode.
pub fn initial_user_prompt(
    endpoint: &Endpoint,
    error: &str,
    documentation: Option<&str>,
    credentials: &HashMap<String, String>,
    payload: &Value,
) -> String {
    let mut prompt = format!(
        "Step instruction: {}\n\nFailed configuration:\n{}\n\nError:\n{error}\n",
        endpoint.instruction,
        serde_json::to_string_pretty(&mask_value(&endpoint.diagnostic_json(), credentials))
            .unwrap_or_default(),
    );

    let mut names: Vec<&str> = credentials.keys().map(String::as_str).collect();
    names.sort_unstable();
    prompt.push_str(&format!(
        "\nAvailable credential names: {}\n",
        if names.is_empty() {
            "(none)".to_string()
        } else {
            names.join(", ")
        }
    ));

    prompt.push_str(&format!(
        "\nPayload sample:\n{}\n",
        payload_sample(payload, PAYLOAD_SAMPLE_BUDGET)
    ));

    if let Some(docs) = documentation {
        let excerpt =
            select_documentation_excerpt(docs, &endpoint.instruction, DOCUMENTATION_BUDGET);
        if !excerpt.is_empty() {
            prompt.push_str(&format!("\nAPI documentation (excerpt):\n{excerpt}\n"));
        }
    }

    prompt
}

/// Follow-up prompt after a failed submission.
pub fn retry_user_prompt(error: &str) -> String {
    format!(
        "The submitted configuration failed with:\n{error}\n\n\
         Fix the configuration and submit again, or abort if this is not fixable."
    )
}

/// Pick the documentation paragraphs most relevant to the instruction,
/// in document order, within the character budget.
pub fn select_documentation_excerpt(documentation: &str, instruction: &str, budget: usize) -> String {
    if documentation.len() <= budget {
        return documentation.trim().to_string();
    }

    let keywords = keywords_of(instruction);
    let mut scored: Vec<(usize, i64)> = documentation
        .split("\n\n")
        .enumerate()
        .map(|(index, paragraph)| (index, score_paragraph(paragraph, &keywords)))
        .collect();
    scored.sort_by_key(|(_, score)| std::cmp::Reverse(*score));

    let paragraphs: Vec<&str> = documentation.split("\n\n").collect();
    let mut chosen: Vec<usize> = Vec::new();
    let mut used = 0usize;
    for (index, score) in scored {
        if score <= 0 && !chosen.is_empty() {
            break;
        }
        let length = paragraphs[index].len() + 2;
        if used + length > budget {
            continue;
        }
        used += length;
        chosen.push(index);
    }
    chosen.sort_unstable();

    chosen
        .into_iter()
        .map(|i| paragraphs[i].trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn keywords_of(instruction: &str) -> HashSet<String> {
    instruction
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

fn score_paragraph(paragraph: &str, keywords: &HashSet<String>) -> i64 {
    let lowered = paragraph.to_lowercase();
    keywords
        .iter()
        .map(|keyword| lowered.matches(keyword.as_str()).count() as i64)
        .sum()
}

/// Truncate a payload to a representative sample: long strings and
/// arrays are cut down, then the serialization is capped.
pub fn payload_sample(payload: &Value, budget: usize) -> String {
    let sampled = sample_value(payload, 3);
    let mut text = serde_json::to_string_pretty(&sampled).unwrap_or_default();
    if text.len() > budget {
        let mut end = budget;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("… [truncated]");
    }
    text
}

fn sample_value(value: &Value, depth: u8) -> Value {
    match value {
        Value::Array(items) => {
            if depth == 0 {
                return json!(format!("[{} items]", items.len()));
            }
            let mut sampled: Vec<Value> = items
                .iter()
                .take(3)
                .map(|item| sample_value(item, depth - 1))
                .collect();
            if items.len() > 3 {
                sampled.push(json!(format!("… {} more items", items.len() - 3)));
            }
            Value::Array(sampled)
        }
        Value::Object(map) => {
            if depth == 0 {
                return json!(format!("{{{} keys}}", map.len()));
            }
            let mut sampled = Map::new();
            for (k, v) in map {
                sampled.insert(k.clone(), sample_value(v, depth - 1));
            }
            Value::Object(sampled)
        }
        Value::String(s) if s.len() > 120 => {
            let mut end = 120;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            json!(format!("{}…", &s[..end]))
        }
        other => other.clone(),
    }
}

/// JSON schema for the `submit` tool: the endpoint configuration shape.
pub fn endpoint_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "method": {
                "type": "string",
                "enum": ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"]
            },
            "urlHost": { "type": "string" },
            "urlPath": { "type": "string" },
            "headers": {
                "type": "array",
                "items": {
                    "type": "array",
                    "prefixItems": [{ "type": "string" }, { "type": "string" }]
                }
            },
            "queryParams": {
                "type": "object",
                "additionalProperties": { "type": "string" }
            },
            "body": {},
            "authentication": {
                "type": "string",
                "enum": ["NONE", "HEADER", "QUERY_PARAM", "OAUTH2"]
            },
            "pagination": {
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": ["PAGE_BASED", "OFFSET_BASED", "CURSOR_BASED"]
                    },
                    "pageSize": { "type": "string" },
                    "cursorPath": { "type": "string" },
                    "stopCondition": { "type": "string" }
                },
                "required": ["type"]
            },
            "dataPath": { "type": "string" },
            "instruction": { "type": "string" },
            "documentationUrl": { "type": "string" }
        },
        "required": ["urlHost"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_initial_prompt_lists_credential_names_not_values() {
        let endpoint = Endpoint::new("https://api.example.com").with_instruction("fetch items");
        let mut creds = HashMap::new();
        creds.insert("shop_apiKey".to_string(), "sk_live_9876543".to_string());
        let prompt = initial_user_prompt(&endpoint, "401", None, &creds, &json!({}));
        assert!(prompt.contains("shop_apiKey"));
        assert!(!prompt.contains("sk_live_9876543"));
    }

    #[test]
    fn test_initial_prompt_masks_config_echo() {
        let endpoint = Endpoint::new("https://api.example.com")
            .with_header("Authorization", "Bearer sk_live_9876543")
            .with_instruction("fetch items");
        let mut creds = HashMap::new();
        creds.insert("shop_apiKey".to_string(), "sk_live_9876543".to_string());
        let prompt = initial_user_prompt(&endpoint, "401", None, &creds, &json!({}));
        assert!(!prompt.contains("sk_live_9876543"));
    }

    #[test]
    fn test_documentation_selection_prefers_relevant_paragraphs() {
        let documentation = "\
Billing: invoices are issued monthly and can be downloaded as PDF.\n\n\
Orders: list orders with GET /v2/orders, paginated by the page parameter.\n\n\
Webhooks: subscribe to events with POST /v2/webhooks.";
        let excerpt = select_documentation_excerpt(documentation, "list all orders", 80);
        assert!(excerpt.contains("GET /v2/orders"));
        assert!(!excerpt.contains("Webhooks"));
    }

    #[test]
    fn test_documentation_within_budget_kept_whole() {
        let documentation = "short docs";
        assert_eq!(
            select_documentation_excerpt(documentation, "anything", 1000),
            "short docs"
        );
    }

    #[test]
    fn test_payload_sample_truncates_arrays() {
        let payload = json!({"rows": (0..100).collect::<Vec<u32>>()});
        let sample = payload_sample(&payload, 10_000);
        assert!(sample.contains("97 more items"));
    }

    #[test]
    fn test_payload_sample_respects_budget() {
        let mut map = Map::new();
        for i in 0..100 {
            map.insert(format!("field_{i}"), json!("some value"));
        }
        let sample = payload_sample(&Value::Object(map), 500);
        assert!(sample.len() < 600);
        assert!(sample.ends_with("[truncated]"));
    }

    #[test]
    fn test_payload_sample_shortens_long_strings() {
        let payload = json!({"text": "x".repeat(5_000)});
        let sample = payload_sample(&payload, 10_000);
        assert!(sample.len() < 300);
    }

    #[test]
    fn test_endpoint_schema_is_object_schema() {
        let schema = endpoint_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["pagination"].is_object());
    }
}
