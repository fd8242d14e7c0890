//! Response evaluation: an LLM judge of whether a successful response
//! actually satisfies the step's instruction.
//!
//! A 2xx with plausible-looking data can still be wrong: an empty
//! search result for a query that should match, a list of the wrong
//! entity, a soft failure the status interpreter has no key for. The
//! evaluator asks the model for a verdict constrained to
//! `{success, refactorNeeded, shortReason}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::interpreter::preview;
use crate::llm::{ChatMessage, LlmClient, ObjectOutcome, ObjectRequest, ToolDefinition};

/// Character budget for the response sample shown to the judge.
const RESPONSE_SAMPLE_LIMIT: usize = 4_000;

/// Character budget for the documentation excerpt.
const DOCUMENTATION_LIMIT: usize = 2_000;

/// Judge verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationVerdict {
    pub success: bool,
    /// True when the configuration approach itself is wrong (not just a
    /// parameter), so healing should rebuild rather than tweak.
    pub refactor_needed: bool,
    pub short_reason: String,
}

impl EvaluationVerdict {
    fn passed(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            refactor_needed: false,
            short_reason: reason.into(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            refactor_needed: false,
            short_reason: reason.into(),
        }
    }
}

fn verdict_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "success": { "type": "boolean" },
            "refactorNeeded": { "type": "boolean" },
            "shortReason": { "type": "string" }
        },
        "required": ["success", "refactorNeeded", "shortReason"]
    })
}

const JUDGE_SYSTEM_PROMPT: &str = "\
You judge whether an API response satisfies a step instruction. Rules:
- Field names that differ from the instruction's wording are fine as long \
as the data is the right data.
- Missing sorting, grouping, or aggregation never requires a refactor.
- Set refactorNeeded only when the request approach itself cannot produce \
the instructed data (wrong resource, wrong operation).
- Judge the data, not the formatting.
Finish by calling submit with your verdict.";

/// LLM-backed response evaluator.
pub struct ResponseEvaluator {
    client: Arc<dyn LlmClient>,
}

impl ResponseEvaluator {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Judge `data` against the endpoint's instruction.
    ///
    /// Empty bodies short-circuit without an LLM call: write-intent
    /// steps succeed (APIs often return nothing on success), while
    /// retrieval-intent steps fail (nothing retrieved is nothing
    /// achieved).
    pub async fn evaluate(
        &self,
        data: &Value,
        endpoint: &Endpoint,
        documentation: Option<&str>,
    ) -> Result<EvaluationVerdict> {
        if is_empty_body(data) {
            let retrieval = endpoint
                .method
                .map(|m| m.is_retrieval())
                .unwrap_or(false)
                || looks_like_retrieval(&endpoint.instruction);
            return Ok(if retrieval {
                EvaluationVerdict::failed("empty response for a retrieval instruction")
            } else {
                EvaluationVerdict::passed("empty response is acceptable for a write operation")
            });
        }

        let mut prompt = format!(
            "Instruction: {}\n\nResponse sample:\n{}",
            endpoint.instruction,
            preview(data, RESPONSE_SAMPLE_LIMIT),
        );
        if let Some(docs) = documentation {
            let mut excerpt = docs.to_string();
            excerpt.truncate(DOCUMENTATION_LIMIT);
            prompt.push_str("\n\nRelevant documentation:\n");
            prompt.push_str(&excerpt);
        }

        let request = ObjectRequest {
            messages: vec![
                ChatMessage::system(JUDGE_SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            schema: verdict_schema(),
            temperature: 0.0,
            tools: vec![
                ToolDefinition::submit(verdict_schema()),
                ToolDefinition::abort(),
            ],
        };

        let response = self.client.generate_object(request).await?;
        match response.outcome {
            ObjectOutcome::Submit(args) => {
                let verdict: EvaluationVerdict = serde_json::from_value(args)
                    .map_err(|e| Error::Fatal(format!("malformed evaluator verdict: {e}")))?;
                debug!(
                    success = verdict.success,
                    refactor = verdict.refactor_needed,
                    "response evaluated"
                );
                Ok(verdict)
            }
            ObjectOutcome::Abort { reason } => Ok(EvaluationVerdict::failed(reason)),
            ObjectOutcome::ToolUse(call) => Err(Error::Fatal(format!(
                "evaluator called unexpected tool '{}'",
                call.name
            ))),
        }
    }
}

fn is_empty_body(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Instruction phrasing that implies data should come back.
fn looks_like_retrieval(instruction: &str) -> bool {
    let lowered = instruction.to_lowercase();
    ["fetch", "get ", "list", "retrieve", "search", "find", "read", "query"]
        .iter()
        .any(|verb| lowered.contains(verb))
}
