//! Self-healing configuration agent.
//!
//! When a step fails (or its response is judged wrong), the agent asks
//! an LLM to regenerate the step configuration, executes the proposal,
//! and loops until success, abort, or attempt exhaustion:
//!
//! ```text
//! INIT → GENERATE → SUBMIT_PROPOSAL → EXECUTE → (success → DONE)
//!                                             → (failure, k<MAX → GENERATE)
//!                                             → (abort or k=MAX → FAIL)
//! ```
//!
//! Message history grows monotonically across attempts within one
//! episode; the temperature ramps with the attempt counter.

mod prompts;

pub use prompts::{
    endpoint_schema, initial_user_prompt, payload_sample, retry_user_prompt,
    select_documentation_excerpt, SELF_HEALING_SYSTEM_PROMPT,
};

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::endpoint::{Endpoint, RequestOptions, ResponseEnvelope};
use crate::error::{Error, Result};
use crate::evaluator::ResponseEvaluator;
use crate::llm::{
    temperature_for_attempt, ChatMessage, LlmClient, ObjectOutcome, ObjectRequest, ToolDefinition,
};
use crate::mask::mask_credentials;
use crate::runner::StepRunner;

/// Handler for a custom tool: arguments in, JSON result out.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A caller-supplied tool the LLM may use in intermediate turns
/// (e.g. `search_documentation`).
#[derive(Clone)]
pub struct CustomTool {
    pub definition: ToolDefinition,
    pub handler: ToolHandler,
}

impl CustomTool {
    pub fn new(definition: ToolDefinition, handler: ToolHandler) -> Self {
        Self {
            definition,
            handler,
        }
    }
}

/// Configuration for a healing episode.
#[derive(Debug, Clone)]
pub struct HealingConfig {
    /// Attempt cap (GENERATE→EXECUTE cycles). Typical: 3–10.
    pub max_attempts: u32,
    /// Run the response evaluator on 2xx results.
    pub evaluate_responses: bool,
    /// Guard against a model that calls custom tools forever without
    /// ever submitting.
    pub max_tool_turns_per_attempt: u32,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            evaluate_responses: true,
            max_tool_turns_per_attempt: 8,
        }
    }
}

impl HealingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_response_evaluation(mut self, enabled: bool) -> Self {
        self.evaluate_responses = enabled;
        self
    }
}

/// Result of a healed step execution.
#[derive(Debug, Clone)]
pub struct HealingOutcome {
    pub envelope: ResponseEnvelope,
    /// The configuration that finally worked (the original, if no
    /// healing was needed).
    pub endpoint: Endpoint,
    /// Step executions performed (initial try plus accepted proposals).
    pub executions: u32,
    /// Full episode message history (empty when no healing ran).
    pub messages: Vec<ChatMessage>,
}

/// The self-healing agent.
pub struct HealingAgent {
    llm: Arc<dyn LlmClient>,
    runner: Arc<StepRunner>,
    evaluator: ResponseEvaluator,
    config: HealingConfig,
}

impl HealingAgent {
    pub fn new(llm: Arc<dyn LlmClient>, runner: Arc<StepRunner>) -> Self {
        Self {
            evaluator: ResponseEvaluator::new(Arc::clone(&llm)),
            llm,
            runner,
            config: HealingConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HealingConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute a step, healing its configuration on failure.
    ///
    /// The original endpoint is tried first. Errors that healing cannot
    /// address (cancellation, sandbox exhaustion, aborts) pass through
    /// unchanged.
    #[instrument(skip_all, fields(url = %endpoint.url_host))]
    pub async fn execute_with_healing(
        &self,
        endpoint: &Endpoint,
        payload: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
        documentation: Option<&str>,
        custom_tools: &[CustomTool],
        cancel: &CancellationToken,
    ) -> Result<HealingOutcome> {
        let mut executions: u32 = 1;
        let first_error = match self
            .try_execute(endpoint, payload, credentials, options, documentation, cancel)
            .await
        {
            Ok(envelope) => {
                return Ok(HealingOutcome {
                    envelope,
                    endpoint: endpoint.clone(),
                    executions,
                    messages: Vec::new(),
                })
            }
            Err(err) if err.is_healable() => err,
            Err(err) => return Err(err),
        };

        info!("step failed, starting healing episode: {first_error}");

        let mut messages = vec![
            ChatMessage::system(SELF_HEALING_SYSTEM_PROMPT),
            ChatMessage::user(initial_user_prompt(
                endpoint,
                &mask_credentials(&first_error.to_string(), credentials),
                documentation,
                credentials,
                payload,
            )),
        ];
        let mut tool_uses: HashMap<String, u32> = HashMap::new();
        let mut last_error = first_error;

        for attempt in 0..self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let proposal = self
                .generate_proposal(&mut messages, &mut tool_uses, custom_tools, attempt, cancel)
                .await?;

            let candidate = match proposal {
                Proposal::Submit(candidate) => candidate,
                Proposal::Abort(reason) => return Err(Error::llm_abort(reason)),
            };

            debug!(attempt, "executing proposed configuration");
            executions += 1;
            match self
                .try_execute(&candidate, payload, credentials, options, documentation, cancel)
                .await
            {
                Ok(envelope) => {
                    messages.push(ChatMessage::tool(
                        "submitted configuration executed successfully".to_string(),
                    ));
                    info!(attempt, executions, "healing succeeded");
                    return Ok(HealingOutcome {
                        envelope,
                        endpoint: candidate,
                        executions,
                        messages,
                    });
                }
                Err(err) if err.is_healable() => {
                    let masked = mask_credentials(&err.to_string(), credentials);
                    messages.push(ChatMessage::tool(format!(
                        "submitted configuration failed: {masked}"
                    )));
                    messages.push(ChatMessage::user(retry_user_prompt(&masked)));
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            attempts = self.config.max_attempts,
            "healing exhausted without a working configuration"
        );
        Err(Error::llm_exhausted(
            self.config.max_attempts,
            mask_credentials(&last_error.to_string(), credentials),
        ))
    }

    /// One GENERATE phase: call the LLM (re-invoking through custom tool
    /// turns) until it submits or aborts.
    async fn generate_proposal(
        &self,
        messages: &mut Vec<ChatMessage>,
        tool_uses: &mut HashMap<String, u32>,
        custom_tools: &[CustomTool],
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Proposal> {
        let temperature = temperature_for_attempt(attempt);

        for _turn in 0..self.config.max_tool_turns_per_attempt {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut tools = vec![
                ToolDefinition::submit(endpoint_schema()),
                ToolDefinition::abort(),
            ];
            for tool in custom_tools {
                let used = tool_uses.get(&tool.definition.name).copied().unwrap_or(0);
                let exhausted = tool
                    .definition
                    .max_uses
                    .map(|cap| used >= cap)
                    .unwrap_or(false);
                // A tool past its budget is not offered again.
                if !exhausted {
                    tools.push(tool.definition.clone());
                }
            }

            let response = self
                .llm
                .generate_object(ObjectRequest {
                    messages: messages.clone(),
                    schema: endpoint_schema(),
                    temperature,
                    tools,
                })
                .await?;
            *messages = response.messages;

            match response.outcome {
                ObjectOutcome::Submit(args) => {
                    let candidate: Endpoint = serde_json::from_value(args).map_err(|e| {
                        Error::Fatal(format!("submitted configuration is malformed: {e}"))
                    })?;
                    return Ok(Proposal::Submit(candidate));
                }
                ObjectOutcome::Abort { reason } => return Ok(Proposal::Abort(reason)),
                ObjectOutcome::ToolUse(call) => {
                    let tool = custom_tools
                        .iter()
                        .find(|t| t.definition.name == call.name)
                        .ok_or_else(|| {
                            Error::Fatal(format!("model called unknown tool '{}'", call.name))
                        })?;
                    *tool_uses.entry(call.name.clone()).or_insert(0) += 1;
                    debug!(tool = %call.name, "running custom tool");
                    let result = (tool.handler)(call.arguments).await;
                    let content = match result {
                        Ok(value) => value.to_string(),
                        Err(err) => format!("tool failed: {err}"),
                    };
                    messages.push(ChatMessage::tool(content));
                }
            }
        }

        Err(Error::Fatal(
            "model kept calling tools without submitting a configuration".to_string(),
        ))
    }

    /// Execute and, for 2xx results, apply the response evaluator.
    async fn try_execute(
        &self,
        endpoint: &Endpoint,
        payload: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
        documentation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let envelope = self
            .runner
            .run_step(endpoint, payload, credentials, options, None, cancel)
            .await?;

        if self.config.evaluate_responses {
            let verdict = self
                .evaluator
                .evaluate(&envelope.data, endpoint, documentation)
                .await?;
            if !verdict.success {
                return Err(Error::status(
                    format!(
                        "response rejected by evaluation: {}{}",
                        verdict.short_reason,
                        if verdict.refactor_needed {
                            " (the request approach needs rebuilding)"
                        } else {
                            ""
                        }
                    ),
                    envelope.status_code,
                ));
            }
        }

        Ok(envelope)
    }
}

enum Proposal {
    Submit(Endpoint),
    Abort(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HttpMethod;
    use crate::llm::{ObjectResponse, TextRequest, TextResponse};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Scripted LLM: pops the next outcome per generate_object call and
    /// appends an assistant message the way a provider would.
    struct ScriptedLlm {
        outcomes: Mutex<Vec<ObjectOutcome>>,
        observed_temperatures: Mutex<Vec<f64>>,
    }

    impl ScriptedLlm {
        fn new(outcomes: Vec<ObjectOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                observed_temperatures: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate_text(&self, _request: TextRequest) -> Result<TextResponse> {
            unimplemented!("not used by the agent")
        }

        async fn generate_object(&self, request: ObjectRequest) -> Result<ObjectResponse> {
            self.observed_temperatures
                .lock()
                .unwrap()
                .push(request.temperature);
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .remove(0);
            let mut messages = request.messages;
            messages.push(ChatMessage::assistant(format!("{outcome:?}")));
            Ok(ObjectResponse { outcome, messages })
        }
    }

    fn submit_outcome(server_uri: &str, with_auth: bool) -> ObjectOutcome {
        let mut config = json!({
            "method": "GET",
            "urlHost": server_uri,
            "urlPath": "/items",
            "instruction": "fetch items",
        });
        if with_auth {
            config["headers"] = json!([["Authorization", "Bearer <<api_token>>"]]);
            config["authentication"] = json!("HEADER");
        }
        ObjectOutcome::Submit(config)
    }

    fn creds() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("api_token".to_string(), "tok-valid-123".to_string());
        map
    }

    fn agent_with(llm: Arc<dyn LlmClient>, evaluate: bool) -> HealingAgent {
        HealingAgent::new(llm, Arc::new(StepRunner::new())).with_config(
            HealingConfig::new()
                .with_max_attempts(3)
                .with_response_evaluation(evaluate),
        )
    }

    #[tokio::test]
    async fn test_healthy_step_skips_healing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let agent = agent_with(llm, false);
        let endpoint = Endpoint::new(server.uri())
            .with_method(HttpMethod::Get)
            .with_path("/items")
            .with_instruction("fetch items");

        let outcome = agent
            .execute_with_healing(
                &endpoint,
                &json!({}),
                &HashMap::new(),
                &RequestOptions::default().with_retries(0),
                None,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.executions, 1);
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.envelope.data, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn test_healing_loop_fixes_auth() {
        let server = MockServer::start().await;
        // Unauthenticated requests fail, authenticated ones succeed.
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("Authorization", "Bearer tok-valid-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "auth"})))
            .expect(1)
            .mount(&server)
            .await;

        let llm = Arc::new(ScriptedLlm::new(vec![submit_outcome(&server.uri(), true)]));
        let agent = agent_with(Arc::clone(&llm) as Arc<dyn LlmClient>, false);
        let endpoint = Endpoint::new(server.uri())
            .with_method(HttpMethod::Get)
            .with_path("/items")
            .with_instruction("fetch items");

        let outcome = agent
            .execute_with_healing(
                &endpoint,
                &json!({}),
                &creds(),
                &RequestOptions::default().with_retries(0),
                None,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Exactly two step executions: the failing original and the
        // healed retry.
        assert_eq!(outcome.executions, 2);
        assert_eq!(outcome.envelope.status_code, 200);
        // History: system, user, assistant submit, tool result. At
        // minimum four messages, monotonically grown.
        assert!(outcome.messages.len() >= 4);
        assert_eq!(outcome.messages[0].role, crate::llm::ChatRole::System);
        assert_eq!(outcome.messages[1].role, crate::llm::ChatRole::User);
    }

    #[tokio::test]
    async fn test_abort_surfaces_without_more_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let llm = Arc::new(ScriptedLlm::new(vec![ObjectOutcome::Abort {
            reason: "credentials lack the required scope".to_string(),
        }]));
        let agent = agent_with(llm, false);
        let endpoint = Endpoint::new(server.uri())
            .with_method(HttpMethod::Get)
            .with_path("/items")
            .with_instruction("fetch items");

        let err = agent
            .execute_with_healing(
                &endpoint,
                &json!({}),
                &HashMap::new(),
                &RequestOptions::default().with_retries(0),
                None,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::LlmAbort { reason } => {
                assert_eq!(reason, "credentials lack the required scope")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({})))
            .mount(&server)
            .await;

        // Every proposal is the same broken config.
        let llm = Arc::new(ScriptedLlm::new(vec![
            submit_outcome(&server.uri(), false),
            submit_outcome(&server.uri(), false),
            submit_outcome(&server.uri(), false),
        ]));
        let agent = agent_with(Arc::clone(&llm) as Arc<dyn LlmClient>, false);
        let endpoint = Endpoint::new(server.uri())
            .with_method(HttpMethod::Get)
            .with_path("/items")
            .with_instruction("fetch items");

        let err = agent
            .execute_with_healing(
                &endpoint,
                &json!({}),
                &HashMap::new(),
                &RequestOptions::default().with_retries(0),
                None,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::LlmExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }

        // Temperature ramps across attempts.
        let temperatures = llm.observed_temperatures.lock().unwrap().clone();
        assert_eq!(temperatures, vec![0.0, 0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_custom_tool_turns_then_submit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let search_call = ObjectOutcome::ToolUse(crate::llm::ToolCall {
            name: "search_documentation".to_string(),
            arguments: json!({"query": "items endpoint"}),
        });
        let fixed = {
            let mut config = json!({
                "method": "GET",
                "urlHost": server.uri(),
                "urlPath": "/v2/items",
                "instruction": "fetch items",
            });
            config["headers"] = json!([]);
            ObjectOutcome::Submit(config)
        };

        let llm = Arc::new(ScriptedLlm::new(vec![search_call, fixed]));
        let agent = agent_with(Arc::clone(&llm) as Arc<dyn LlmClient>, false);

        let tool = CustomTool::new(
            ToolDefinition::new(
                "search_documentation",
                "Search the API docs",
                json!({"type": "object"}),
            )
            .with_max_uses(2),
            Arc::new(|_args| {
                Box::pin(async { Ok(json!({"excerpt": "use /v2/items"})) })
                    as BoxFuture<'static, Result<Value>>
            }),
        );

        let endpoint = Endpoint::new(server.uri())
            .with_method(HttpMethod::Get)
            .with_path("/items")
            .with_instruction("fetch items");

        let outcome = agent
            .execute_with_healing(
                &endpoint,
                &json!({}),
                &HashMap::new(),
                &RequestOptions::default().with_retries(0),
                None,
                &[tool],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.envelope.data, json!([{"id": 1}]));
        // Tool result message landed in the history.
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.content.contains("/v2/items")));
    }

    #[tokio::test]
    async fn test_unhealable_error_passes_through() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let agent = agent_with(llm, false);
        let endpoint = Endpoint::new("https://api.example.com")
            .with_method(HttpMethod::Get)
            .with_instruction("fetch items");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent
            .execute_with_healing(
                &endpoint,
                &json!({}),
                &HashMap::new(),
                &RequestOptions::default(),
                None,
                &[],
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
