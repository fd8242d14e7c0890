//! Workflow orchestration: ordered steps, LOOP execution, result
//! threading, and the final transform.
//!
//! Each step's result lands in the running scope under the step's id,
//! so later steps can reference `<<stepId.field>>` in their templates.
//! A LOOP step selects an array (via a sandboxed `loop_selector`) and
//! executes its endpoint once per element with `currentItem` bound.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::endpoint::{Endpoint, RequestOptions};
use crate::error::{Error, Result};
use crate::healing::{CustomTool, HealingAgent};
use crate::runner::StepRunner;
use crate::sandbox::Sandbox;

/// How a step consumes its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepExecutionMode {
    /// One execution against the merged scope.
    #[default]
    Direct,
    /// One execution per element of the selected array.
    Loop,
}

/// One workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub id: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub execution_mode: StepExecutionMode,
    /// Sandboxed expression selecting the array a LOOP step iterates;
    /// evaluated over the current scope (payload plus prior results).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_selector: Option<String>,
    /// Upper bound on LOOP iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_max_iters: Option<u32>,
}

/// An ordered workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub steps: Vec<ExecutionStep>,
    /// Sandboxed expression applied to the merged step results to shape
    /// the final payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_transform: Option<String>,
}

/// Outcome of one step inside a workflow result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a whole workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    /// Merged step id → data, shaped by `final_transform` when set.
    pub data: Value,
    pub step_results: Vec<StepResult>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Executes workflows over a step runner, optionally healing failing
/// steps.
pub struct WorkflowOrchestrator {
    runner: Arc<StepRunner>,
    healing: Option<Arc<HealingAgent>>,
    sandbox: Sandbox,
    webhook_client: reqwest::Client,
}

impl WorkflowOrchestrator {
    pub fn new(runner: Arc<StepRunner>) -> Self {
        Self {
            runner,
            healing: None,
            sandbox: Sandbox::new(),
            webhook_client: reqwest::Client::new(),
        }
    }

    /// Enable self-healing for failing steps.
    pub fn with_healing(mut self, healing: Arc<HealingAgent>) -> Self {
        self.healing = Some(healing);
        self
    }

    /// Run every step in order, threading results into later scopes.
    ///
    /// The first failing step stops the workflow; its error is recorded
    /// in the step results and the overall result is marked failed.
    #[instrument(skip_all, fields(workflow = %workflow.id))]
    pub async fn run_workflow(
        &self,
        workflow: &Workflow,
        payload: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
        custom_tools: &[CustomTool],
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult> {
        let started_at = chrono::Utc::now();
        let mut step_results: Vec<StepResult> = Vec::new();
        let mut merged = Map::new();
        // The running scope: caller payload plus each completed step's
        // data under its id.
        let mut scope = match payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let mut success = true;

        for step in &workflow.steps {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            info!(step = %step.id, mode = ?step.execution_mode, "executing step");

            let scope_value = Value::Object(scope.clone());
            let result = match step.execution_mode {
                StepExecutionMode::Direct => {
                    self.execute_step(step, &scope_value, credentials, options, None, custom_tools, cancel)
                        .await
                }
                StepExecutionMode::Loop => {
                    self.execute_loop_step(step, &scope_value, credentials, options, custom_tools, cancel)
                        .await
                }
            };

            match result {
                Ok(data) => {
                    scope.insert(step.id.clone(), data.clone());
                    merged.insert(step.id.clone(), data.clone());
                    step_results.push(StepResult {
                        step_id: step.id.clone(),
                        success: true,
                        data: Some(data),
                        error: None,
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(step = %step.id, "step failed: {err}");
                    step_results.push(StepResult {
                        step_id: step.id.clone(),
                        success: false,
                        data: None,
                        error: Some(err.to_string()),
                    });
                    success = false;
                    break;
                }
            }
        }

        let mut data = Value::Object(merged);
        if success {
            if let Some(transform) = &workflow.final_transform {
                data = self
                    .sandbox
                    .evaluate(transform, &[data.clone()])
                    .await
                    .map_err(|e| {
                        Error::Sandbox(format!("final transform failed: {e}"))
                    })?;
            }
        }

        let result = WorkflowResult {
            workflow_id: workflow.id.clone(),
            success,
            data,
            step_results,
            started_at,
            completed_at: chrono::Utc::now(),
        };

        if let Some(url) = &options.webhook_url {
            self.notify_webhook(url, &result);
        }

        Ok(result)
    }

    async fn execute_step(
        &self,
        step: &ExecutionStep,
        scope_value: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
        current_item: Option<&Value>,
        custom_tools: &[CustomTool],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match (&self.healing, current_item) {
            // Healing wraps whole-step execution; loop iterations run
            // the raw runner (one failing element should not trigger a
            // config regeneration mid-loop).
            (Some(healing), None) => {
                let outcome = healing
                    .execute_with_healing(
                        &step.endpoint,
                        scope_value,
                        credentials,
                        options,
                        None,
                        custom_tools,
                        cancel,
                    )
                    .await?;
                Ok(outcome.envelope.data)
            }
            _ => {
                let envelope = self
                    .runner
                    .run_step(
                        &step.endpoint,
                        scope_value,
                        credentials,
                        options,
                        current_item,
                        cancel,
                    )
                    .await?;
                Ok(envelope.data)
            }
        }
    }

    async fn execute_loop_step(
        &self,
        step: &ExecutionStep,
        scope_value: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
        custom_tools: &[CustomTool],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let selector = step.loop_selector.as_deref().ok_or_else(|| {
            Error::Fatal(format!("loop step '{}' has no loopSelector", step.id))
        })?;
        let selected = self
            .sandbox
            .evaluate(selector, &[scope_value.clone()])
            .await
            .map_err(|e| Error::Sandbox(format!("loop selector failed: {e}")))?;

        let items = match selected {
            Value::Array(items) => items,
            other => {
                return Err(Error::Fatal(format!(
                    "loop selector for step '{}' must select an array, got {}",
                    step.id,
                    type_name(&other)
                )))
            }
        };

        let cap = step.loop_max_iters.map(|c| c as usize).unwrap_or(usize::MAX);
        let mut results = Vec::with_capacity(items.len().min(cap));
        for (index, item) in items.iter().take(cap).enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!(step = %step.id, index, "loop iteration");
            let data = self
                .execute_step(
                    step,
                    scope_value,
                    credentials,
                    options,
                    Some(item),
                    custom_tools,
                    cancel,
                )
                .await?;
            results.push(data);
        }
        if items.len() > cap {
            debug!(
                step = %step.id,
                skipped = items.len() - cap,
                "loop cap reached, remaining items skipped"
            );
        }
        Ok(Value::Array(results))
    }

    /// Fire-and-forget completion notification.
    fn notify_webhook(&self, url: &str, result: &WorkflowResult) {
        let client = self.webhook_client.clone();
        let url = url.to_string();
        let body = json!({
            "workflowId": result.workflow_id,
            "success": result.success,
            "data": result.data,
        });
        tokio::spawn(async move {
            if let Err(err) = client.post(&url).json(&body).send().await {
                warn!("webhook notification failed: {err}");
            }
        });
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
