//! Sandboxed evaluation of untrusted expression strings.
//!
//! Stop conditions and templated variables are user-authored source
//! strings. They run in an isolated evaluator that can only see the JSON
//! arguments handed to it: no host I/O, no environment, no filesystem,
//! no process APIs. Inputs are marshaled through JSON serialization so
//! no live references cross the boundary, evaluation burns fuel per
//! step, and a wall-clock timeout backstops the fuel cap.
//!
//! Source canonicalization:
//! - a bare expression becomes `(response, pageInfo) => EXPR`;
//! - a block starting with `return` becomes
//!   `(response, pageInfo) => { EXPR }`;
//! - anything already shaped like an arrow function is used as-is.

mod eval;
mod parser;

pub use eval::{EvalLimits, JsValue};
pub use parser::{ArrowFn, Expr};

use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use eval::Evaluator;
use parser::parse_arrow_fn;

/// Outcome of a stop-condition evaluation. Errors do not escape the
/// sandbox boundary as failures; the pagination controller decides
/// whether to re-raise them.
#[derive(Debug, Clone, PartialEq)]
pub struct StopVerdict {
    pub should_stop: bool,
    pub error: Option<String>,
}

/// Resource limits for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub eval: EvalLimits,
    /// Wall-clock cap per evaluation.
    pub timeout: Duration,
    /// Cap on total marshaled input, approximating the memory budget.
    pub max_input_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            eval: EvalLimits::default(),
            timeout: Duration::from_secs(3),
            max_input_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Sandboxed expression evaluator.
///
/// Stateless between calls: every evaluation parses, runs, and drops its
/// own evaluator, so nothing leaks across tenants or iterations.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    /// Whether a source string is already shaped like an arrow function.
    pub fn is_arrow(source: &str) -> bool {
        looks_like_arrow(source.trim())
    }

    /// Rewrite a source string into full arrow-function form.
    pub fn canonicalize(source: &str) -> String {
        let trimmed = source.trim();
        if looks_like_arrow(trimmed) {
            return trimmed.to_string();
        }
        if trimmed.starts_with("return ") || trimmed == "return" || trimmed.starts_with("return\n")
        {
            return format!("(response, pageInfo) => {{ {trimmed} }}");
        }
        format!("(response, pageInfo) => {trimmed}")
    }

    /// Evaluate a stop condition against `(response, pageInfo)`.
    ///
    /// Never fails: evaluator errors come back as
    /// `{should_stop: false, error}`. Cancellation and scheduling errors
    /// are folded into the same shape.
    pub async fn evaluate_stop_condition(
        &self,
        source: &str,
        response: &Value,
        page_info: &Value,
    ) -> StopVerdict {
        match self
            .evaluate(source, &[response.clone(), page_info.clone()])
            .await
        {
            Ok(value) => StopVerdict {
                should_stop: truthy_json(&value),
                error: None,
            },
            Err(err) => StopVerdict {
                should_stop: false,
                error: Some(err.to_string()),
            },
        }
    }

    /// Evaluate an arrow-function expression with positional arguments,
    /// returning the sanitized JSON result.
    pub async fn evaluate(&self, source: &str, args: &[Value]) -> Result<Value> {
        let canonical = Self::canonicalize(source);
        let limits = self.limits;

        // Marshal inputs to JSON text; the sandbox deserializes its own
        // copies so no live references cross the boundary.
        let mut marshaled = Vec::with_capacity(args.len());
        let mut total = 0usize;
        for arg in args {
            let text = serde_json::to_string(arg)
                .map_err(|e| Error::Sandbox(format!("failed to marshal input: {e}")))?;
            total += text.len();
            marshaled.push(text);
        }
        if total > limits.max_input_bytes {
            return Err(Error::Sandbox("input exceeds sandbox memory budget".into()));
        }

        let handle = tokio::task::spawn_blocking(move || {
            evaluate_blocking(&canonical, &marshaled, limits.eval)
        });

        match tokio::time::timeout(limits.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Sandbox(format!("evaluation task failed: {join_err}"))),
            Err(_) => Err(Error::Sandbox(format!(
                "evaluation exceeded {}ms time limit",
                limits.timeout.as_millis()
            ))),
        }
    }
}

/// Parse-and-run on the current thread. The fuel cap guarantees
/// termination even if the caller's timeout already fired.
fn evaluate_blocking(canonical: &str, marshaled_args: &[String], limits: EvalLimits) -> Result<Value> {
    let function = parse_arrow_fn(canonical)?;

    let mut args = Vec::with_capacity(marshaled_args.len());
    for text in marshaled_args {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Sandbox(format!("failed to unmarshal input: {e}")))?;
        args.push(JsValue::from_json(&value));
    }

    let result = Evaluator::new(limits).call(&function, args)?;
    Ok(result.into_json())
}

/// JS truthiness over the sanitized JSON result.
fn truthy_json(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn looks_like_arrow(source: &str) -> bool {
    // `(a, b) => …`, `(a) => …`, or `a => …` with nothing before the
    // parameter list. Cheap scan instead of a full parse.
    let bytes = source.as_bytes();
    let mut i = 0;
    if bytes.first() == Some(&b'(') {
        let mut depth = 0usize;
        while i < bytes.len() {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'$' | b',' | b' ' | b'\t'
                | b'\n' | b'\r' => {}
                _ => return false,
            }
            i += 1;
        }
    } else {
        while i < bytes.len()
            && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
        {
            i += 1;
        }
        if i == 0 {
            return false;
        }
    }
    source[i..].trim_start().starts_with("=>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_canonicalize_bare_expression() {
        assert_eq!(
            Sandbox::canonicalize("response.done"),
            "(response, pageInfo) => response.done"
        );
    }

    #[test]
    fn test_canonicalize_return_block() {
        assert_eq!(
            Sandbox::canonicalize("return response.done"),
            "(response, pageInfo) => { return response.done }"
        );
    }

    #[test]
    fn test_canonicalize_keeps_arrow() {
        let source = "(r, p) => r.items.length === 0";
        assert_eq!(Sandbox::canonicalize(source), source);
        let source = "sourceData => sourceData.id";
        assert_eq!(Sandbox::canonicalize(source), source);
    }

    #[test]
    fn test_canonicalize_is_not_fooled_by_comparison() {
        // `a >= b` contains `=>` only after a token boundary; the scan
        // must not treat it as an arrow head.
        let canonical = Sandbox::canonicalize("response.count >= 10");
        assert_eq!(canonical, "(response, pageInfo) => response.count >= 10");
    }

    #[tokio::test]
    async fn test_stop_condition_true() {
        let sandbox = Sandbox::new();
        let verdict = sandbox
            .evaluate_stop_condition(
                "!response.data.has_more",
                &json!({"data": {"has_more": false}}),
                &json!({"page": 1}),
            )
            .await;
        assert_eq!(
            verdict,
            StopVerdict {
                should_stop: true,
                error: None
            }
        );
    }

    #[tokio::test]
    async fn test_stop_condition_uses_page_info() {
        let sandbox = Sandbox::new();
        let verdict = sandbox
            .evaluate_stop_condition(
                "(response, pageInfo) => pageInfo.totalFetched > 100",
                &json!({}),
                &json!({"page": 3, "totalFetched": 150}),
            )
            .await;
        assert!(verdict.should_stop);
    }

    #[tokio::test]
    async fn test_stop_condition_error_is_soft() {
        let sandbox = Sandbox::new();
        let verdict = sandbox
            .evaluate_stop_condition("response.a.b.c", &json!({}), &json!({}))
            .await;
        assert!(!verdict.should_stop);
        assert!(verdict.error.is_some());
    }

    #[tokio::test]
    async fn test_variable_expression() {
        let sandbox = Sandbox::new();
        let value = sandbox
            .evaluate(
                "(sourceData) => sourceData.ids.join(',')",
                &[json!({"ids": [1, 2, 3]})],
            )
            .await
            .unwrap();
        assert_eq!(value, json!("1,2,3"));
    }

    #[tokio::test]
    async fn test_variable_expression_error_is_hard() {
        let sandbox = Sandbox::new();
        let err = sandbox
            .evaluate("(sourceData) => sourceData.a.b", &[json!({})])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_inputs_are_copied_not_shared() {
        // The sandbox sees a deserialized copy; mutating nothing here,
        // but the marshal round-trip must at least preserve the value.
        let sandbox = Sandbox::new();
        let input = json!({"nested": {"deep": [1, {"x": "y"}]}});
        let value = sandbox
            .evaluate("(d) => d.nested.deep[1].x", &[input])
            .await
            .unwrap();
        assert_eq!(value, json!("y"));
    }

    #[tokio::test]
    async fn test_non_finite_results_sanitized_to_null() {
        let sandbox = Sandbox::new();
        let value = sandbox.evaluate("(d) => 1 / 0", &[json!(null)]).await.unwrap();
        assert_eq!(value, json!(null));
    }

    #[test]
    fn test_truthy_json() {
        assert!(!truthy_json(&json!(null)));
        assert!(!truthy_json(&json!(0)));
        assert!(!truthy_json(&json!("")));
        assert!(truthy_json(&json!([])));
        assert!(truthy_json(&json!({})));
        assert!(truthy_json(&json!("x")));
        assert!(truthy_json(&json!(1)));
    }
}
