//! # weld-core
//!
//! A self-healing workflow execution engine: step configurations plus a
//! set of integrations (REST/SOAP APIs, PostgreSQL, FTP/SFTP) become a
//! sequence of executed, structured results. When a step fails or
//! returns the wrong data, an LLM-driven loop regenerates its
//! configuration and retries.
//!
//! ## Core Components
//!
//! - **Resolver**: `<<expr>>` placeholder substitution over a merged
//!   variable scope
//! - **Transports**: HTTP (retries, 429 handling), Postgres (pooled
//!   parameterized queries), FTP/FTPS/SFTP (operation dispatch)
//! - **Pagination**: page/offset/cursor iteration with cycle detection
//!   and sandboxed stop conditions
//! - **Sandbox**: isolated, resource-capped evaluation of user-authored
//!   expressions
//! - **Healing**: LLM-driven configuration regeneration with
//!   `submit`/`abort` tools
//! - **Workflow**: ordered step execution with result threading and
//!   LOOP mode
//!
//! ## Example
//!
//! ```rust,ignore
//! use weld_core::{Endpoint, HttpMethod, RequestOptions, StepRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! let runner = StepRunner::new();
//! let endpoint = Endpoint::new("https://api.example.com")
//!     .with_method(HttpMethod::Get)
//!     .with_path("/items")
//!     .with_instruction("fetch all items");
//!
//! let envelope = runner
//!     .run_step(
//!         &endpoint,
//!         &serde_json::json!({}),
//!         &Default::default(),
//!         &RequestOptions::default(),
//!         None,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{}", envelope.data);
//! ```

pub mod decode;
pub mod endpoint;
pub mod error;
pub mod evaluator;
pub mod healing;
pub mod interpreter;
pub mod llm;
pub mod mask;
pub mod pagination;
pub mod resolver;
pub mod runner;
pub mod sandbox;
pub mod transport;
pub mod workflow;

// Re-exports for convenience
pub use decode::{parse_json, ContentDecoder, DefaultDecoder};
pub use endpoint::{
    AuthType, Endpoint, HttpMethod, PaginationConfig, PaginationType, RequestOptions,
    ResponseEnvelope, DEFAULT_PAGE_SIZE,
};
pub use error::{Error, ErrorKind, Result, VarFailureReason};
pub use evaluator::{EvaluationVerdict, ResponseEvaluator};
pub use healing::{
    endpoint_schema, CustomTool, HealingAgent, HealingConfig, HealingOutcome, ToolHandler,
    SELF_HEALING_SYSTEM_PROMPT,
};
pub use interpreter::{interpret_response, Interpretation};
pub use llm::{
    temperature_for_attempt, ChatMessage, ChatRole, LlmClient, ObjectOutcome, ObjectRequest,
    ObjectResponse, TextRequest, TextResponse, ToolCall, ToolDefinition, ABORT_TOOL, SUBMIT_TOOL,
};
pub use mask::{is_masked, mask_credentials, mask_value, MASK_MARKER};
pub use pagination::{
    walk_data_path, PageInfo, MAX_PAGINATION_REQUESTS, MAX_PAGINATION_REQUESTS_WITHOUT_STOP,
};
pub use resolver::{build_scope, PaginationVars, ResolvedRequest, Resolver};
pub use runner::StepRunner;
pub use sandbox::{Sandbox, SandboxLimits, StopVerdict};
pub use transport::{
    Dispatcher, FtpOperation, FtpTransport, HttpTransport, PoolRegistry, PostgresTransport,
    TransportKind,
};
pub use workflow::{
    ExecutionStep, StepExecutionMode, StepResult, Workflow, WorkflowOrchestrator, WorkflowResult,
};
