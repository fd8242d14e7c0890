//! Error types for weld-core.

use thiserror::Error;

/// Result type alias using weld-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during workflow execution.
///
/// The taxonomy mirrors what callers see at the boundary: every variant
/// carries an already credential-masked message. Variants that wrap an
/// HTTP outcome also carry the status and retry accounting so that a
/// caller (or the healing agent) can decide what to do next without
/// re-parsing the message text.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure (connection, DNS, protocol, driver).
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// Number of retries performed before giving up.
        retries_attempted: u32,
    },

    /// The response carried an error status, or a 2xx body that indicates
    /// failure.
    #[error("{message}")]
    Status {
        message: String,
        status_code: u16,
        retries_attempted: u32,
        /// Status of the final failed attempt, when it differs from
        /// `status_code` (e.g. a retry ladder that ended on a 503).
        last_failure_status: Option<u16>,
    },

    /// The pagination configuration cannot work as written (missing
    /// variable substitution, stop condition that never fires, cursor
    /// path that does not exist).
    #[error("Pagination configuration error: {message}")]
    PaginationConfig { message: String },

    /// A `<<variable>>` placeholder could not be resolved.
    #[error("Variable resolution error: {message}")]
    VarResolution {
        message: String,
        /// `undefined_variable` or `code_execution_error`.
        reason: VarFailureReason,
    },

    /// The sandboxed evaluator rejected or exhausted an expression.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// The LLM called `abort` during healing; not recoverable.
    #[error("Healing aborted: {reason}")]
    LlmAbort { reason: String },

    /// All healing attempts were consumed without a working config.
    #[error("Healing exhausted after {attempts} attempts: {message}")]
    LlmExhausted { attempts: u32, message: String },

    /// Execution was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Anything the engine cannot classify or recover from.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Typed reason for a variable resolution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarFailureReason {
    /// The placeholder names a variable absent from the scope.
    UndefinedVariable,
    /// An arrow-function expression failed inside the sandbox.
    CodeExecutionError,
}

impl std::fmt::Display for VarFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UndefinedVariable => write!(f, "undefined_variable"),
            Self::CodeExecutionError => write!(f, "code_execution_error"),
        }
    }
}

impl Error {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>, retries_attempted: u32) -> Self {
        Self::Transport {
            message: message.into(),
            retries_attempted,
        }
    }

    /// Create a status error for a single failed attempt.
    pub fn status(message: impl Into<String>, status_code: u16) -> Self {
        Self::Status {
            message: message.into(),
            status_code,
            retries_attempted: 0,
            last_failure_status: None,
        }
    }

    /// Create a status error with retry accounting.
    pub fn status_after_retries(
        message: impl Into<String>,
        status_code: u16,
        retries_attempted: u32,
        last_failure_status: Option<u16>,
    ) -> Self {
        Self::Status {
            message: message.into(),
            status_code,
            retries_attempted,
            last_failure_status,
        }
    }

    /// Create a pagination configuration error.
    pub fn pagination_config(message: impl Into<String>) -> Self {
        Self::PaginationConfig {
            message: message.into(),
        }
    }

    /// Create a variable resolution error for a missing variable.
    pub fn undefined_variable(message: impl Into<String>) -> Self {
        Self::VarResolution {
            message: message.into(),
            reason: VarFailureReason::UndefinedVariable,
        }
    }

    /// Create a variable resolution error for a failed expression.
    pub fn code_execution(message: impl Into<String>) -> Self {
        Self::VarResolution {
            message: message.into(),
            reason: VarFailureReason::CodeExecutionError,
        }
    }

    /// Create an LLM abort error.
    pub fn llm_abort(reason: impl Into<String>) -> Self {
        Self::LlmAbort {
            reason: reason.into(),
        }
    }

    /// Create an LLM exhausted error.
    pub fn llm_exhausted(attempts: u32, message: impl Into<String>) -> Self {
        Self::LlmExhausted {
            attempts,
            message: message.into(),
        }
    }

    /// The machine-readable kind tag for the error envelope.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Status { .. } => ErrorKind::Status,
            Self::PaginationConfig { .. } => ErrorKind::PaginationConfig,
            Self::VarResolution { .. } => ErrorKind::VarResolution,
            Self::Sandbox(_) => ErrorKind::Sandbox,
            Self::LlmAbort { .. } => ErrorKind::LlmAbort,
            Self::LlmExhausted { .. } => ErrorKind::LlmExhausted,
            Self::Cancelled | Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// HTTP status associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Whether the healing agent can usefully act on this error.
    ///
    /// Aborts, exhausted episodes, cancellation, and sandbox resource
    /// exhaustion go straight to the caller; everything request-shaped is
    /// fair game for regeneration.
    pub fn is_healable(&self) -> bool {
        matches!(
            self,
            Self::Status { .. }
                | Self::PaginationConfig { .. }
                | Self::VarResolution { .. }
                | Self::Transport { .. }
        )
    }
}

/// Error kind tags matching the external error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transport,
    Status,
    PaginationConfig,
    VarResolution,
    Sandbox,
    LlmAbort,
    LlmExhausted,
    Fatal,
}
