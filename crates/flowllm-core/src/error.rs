//! Error taxonomy for flow execution.
//!
//! Every failure a flow invocation can surface is one of these variants.
//! The split matters operationally: only [`FlowError::Transient`] is eligible
//! for the op retry loop, and the service layer maps each variant onto a
//! transport status (HTTP code or MCP tool error).

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Errors raised by the op runtime, combinators, parser, and services.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Request failed schema validation (missing/mistyped/unknown field).
    #[error("input validation failed: {message}")]
    InputValidation {
        /// What was wrong with the input.
        message: String,
    },

    /// Flow name not present in the dispatcher's table.
    #[error("unknown flow: {name}")]
    UnknownFlow {
        /// The requested flow name.
        name: String,
    },

    /// Op name not present in the registry.
    #[error("unknown op: {name}")]
    UnknownOp {
        /// The requested op name.
        name: String,
    },

    /// LLM / embedding model / vector store / token counter not registered.
    #[error("unknown {category}: {name}")]
    UnknownResource {
        /// Resource category (llm, embedding_model, vector_store, ...).
        category: String,
        /// The requested resource name.
        name: String,
    },

    /// A deadline elapsed (request deadline or a local `join` timeout).
    #[error("timed out after {waited:?}")]
    Timeout {
        /// How long the waiter was prepared to wait.
        waited: Duration,
    },

    /// The invocation was cancelled (client disconnect, sibling failure,
    /// explicit cancel).
    #[error("execution cancelled")]
    Cancelled,

    /// Transient provider/IO failure (rate limit, 5xx, connection reset).
    /// The only retryable class.
    #[error("transient error: {message}")]
    Transient {
        /// Description of the transient condition.
        message: String,
    },

    /// Deterministic failure raised by an op ("give up").
    #[error("op {op} failed: {message}")]
    Execution {
        /// Short name of the failing op.
        op: String,
        /// Failure description.
        message: String,
    },

    /// Flow expression could not be parsed or evaluated.
    #[error("expression error: {message}")]
    Parse {
        /// Parser diagnostic, including position where available.
        message: String,
    },

    /// JSON (de)serialization plumbing.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Filesystem plumbing (prompt files, file-backed cache).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Whether the op retry loop may re-attempt after this error.
    ///
    /// Timeouts and cancellations are never retried: the deadline that
    /// produced them still stands. Validation and deterministic op failures
    /// would fail identically on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Transient { .. })
    }

    /// Stable machine-readable code for transport bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::InputValidation { .. } => "input_validation",
            FlowError::UnknownFlow { .. } => "unknown_flow",
            FlowError::UnknownOp { .. } => "unknown_op",
            FlowError::UnknownResource { .. } => "unknown_resource",
            FlowError::Timeout { .. } => "timeout",
            FlowError::Cancelled => "cancelled",
            FlowError::Transient { .. } => "transient",
            FlowError::Execution { .. } => "execution",
            FlowError::Parse { .. } => "parse",
            FlowError::Serde(_) => "serde",
            FlowError::Io(_) => "io",
        }
    }

    /// Shorthand for a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        FlowError::Transient {
            message: message.into(),
        }
    }

    /// Shorthand for a deterministic op failure.
    pub fn execution(op: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Execution {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a validation failure.
    pub fn invalid(message: impl Into<String>) -> Self {
        FlowError::InputValidation {
            message: message.into(),
        }
    }
}
