//! Engine-wide error taxonomy.
//!
//! Every fallible seam in the engine funnels into [`EngineError`]. The
//! variants mirror how failures propagate at runtime: validation and
//! not-found problems surface immediately to the caller, transient and
//! timeout problems are eligible for step-level retry, tool failures are
//! fed back to the model inside the agent loop, and the remaining variants
//! are terminal execution outcomes.
//!
//! # Example
//!
//! ```
//! use flowllm::error::EngineError;
//!
//! let err = EngineError::StepTimeout("step 3 exceeded 300s".into());
//! assert!(err.is_retryable());
//! assert_eq!(err.code(), "STEP_TIMEOUT");
//!
//! let err = EngineError::NotFound("workflow 42".into());
//! assert!(!err.is_retryable());
//! ```

use std::error::Error;
use std::fmt;

/// Classified failure raised anywhere inside the engine.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Malformed input: bad schema, invalid cron expression, missing
    /// required field, cyclic step dependency, duplicate output key.
    Validation(String),
    /// Unknown agent / tool / workflow / execution / schedule reference.
    NotFound(String),
    /// Network-level or provider 5xx failure. Eligible for retry.
    Transient(String),
    /// A step exceeded its configured deadline. Eligible for retry.
    StepTimeout(String),
    /// A tool handler returned an error blob or threw. Delivered back to
    /// the model as a `tool_result` inside the agent loop, never fatal on
    /// its own.
    ToolExecutionFailed(String),
    /// The agent loop did not reach a terminal answer within the
    /// configured iteration budget.
    IterationLimitExceeded(usize),
    /// A step's gating expression failed to parse or did not evaluate to
    /// a boolean.
    InvalidCondition(String),
    /// Remaining steps can never become ready.
    DeadlockDetected(String),
    /// The execution was cancelled by an operator.
    Cancelled,
    /// The referenced agent exists but is deactivated.
    AgentInactive(i64),
    /// The referenced workflow exists but is deactivated.
    WorkflowInactive(i64),
    /// `execute_public_workflow` was called on a non-public workflow.
    NotPublic(i64),
    /// An approval request was already resolved by a concurrent actor.
    AlreadyResolved(i64),
    /// Database-level failure.
    Storage(String),
    /// Permanent gateway failure (auth, response schema mismatch).
    Gateway(String),
}

impl EngineError {
    /// Whether the step retry policy may re-attempt after this error.
    ///
    /// Only transport-level transients and step timeouts qualify;
    /// everything else is either permanent or handled as control flow.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::StepTimeout(_))
    }

    /// Stable machine-readable code, used in terminal execution records
    /// and command responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Transient(_) => "TRANSIENT",
            EngineError::StepTimeout(_) => "STEP_TIMEOUT",
            EngineError::ToolExecutionFailed(_) => "TOOL_EXECUTION_FAILED",
            EngineError::IterationLimitExceeded(_) => "ITERATION_LIMIT_EXCEEDED",
            EngineError::InvalidCondition(_) => "INVALID_CONDITION",
            EngineError::DeadlockDetected(_) => "DEADLOCK_DETECTED",
            EngineError::Cancelled => "CANCELLED",
            EngineError::AgentInactive(_) => "AGENT_INACTIVE",
            EngineError::WorkflowInactive(_) => "WORKFLOW_INACTIVE",
            EngineError::NotPublic(_) => "NOT_PUBLIC",
            EngineError::AlreadyResolved(_) => "ALREADY_RESOLVED",
            EngineError::Storage(_) => "STORAGE",
            EngineError::Gateway(_) => "GATEWAY",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "Validation failed: {}", msg),
            EngineError::NotFound(what) => write!(f, "Not found: {}", what),
            EngineError::Transient(msg) => write!(f, "Transient failure: {}", msg),
            EngineError::StepTimeout(msg) => write!(f, "Step timed out: {}", msg),
            EngineError::ToolExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            EngineError::IterationLimitExceeded(n) => {
                write!(f, "Agent loop exceeded {} iterations", n)
            }
            EngineError::InvalidCondition(expr) => write!(f, "Invalid condition: {}", expr),
            EngineError::DeadlockDetected(msg) => write!(f, "Deadlock detected: {}", msg),
            EngineError::Cancelled => write!(f, "Execution cancelled"),
            EngineError::AgentInactive(id) => write!(f, "Agent {} is inactive", id),
            EngineError::WorkflowInactive(id) => write!(f, "Workflow {} is inactive", id),
            EngineError::NotPublic(id) => write!(f, "Workflow {} is not public", id),
            EngineError::AlreadyResolved(id) => {
                write!(f, "Approval request {} was already resolved", id)
            }
            EngineError::Storage(msg) => write!(f, "Storage error: {}", msg),
            EngineError::Gateway(msg) => write!(f, "Gateway error: {}", msg),
        }
    }
}

impl Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => EngineError::NotFound("row".into()),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("JSON column: {}", e))
    }
}
