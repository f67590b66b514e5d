use thiserror::Error;

/// Typed error hierarchy for the agent core.
///
/// Use at module boundaries (provider calls, tool dispatch, control plane
/// methods, settings). Internal/leaf functions can continue using
/// `anyhow::Result`; the `Internal` variant allows seamless conversion via
/// the `?` operator.
#[derive(Debug, Error)]
pub enum CoworkError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Policy denied {tool}: {reason}")]
    PolicyDeny { tool: String, reason: String },

    #[error("Approval {approval_id} denied: {reason}")]
    ApprovalDenied { approval_id: String, reason: String },

    #[error("Path violation: {0}")]
    PathViolation(String),

    #[error("Command blocked: {0}")]
    CommandGuardrail(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `CoworkError`.
pub type CoworkResult<T> = std::result::Result<T, CoworkError>;

impl CoworkError {
    /// Whether this error is retryable (rate limits, transient provider errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            CoworkError::RateLimit { .. } => true,
            CoworkError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Fixed wire code used by the control plane and hooks server.
    pub fn wire_code(&self) -> &'static str {
        match self {
            CoworkError::Validation(_) => "INVALID_INPUT",
            CoworkError::Auth(_) | CoworkError::RateLimit { .. } => "UNAUTHORIZED",
            CoworkError::Forbidden(_)
            | CoworkError::PolicyDeny { .. }
            | CoworkError::ApprovalDenied { .. }
            | CoworkError::PathViolation(_)
            | CoworkError::CommandGuardrail(_) => "FORBIDDEN",
            _ => "METHOD_FAILED",
        }
    }

    /// Short reason tag recorded in events (never the raw input).
    pub fn reason_code(&self) -> &'static str {
        match self {
            CoworkError::Validation(_) => "validation",
            CoworkError::Auth(_) => "auth",
            CoworkError::Forbidden(_) => "forbidden",
            CoworkError::PolicyDeny { .. } => "policy_deny",
            CoworkError::ApprovalDenied { .. } => "approval_denied",
            CoworkError::PathViolation(_) => "path_violation",
            CoworkError::CommandGuardrail(_) => "command_guardrail",
            CoworkError::Provider { .. } => "provider",
            CoworkError::RateLimit { .. } => "rate_limit",
            CoworkError::Timeout { .. } => "timeout",
            CoworkError::BudgetExceeded(_) => "budget",
            CoworkError::Cancelled => "cancelled",
            CoworkError::Internal(_) => "internal",
        }
    }
}
