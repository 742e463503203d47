//! Execution error taxonomy.
//!
//! Every failure that can surface from a run is normalized into
//! [`ExecutionError`]. The retry supervisor only ever retries errors that
//! classify as transient; everything else is terminal for the attempt.

use thiserror::Error;

/// Errors produced while executing an agent run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Request or tool call timed out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Connection dropped mid-request.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Upstream returned HTTP 429.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Upstream returned HTTP 503.
    #[error("service overloaded: {0}")]
    Overloaded(String),

    /// LLM returned an unusable response (non-transient).
    #[error("llm error: {0}")]
    Llm(String),

    /// Tool execution failed. Fed back into the conversation, not fatal.
    #[error("tool '{name}' failed: {message}")]
    Tool { name: String, message: String },

    /// The model's reply contained no parseable decision.
    #[error("could not parse decision from model reply")]
    DecisionParse,

    /// Invalid configuration (e.g. a cron expression that does not parse).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Ownership mismatch. Terminal, never retried.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Referenced agent does not exist.
    #[error("agent not found: {0}")]
    NotFound(uuid::Uuid),
}

impl ExecutionError {
    /// Whether the retry supervisor may retry this failure with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectionReset(_) | Self::RateLimited(_) | Self::Overloaded(_)
        )
    }

    /// Map a reqwest error into the taxonomy.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        if err.is_connect() {
            return Self::ConnectionReset(err.to_string());
        }
        match err.status() {
            Some(reqwest::StatusCode::TOO_MANY_REQUESTS) => Self::RateLimited(err.to_string()),
            Some(reqwest::StatusCode::SERVICE_UNAVAILABLE) => Self::Overloaded(err.to_string()),
            _ => Self::Llm(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ExecutionError::Timeout("t".into()).is_transient());
        assert!(ExecutionError::ConnectionReset("r".into()).is_transient());
        assert!(ExecutionError::RateLimited("429".into()).is_transient());
        assert!(ExecutionError::Overloaded("503".into()).is_transient());

        assert!(!ExecutionError::Llm("bad".into()).is_transient());
        assert!(!ExecutionError::DecisionParse.is_transient());
        assert!(!ExecutionError::Configuration("cron".into()).is_transient());
        assert!(!ExecutionError::Unauthorized("owner".into()).is_transient());
    }
}
