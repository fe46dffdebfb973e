//! Hub error taxonomy.
//!
//! Every error crossing a component boundary is a [`HubError`] carrying a
//! stable wire code, a human message, and a retryability flag. Errors never
//! panic across boundaries; components return `Result` and the executor
//! translates failures into run-level terminal states.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes, emitted verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CapAgentNotFound,
    CapAgentNotReady,
    CapAgentUnhealthy,
    CapThreadNotFound,
    CapThreadClosed,
    CapRunNotFound,
    CapRunCancelled,
    CapRunTimeout,
    CapRunExecutionFailed,
    CapInterruptNotFound,
    CapInterruptExpired,
    ValidInput,
    ValidSchema,
    ValidLifecycleTransition,
    NetConnection,
    NetUpstream,
    RagQueryFailed,
    RagBackendUnavailable,
    TimeoutOperation,
    Conflict,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Wire representation, emitted verbatim in API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CapAgentNotFound => "CAP_AGENT_NOT_FOUND",
            ErrorCode::CapAgentNotReady => "CAP_AGENT_NOT_READY",
            ErrorCode::CapAgentUnhealthy => "CAP_AGENT_UNHEALTHY",
            ErrorCode::CapThreadNotFound => "CAP_THREAD_NOT_FOUND",
            ErrorCode::CapThreadClosed => "CAP_THREAD_CLOSED",
            ErrorCode::CapRunNotFound => "CAP_RUN_NOT_FOUND",
            ErrorCode::CapRunCancelled => "CAP_RUN_CANCELLED",
            ErrorCode::CapRunTimeout => "CAP_RUN_TIMEOUT",
            ErrorCode::CapRunExecutionFailed => "CAP_RUN_EXECUTION_FAILED",
            ErrorCode::CapInterruptNotFound => "CAP_INTERRUPT_NOT_FOUND",
            ErrorCode::CapInterruptExpired => "CAP_INTERRUPT_EXPIRED",
            ErrorCode::ValidInput => "VALID_INPUT",
            ErrorCode::ValidSchema => "VALID_SCHEMA",
            ErrorCode::ValidLifecycleTransition => "VALID_LIFECYCLE_TRANSITION",
            ErrorCode::NetConnection => "NET_CONNECTION",
            ErrorCode::NetUpstream => "NET_UPSTREAM",
            ErrorCode::RagQueryFailed => "RAG_QUERY_FAILED",
            ErrorCode::RagBackendUnavailable => "RAG_BACKEND_UNAVAILABLE",
            ErrorCode::TimeoutOperation => "TIMEOUT_OPERATION",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Default retryability of this code. `NET_*` and `TIMEOUT_OPERATION`
    /// families are retried with backoff; everything else propagates.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetConnection
                | ErrorCode::NetUpstream
                | ErrorCode::TimeoutOperation
                | ErrorCode::RagBackendUnavailable
                | ErrorCode::RateLimited
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type crossing every component boundary.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HubError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, Value>,
}

impl HubError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            retryable: code.default_retryable(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    // Common constructors.

    pub fn agent_not_found(agent_id: &str) -> Self {
        Self::new(
            ErrorCode::CapAgentNotFound,
            format!("agent not found: {agent_id}"),
        )
    }

    pub fn agent_not_ready(agent_id: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::CapAgentNotReady,
            format!("agent {agent_id} not ready: {reason}"),
        )
    }

    pub fn agent_unhealthy(agent_id: &str) -> Self {
        Self::new(
            ErrorCode::CapAgentUnhealthy,
            format!("agent {agent_id} is unhealthy"),
        )
    }

    pub fn thread_not_found(thread_id: &str) -> Self {
        Self::new(
            ErrorCode::CapThreadNotFound,
            format!("thread not found: {thread_id}"),
        )
    }

    pub fn thread_closed(thread_id: &str) -> Self {
        Self::new(
            ErrorCode::CapThreadClosed,
            format!("thread {thread_id} is closed"),
        )
    }

    pub fn run_not_found(run_id: &str) -> Self {
        Self::new(
            ErrorCode::CapRunNotFound,
            format!("run not found: {run_id}"),
        )
    }

    pub fn run_cancelled(run_id: &str) -> Self {
        Self::new(
            ErrorCode::CapRunCancelled,
            format!("run {run_id} was cancelled"),
        )
    }

    pub fn run_timeout(run_id: &str) -> Self {
        Self::new(
            ErrorCode::CapRunTimeout,
            format!("run {run_id} exceeded its deadline"),
        )
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapRunExecutionFailed, message)
    }

    pub fn interrupt_not_found(interrupt_id: &str) -> Self {
        Self::new(
            ErrorCode::CapInterruptNotFound,
            format!("interrupt not found: {interrupt_id}"),
        )
    }

    pub fn interrupt_expired(interrupt_id: &str) -> Self {
        Self::new(
            ErrorCode::CapInterruptExpired,
            format!("interrupt {interrupt_id} expired before resolution"),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidInput, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}
