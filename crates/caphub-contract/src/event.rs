//! Lifecycle and streaming events published on the hub event bus.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::HealthState;
use crate::error::HubError;
use crate::interrupt::Interrupt;
use crate::run::TokenUsage;

/// Streaming event emitted by a handler mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// An output token (or token batch).
    Token { delta: String },
    /// A tool invocation is starting.
    ToolCalling { tool_name: String, arguments: Value },
    /// A tool invocation finished.
    ToolResult { tool_name: String, result: Value },
}

/// Event published on the hub bus. Per-run events appear in occurrence
/// order; cross-run ordering is not guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum HubEvent {
    #[serde(rename = "run:started")]
    RunStarted { run_id: String, agent_id: String },
    #[serde(rename = "run:interrupted")]
    RunInterrupted {
        run_id: String,
        interrupt: Box<Interrupt>,
    },
    #[serde(rename = "run:resumed")]
    RunResumed { run_id: String, interrupt_id: String },
    #[serde(rename = "run:completed")]
    RunCompleted {
        run_id: String,
        response: String,
        usage: TokenUsage,
    },
    #[serde(rename = "run:failed")]
    RunFailed { run_id: String, error: HubError },
    #[serde(rename = "run:cancelled")]
    RunCancelled { run_id: String, error: HubError },
    #[serde(rename = "run:timeout")]
    RunTimeout { run_id: String, error: HubError },
    #[serde(rename = "step:started")]
    StepStarted {
        run_id: String,
        step_id: String,
        name: String,
    },
    #[serde(rename = "step:completed")]
    StepCompleted {
        run_id: String,
        step_id: String,
        name: String,
    },
    #[serde(rename = "token")]
    Token { run_id: String, delta: String },
    #[serde(rename = "tool:calling")]
    ToolCalling {
        run_id: String,
        tool_name: String,
        arguments: Value,
    },
    #[serde(rename = "tool:result")]
    ToolResult {
        run_id: String,
        tool_name: String,
        result: Value,
    },
    #[serde(rename = "interrupt:created")]
    InterruptCreated {
        run_id: String,
        interrupt: Box<Interrupt>,
    },
    #[serde(rename = "interrupt:resolved")]
    InterruptResolved { run_id: String, interrupt_id: String },
    #[serde(rename = "agent:health_changed")]
    AgentHealthChanged {
        agent_id: String,
        from: HealthState,
        to: HealthState,
    },
}

impl HubEvent {
    /// Bus event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            HubEvent::RunStarted { .. } => "run:started",
            HubEvent::RunInterrupted { .. } => "run:interrupted",
            HubEvent::RunResumed { .. } => "run:resumed",
            HubEvent::RunCompleted { .. } => "run:completed",
            HubEvent::RunFailed { .. } => "run:failed",
            HubEvent::RunCancelled { .. } => "run:cancelled",
            HubEvent::RunTimeout { .. } => "run:timeout",
            HubEvent::StepStarted { .. } => "step:started",
            HubEvent::StepCompleted { .. } => "step:completed",
            HubEvent::Token { .. } => "token",
            HubEvent::ToolCalling { .. } => "tool:calling",
            HubEvent::ToolResult { .. } => "tool:result",
            HubEvent::InterruptCreated { .. } => "interrupt:created",
            HubEvent::InterruptResolved { .. } => "interrupt:resolved",
            HubEvent::AgentHealthChanged { .. } => "agent:health_changed",
        }
    }

    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            HubEvent::RunStarted { run_id, .. }
            | HubEvent::RunInterrupted { run_id, .. }
            | HubEvent::RunResumed { run_id, .. }
            | HubEvent::RunCompleted { run_id, .. }
            | HubEvent::RunFailed { run_id, .. }
            | HubEvent::RunCancelled { run_id, .. }
            | HubEvent::RunTimeout { run_id, .. }
            | HubEvent::StepStarted { run_id, .. }
            | HubEvent::StepCompleted { run_id, .. }
            | HubEvent::Token { run_id, .. }
            | HubEvent::ToolCalling { run_id, .. }
            | HubEvent::ToolResult { run_id, .. }
            | HubEvent::InterruptCreated { run_id, .. }
            | HubEvent::InterruptResolved { run_id, .. } => Some(run_id),
            HubEvent::AgentHealthChanged { .. } => None,
        }
    }

    /// Name used on the run SSE stream, when this event is part of it.
    ///
    /// Terminal failure shapes (failed/cancelled/timeout) all surface as
    /// `error`; the payload carries the taxonomy code.
    pub fn sse_name(&self) -> Option<&'static str> {
        match self {
            HubEvent::RunStarted { .. } => Some("run:started"),
            HubEvent::StepStarted { .. } => Some("step:started"),
            HubEvent::StepCompleted { .. } => Some("step:completed"),
            HubEvent::Token { .. } => Some("token"),
            HubEvent::ToolCalling { .. } => Some("tool:calling"),
            HubEvent::ToolResult { .. } => Some("tool:result"),
            HubEvent::RunInterrupted { .. } => Some("interrupt"),
            HubEvent::RunCompleted { .. } => Some("completed"),
            HubEvent::RunFailed { .. }
            | HubEvent::RunCancelled { .. }
            | HubEvent::RunTimeout { .. } => Some("error"),
            HubEvent::RunResumed { .. }
            | HubEvent::InterruptCreated { .. }
            | HubEvent::InterruptResolved { .. }
            | HubEvent::AgentHealthChanged { .. } => None,
        }
    }

    /// JSON payload for the SSE `data:` line.
    pub fn sse_payload(&self) -> Value {
        match self {
            HubEvent::RunStarted { run_id, agent_id } => {
                json!({ "run_id": run_id, "agent_id": agent_id })
            }
            HubEvent::StepStarted {
                run_id,
                step_id,
                name,
            }
            | HubEvent::StepCompleted {
                run_id,
                step_id,
                name,
            } => json!({ "run_id": run_id, "step_id": step_id, "name": name }),
            HubEvent::Token { run_id, delta } => json!({ "run_id": run_id, "delta": delta }),
            HubEvent::ToolCalling {
                run_id,
                tool_name,
                arguments,
            } => json!({ "run_id": run_id, "tool_name": tool_name, "arguments": arguments }),
            HubEvent::ToolResult {
                run_id,
                tool_name,
                result,
            } => json!({ "run_id": run_id, "tool_name": tool_name, "result": result }),
            HubEvent::RunInterrupted { run_id, interrupt } => {
                json!({ "run_id": run_id, "interrupt": interrupt })
            }
            HubEvent::RunCompleted {
                run_id,
                response,
                usage,
            } => json!({ "run_id": run_id, "response": response, "usage": usage }),
            HubEvent::RunFailed { run_id, error }
            | HubEvent::RunCancelled { run_id, error }
            | HubEvent::RunTimeout { run_id, error } => json!({
                "run_id": run_id,
                "code": error.code.as_str(),
                "message": error.message,
            }),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        }
    }

    /// Whether this event closes the run stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HubEvent::RunCompleted { .. }
                | HubEvent::RunFailed { .. }
                | HubEvent::RunCancelled { .. }
                | HubEvent::RunTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_names() {
        let ev = HubEvent::Token {
            run_id: "r".into(),
            delta: "hi".into(),
        };
        assert_eq!(ev.sse_name(), Some("token"));
        assert_eq!(ev.event_name(), "token");

        let ev = HubEvent::AgentHealthChanged {
            agent_id: "a".into(),
            from: HealthState::Healthy,
            to: HealthState::Degraded,
        };
        assert_eq!(ev.sse_name(), None);
        assert_eq!(ev.event_name(), "agent:health_changed");
    }

    #[test]
    fn test_terminal_events_close_stream() {
        let done = HubEvent::RunCompleted {
            run_id: "r".into(),
            response: "ok".into(),
            usage: TokenUsage::default(),
        };
        assert!(done.is_terminal());
        assert_eq!(done.sse_name(), Some("completed"));

        let failed = HubEvent::RunFailed {
            run_id: "r".into(),
            error: HubError::execution_failed("boom"),
        };
        assert!(failed.is_terminal());
        assert_eq!(failed.sse_name(), Some("error"));
        assert_eq!(
            failed.sse_payload()["code"],
            Value::String("CAP_RUN_EXECUTION_FAILED".into())
        );
    }
}
