//! Runs and steps: a single driven execution of an agent against an input.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HubError;
use crate::thread::Message;
use crate::time::{current_unix_millis, gen_id};

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Streaming,
    Interrupted,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    /// Terminal statuses are never overwritten.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Timeout
        )
    }

    /// Allowed state-machine edges.
    ///
    /// `pending → running` is the local-mode fast path; a run that must wait
    /// for an agent slot (or enters the distributed queue) passes through
    /// `queued`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Failure edges from pre-running states cover dispatch-time
            // rejections (agent became unready, thread vanished).
            (Pending, Queued) | (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) => {
                true
            }
            (Queued, Running) | (Queued, Cancelled) | (Queued, Failed) => true,
            (Running, Streaming)
            | (Running, Interrupted)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Timeout) => true,
            (Streaming, Interrupted)
            | (Streaming, Completed)
            | (Streaming, Failed)
            | (Streaming, Cancelled)
            | (Streaming, Timeout) => true,
            (Interrupted, Running)
            | (Interrupted, Failed)
            | (Interrupted, Cancelled)
            | (Interrupted, Timeout) => true,
            _ => false,
        }
    }
}

/// Step type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    LlmCall,
    ToolCall,
    AgentCall,
    Decision,
    SkillExecution,
    KnowledgeQuery,
    ParallelExecution,
}

/// Step lifecycle status. A step never returns to an earlier state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// Failure policy of a `parallel_execution` step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelPolicy {
    /// A child failure fails the parent.
    #[default]
    Strict,
    /// A child failure is recorded; the parent continues with the
    /// remaining results.
    Lenient,
}

/// An atomic unit inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub name: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    /// Tool invoked by a `tool_call` step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Agent invoked by an `agent_call` step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_agent_id: Option<String>,
    /// Failure policy for `parallel_execution` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_policy: Option<ParallelPolicy>,
    /// Child steps owned by a `parallel_execution` step. Relative order of
    /// children is not observable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HubError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl Step {
    pub fn new(step_type: StepType, name: impl Into<String>, input: Value) -> Self {
        Self {
            step_id: gen_id("step"),
            step_type,
            name: name.into(),
            status: StepStatus::Pending,
            input,
            output: Value::Null,
            tool_name: None,
            called_agent_id: None,
            parallel_policy: None,
            children: Vec::new(),
            error: None,
            duration_ms: None,
            created_at: current_unix_millis(),
            completed_at: None,
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    #[must_use]
    pub fn with_called_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.called_agent_id = Some(agent_id.into());
        self
    }

    #[must_use]
    pub fn with_parallel_policy(mut self, policy: ParallelPolicy) -> Self {
        self.parallel_policy = Some(policy);
        self
    }
}

/// Aggregated token usage for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Accumulate another usage sample into this one.
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Per-run execution options supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Deadline override; the effective deadline is
    /// `min(timeout_ms, agent default)`, bounded by the hub maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Request streaming output (honored when the agent supports it).
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_interval_ms: Option<u64>,
}

/// Caller-submitted input for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInput {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Free-form context map; drives pattern detection when no explicit
    /// operation is supplied.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    /// Explicit operation, bypassing pattern detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<crate::handler::Operation>,
    #[serde(default)]
    pub options: RunOptions,
}

impl RunInput {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            thread_id: None,
            messages: Vec::new(),
            context: Map::new(),
            operation: None,
            options: RunOptions::default(),
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: crate::handler::Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// Final output of a completed run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutput {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Value>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub duration_ms: u64,
}

/// One execution of an agent against an input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    pub input: RunInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RunOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HubError>,
    /// Handler driving this run, recorded for checkpoint resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_handler: Option<String>,
    /// Last thread message sequence consumed when materializing context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_cursor: Option<u64>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    pub updated_at: u64,
}

impl Run {
    pub fn new(input: RunInput) -> Self {
        let now = current_unix_millis();
        Self {
            run_id: gen_id("run"),
            agent_id: input.agent_id.clone(),
            thread_id: input.thread_id.clone(),
            status: RunStatus::Pending,
            input,
            output: None,
            steps: Vec::new(),
            usage: TokenUsage::default(),
            error: None,
            current_handler: None,
            thread_cursor: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }
}

/// Run list filter used by status iteration.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub agent_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: usize,
}

/// A context map helper: reads a string field out of the free-form context.
pub fn context_str<'a>(context: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    context.get(key).and_then(Value::as_str)
}

/// Context key/value bag alias used across handler interfaces.
pub type ContextMap = Map<String, Value>;

/// Run metadata bag alias.
pub type MetadataMap = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_are_sealed() {
        use RunStatus::*;
        for terminal in [Completed, Failed, Cancelled, Timeout] {
            assert!(terminal.is_terminal());
            for next in [
                Pending, Queued, Running, Streaming, Interrupted, Completed, Failed, Cancelled,
                Timeout,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn test_run_transition_table() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Running));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Streaming));
        assert!(Running.can_transition_to(Interrupted));
        assert!(Streaming.can_transition_to(Completed));
        assert!(Interrupted.can_transition_to(Running));
        assert!(Interrupted.can_transition_to(Failed));

        assert!(Pending.can_transition_to(Failed));
        assert!(Queued.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Streaming));
        assert!(!Queued.can_transition_to(Interrupted));
        assert!(!Interrupted.can_transition_to(Streaming));
    }

    #[test]
    fn test_step_status_never_regresses() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_token_usage_add() {
        let mut usage = TokenUsage::new(100, 20);
        usage.add(TokenUsage::new(50, 10));
        assert_eq!(usage.prompt_tokens, 150);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 180);
    }

    #[test]
    fn test_run_input_builder() {
        let input = RunInput::new("agent-1")
            .with_thread("thr-1")
            .with_context("query", Value::String("x".into()));
        assert_eq!(input.agent_id, "agent-1");
        assert_eq!(input.thread_id.as_deref(), Some("thr-1"));
        assert_eq!(context_str(&input.context, "query"), Some("x"));
    }
}
