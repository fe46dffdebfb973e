//! Step handlers: the typed implementations an input is routed to.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{Agent, AgentVersion};
use crate::error::HubError;
use crate::event::StreamEvent;
use crate::interrupt::{InterruptPayload, InterruptPriority, InterruptResponse, InterruptType};
use crate::run::{ContextMap, RunInput, RunOutput, Step, StepStatus, TokenUsage};
use crate::thread::{ContextWindow, Message};

/// Operation tags a handler may advertise and an input may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Rag,
    Reasoning,
    Classification,
    Extraction,
    Generic,
    ToolCall,
    AgentInvocation,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Rag => "rag",
            Operation::Reasoning => "reasoning",
            Operation::Classification => "classification",
            Operation::Extraction => "extraction",
            Operation::Generic => "generic",
            Operation::ToolCall => "tool_call",
            Operation::AgentInvocation => "agent_invocation",
        };
        f.write_str(name)
    }
}

/// What a handler advertises to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerMetadata {
    pub name: String,
    pub version: AgentVersion,
    pub operation: Operation,
    #[serde(default)]
    pub description: String,
    /// Capability tags that must be present on the agent for this handler
    /// to be eligible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    /// Routing tiebreaker, higher wins.
    #[serde(default)]
    pub priority: i32,
}

impl HandlerMetadata {
    pub fn new(name: impl Into<String>, version: AgentVersion, operation: Operation) -> Self {
        Self {
            name: name.into(),
            version,
            operation,
            description: String::new(),
            required_capabilities: Vec::new(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Error returned by a handler. Never crosses a boundary as a panic.
#[derive(Debug, Clone, thiserror::Error)]
#[error(transparent)]
pub struct StepError(#[from] pub HubError);

impl StepError {
    pub fn retryable(&self) -> bool {
        self.0.retryable
    }

    pub fn into_inner(self) -> HubError {
        self.0
    }
}

/// The resolved input a handler executes against.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub operation: Operation,
    pub messages: Vec<Message>,
    pub context: ContextMap,
}

/// A handler's successful contribution.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub response: String,
    pub data: Option<Value>,
    pub artifacts: Vec<Value>,
}

impl HandlerOutput {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            data: None,
            artifacts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Suspension request issued by a handler mid-run.
#[derive(Debug, Clone)]
pub struct InterruptRequest {
    pub interrupt_type: InterruptType,
    pub priority: InterruptPriority,
    pub payload: InterruptPayload,
    pub timeout_ms: u64,
}

impl InterruptRequest {
    pub fn new(interrupt_type: InterruptType, payload: InterruptPayload, timeout_ms: u64) -> Self {
        Self {
            interrupt_type,
            priority: InterruptPriority::default(),
            payload,
            timeout_ms,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: InterruptPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Execution surface handed to a handler.
///
/// Step callbacks are atomic and persisted; per-run they are serialized so
/// step order stays linear. Handlers must observe [`StepContext::is_cancelled`]
/// on every I/O boundary.
#[async_trait]
pub trait StepContext: Send + Sync {
    /// The run being driven.
    fn run_id(&self) -> &str;

    /// The resolved agent.
    fn agent(&self) -> &Agent;

    /// Thread context assembled for this run, when the input named a thread.
    fn thread_context(&self) -> Option<&ContextWindow>;

    /// Cooperative cancellation check; true after cancel or deadline.
    fn is_cancelled(&self) -> bool;

    /// Deadline budget remaining for this run.
    fn remaining_deadline(&self) -> Duration;

    /// Publish a stream event for this run.
    fn emit(&self, event: StreamEvent);

    /// Record a new step. Returns the step id.
    async fn add_step(&self, step: Step) -> Result<String, StepError>;

    /// Mark a step completed with its output.
    async fn complete_step(&self, step_id: &str, output: Value) -> Result<(), StepError>;

    /// Mark a step failed.
    async fn fail_step(&self, step_id: &str, error: HubError) -> Result<(), StepError>;

    /// Update a child of a `parallel_execution` step.
    async fn update_child_step(
        &self,
        parent_id: &str,
        child_id: &str,
        status: StepStatus,
        output: Value,
        error: Option<HubError>,
    ) -> Result<(), StepError>;

    /// Accumulate token usage into the run.
    async fn update_token_usage(&self, usage: TokenUsage) -> Result<(), StepError>;

    /// Output of a previously completed step with this name, if the run is
    /// resuming from a checkpoint. Handlers consult this to avoid executing
    /// a step twice across restarts.
    async fn completed_step_output(&self, name: &str) -> Option<Value>;

    /// Suspend the run on an interrupt and await its resolution.
    ///
    /// Returns the resolution response; if the interrupt expires and the
    /// agent's policy is `continue_without`, returns a null response. Time
    /// spent suspended does not count against the run deadline.
    async fn interrupt(&self, request: InterruptRequest) -> Result<InterruptResponse, StepError>;

    /// Dispatch a sub-agent run. The child inherits this run's remaining
    /// deadline.
    async fn call_agent(&self, input: RunInput) -> Result<RunOutput, StepError>;
}

/// Implementation of one operation type, routed to by input shape and
/// capability.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn metadata(&self) -> HandlerMetadata;

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        input: HandlerInput,
    ) -> Result<HandlerOutput, StepError>;
}
