//! Interrupts: suspension points awaiting a human or external decision.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::{current_unix_millis, gen_id};

/// Why a run was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
    ApprovalRequired,
    ConfirmationRequired,
    InputRequired,
    ClarificationRequired,
    SelectionRequired,
    ConfidenceLow,
    ConflictDetected,
    ErrorOccurred,
    KnowledgeGap,
    HighRiskOperation,
    PolicyViolation,
    AnomalyDetected,
}

/// Interrupt priority for notification routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Interrupt lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptStatus {
    #[default]
    Pending,
    Notified,
    Viewed,
    Resolved,
    Expired,
    Cancelled,
}

impl InterruptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InterruptStatus::Resolved | InterruptStatus::Expired | InterruptStatus::Cancelled
        )
    }

    /// Notification acknowledgement transitions are optional and monotonic;
    /// resolution is legal from any non-terminal status.
    pub fn can_transition_to(&self, next: InterruptStatus) -> bool {
        use InterruptStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Notified) | (Notified, Viewed) => true,
            (_, Resolved) | (_, Expired) | (_, Cancelled) => true,
            _ => false,
        }
    }
}

/// What the human is being asked, and what they may answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptPayload {
    pub message: String,
    /// Options for selection-style interrupts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// The action the agent proposes to take.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_action: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl InterruptPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            options: Vec::new(),
            proposed_action: None,
            details: Value::Null,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_proposed_action(mut self, action: impl Into<String>) -> Self {
        self.proposed_action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// The decision supplied when resolving an interrupt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptResponse {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
}

impl InterruptResponse {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            responded_by: None,
        }
    }

    /// Whether the response value reads as an approval.
    pub fn approved(&self) -> bool {
        match &self.value {
            Value::Bool(b) => *b,
            Value::String(s) => {
                let lower = s.to_lowercase();
                matches!(
                    lower.as_str(),
                    "true" | "yes" | "approve" | "approved" | "allow" | "confirm" | "ok" | "accept"
                )
            }
            Value::Object(obj) => obj
                .get("approved")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Creation payload for an interrupt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptSpec {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    #[serde(default)]
    pub priority: InterruptPriority,
    pub payload: InterruptPayload,
    pub timeout_ms: u64,
}

impl InterruptSpec {
    pub fn new(
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        interrupt_type: InterruptType,
        payload: InterruptPayload,
        timeout_ms: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            thread_id: None,
            agent_id: agent_id.into(),
            interrupt_type,
            priority: InterruptPriority::default(),
            payload,
            timeout_ms,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: InterruptPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A suspension point. At most one interrupt per run is non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    pub interrupt_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    #[serde(default)]
    pub priority: InterruptPriority,
    #[serde(default)]
    pub status: InterruptStatus,
    pub payload: InterruptPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<InterruptResponse>,
    pub timeout_ms: u64,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
}

impl Interrupt {
    /// Materialize a pending interrupt from a spec.
    pub fn from_spec(spec: InterruptSpec) -> Self {
        let now = current_unix_millis();
        Self {
            interrupt_id: gen_id("int"),
            run_id: spec.run_id,
            thread_id: spec.thread_id,
            agent_id: spec.agent_id,
            interrupt_type: spec.interrupt_type,
            priority: spec.priority,
            status: InterruptStatus::Pending,
            payload: spec.payload,
            response: None,
            timeout_ms: spec.timeout_ms,
            created_at: now,
            expires_at: now + spec.timeout_ms,
            resolved_at: None,
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        !self.status.is_terminal() && now >= self.expires_at
    }
}

/// Interrupt list filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InterruptStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<InterruptPriority>,
}

impl InterruptFilter {
    pub fn matches(&self, interrupt: &Interrupt) -> bool {
        if let Some(ref run_id) = self.run_id {
            if &interrupt.run_id != run_id {
                return false;
            }
        }
        if let Some(ref agent_id) = self.agent_id {
            if &interrupt.agent_id != agent_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if interrupt.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if interrupt.priority != priority {
                return false;
            }
        }
        true
    }
}
