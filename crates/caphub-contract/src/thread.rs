//! Conversation threads: append-only message logs tied to one agent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::{current_unix_millis, gen_id};

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Thread lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    #[default]
    Active,
    Paused,
    Closed,
    Archived,
}

impl ThreadStatus {
    /// Closed and archived threads reject new appends.
    pub fn accepts_appends(&self) -> bool {
        matches!(self, ThreadStatus::Active | ThreadStatus::Paused)
    }

    /// Valid status-machine edges: active ↔ paused, {active, paused} → closed → archived.
    pub fn can_transition_to(&self, next: ThreadStatus) -> bool {
        use ThreadStatus::*;
        matches!(
            (self, next),
            (Active, Paused) | (Paused, Active) | (Active, Closed) | (Paused, Closed) | (Closed, Archived)
        )
    }
}

/// Optional metadata carried by a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Tool call this message responds to (for tool role).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool that produced this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Model that produced this message (for assistant role).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    /// Marks a decision-point message retained verbatim by the hybrid
    /// context strategy.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_call_id.is_none()
            && self.tool_name.is_none()
            && self.model.is_none()
            && self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && !self.pinned
    }
}

fn metadata_is_none_or_empty(meta: &Option<MessageMetadata>) -> bool {
    meta.as_ref().map_or(true, MessageMetadata::is_empty)
}

/// A message in a conversation thread.
///
/// Messages are never mutated or deleted in place; `seq` is the per-thread
/// append sequence assigned by the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable message identifier (UUID v7, auto-generated when absent on
    /// the wire).
    #[serde(default = "default_message_id")]
    pub message_id: String,
    /// Per-thread append sequence (0-based, assigned on append).
    #[serde(default)]
    pub seq: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "metadata_is_none_or_empty")]
    pub metadata: Option<MessageMetadata>,
    /// Idempotency key: repeated appends with the same key append exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default = "current_unix_millis")]
    pub created_at: u64,
}

fn default_message_id() -> String {
    gen_id("msg")
}

impl Message {
    /// Create a message with an explicit role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            message_id: gen_id("msg"),
            seq: 0,
            role,
            content: content.into(),
            metadata: None,
            idempotency_key: None,
            created_at: current_unix_millis(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool response message.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.metadata = Some(MessageMetadata {
            tool_call_id: Some(call_id.into()),
            ..Default::default()
        });
        msg
    }

    /// Attach metadata to this message.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Rough token estimate for context budgeting (chars / 4).
    pub fn estimated_tokens(&self) -> u64 {
        (self.content.len() as u64 / 4).max(1)
    }
}

/// A stored, versioned thread summary.
///
/// Re-summarization replaces the summary; `version` bumps on each replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub content: String,
    pub version: u64,
    /// Sequence of the last message covered by this summary.
    pub covers_through_seq: u64,
    pub created_at: u64,
}

/// An ordered, append-only conversation log tied to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub status: ThreadStatus,
    /// Caller-defined key/value bag (`user_id` and `session_id` when provided).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ThreadSummary>,
    /// Closing summary text, recorded by `close`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Thread {
    /// Create a new active thread for an agent.
    pub fn new(agent_id: impl Into<String>) -> Self {
        let now = current_unix_millis();
        Self {
            thread_id: gen_id("thr"),
            agent_id: agent_id.into(),
            status: ThreadStatus::Active,
            metadata: HashMap::new(),
            summary: None,
            closing_summary: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set caller metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Context-window assembly strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    /// Newest messages until the budget is exhausted.
    #[default]
    Recent,
    /// Replace the oldest messages with the stored summary, then append
    /// recent messages verbatim.
    Summary,
    /// Summary plus pinned decision-point messages plus a recent tail.
    Hybrid,
}

/// Assembled prompt context for an agent, bounded by a token budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextWindow {
    pub thread_id: String,
    pub strategy: ContextStrategy,
    /// Summary text included in place of elided history, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Pinned decision-point messages (hybrid strategy).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned: Vec<Message>,
    /// Verbatim message tail, in thread order.
    pub messages: Vec<Message>,
    pub estimated_tokens: u64,
    /// Sequence of the newest message included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
}
