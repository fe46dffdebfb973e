//! Thread store service: the conversation log that carries context across
//! runs.
//!
//! Messages are append-only and totally ordered per thread; closed and
//! archived threads reject new appends. Context-window assembly lives in
//! [`context`].

mod context;
mod summarize;

use std::collections::HashMap;
use std::sync::Arc;

use caphub_contract::error::HubError;
use caphub_contract::storage::{MessageQuery, StoreError, ThreadRepository};
use caphub_contract::thread::{ContextWindow, Message, Thread, ThreadStatus, ThreadSummary};
use caphub_contract::time::current_unix_millis;
use serde_json::Value;
use tracing::debug;

pub use context::ContextBudget;
pub use summarize::{SummarizePolicy, Summarizer, TruncatingSummarizer};

/// Thread service errors.
#[derive(Debug, thiserror::Error)]
pub enum ThreadServiceError {
    #[error("thread not found: {0}")]
    NotFound(String),

    #[error("thread {0} is closed")]
    Closed(String),

    #[error("invalid thread status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ThreadStatus,
        to: ThreadStatus,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("summarization failed: {0}")]
    Summarize(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ThreadServiceError> for HubError {
    fn from(err: ThreadServiceError) -> Self {
        match &err {
            ThreadServiceError::NotFound(id) => HubError::thread_not_found(id),
            ThreadServiceError::Closed(id) => HubError::thread_closed(id),
            ThreadServiceError::InvalidTransition { .. } => HubError::validation(err.to_string()),
            ThreadServiceError::Validation(msg) => HubError::validation(msg.clone()),
            ThreadServiceError::Summarize(msg) => HubError::internal(msg.clone()),
            ThreadServiceError::Store(inner) => HubError::internal(format!("thread store: {inner}")),
        }
    }
}

/// Thread service tunables.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Message count past which `summarize` produces a summary.
    pub summary_threshold: u64,
    /// Tail messages always retained verbatim by context assembly.
    pub min_tail_messages: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            summary_threshold: 50,
            min_tail_messages: 5,
        }
    }
}

/// The thread store service.
pub struct ThreadService {
    repo: Arc<dyn ThreadRepository>,
    summarizer: Arc<dyn Summarizer>,
    config: ThreadConfig,
}

impl ThreadService {
    pub fn new(
        repo: Arc<dyn ThreadRepository>,
        summarizer: Arc<dyn Summarizer>,
        config: ThreadConfig,
    ) -> Self {
        Self {
            repo,
            summarizer,
            config,
        }
    }

    /// Create a thread, optionally seeding initial messages.
    pub async fn create(
        &self,
        agent_id: &str,
        metadata: HashMap<String, Value>,
        initial_messages: Vec<Message>,
    ) -> Result<Thread, ThreadServiceError> {
        if agent_id.trim().is_empty() {
            return Err(ThreadServiceError::Validation("empty agent_id".into()));
        }
        let thread = Thread::new(agent_id).with_metadata(metadata);
        self.repo.create(&thread).await?;
        for message in initial_messages {
            self.repo.append_message(&thread.thread_id, message).await?;
        }
        debug!(thread_id = %thread.thread_id, agent_id, "thread created");
        Ok(thread)
    }

    pub async fn get(&self, thread_id: &str) -> Result<Thread, ThreadServiceError> {
        self.repo
            .load(thread_id)
            .await?
            .ok_or_else(|| ThreadServiceError::NotFound(thread_id.to_string()))
    }

    /// Append a message. Atomic: the message is durable and visible, or the
    /// call failed.
    pub async fn append(
        &self,
        thread_id: &str,
        message: Message,
    ) -> Result<Message, ThreadServiceError> {
        let thread = self.get(thread_id).await?;
        if !thread.status.accepts_appends() {
            return Err(ThreadServiceError::Closed(thread_id.to_string()));
        }
        Ok(self.repo.append_message(thread_id, message).await?)
    }

    /// List messages in append order (or reversed per the query).
    pub async fn list_messages(
        &self,
        thread_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, ThreadServiceError> {
        // Surface a typed not-found rather than the raw store error.
        self.get(thread_id).await?;
        Ok(self.repo.list_messages(thread_id, query).await?)
    }

    /// Replace the caller-defined metadata bag.
    pub async fn update_metadata(
        &self,
        thread_id: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<Thread, ThreadServiceError> {
        let mut thread = self.get(thread_id).await?;
        thread.metadata = metadata;
        thread.updated_at = current_unix_millis();
        self.repo.update(&thread).await?;
        Ok(thread)
    }

    /// Transition the thread status machine.
    pub async fn update_status(
        &self,
        thread_id: &str,
        status: ThreadStatus,
    ) -> Result<Thread, ThreadServiceError> {
        let mut thread = self.get(thread_id).await?;
        if thread.status == status {
            return Ok(thread);
        }
        if !thread.status.can_transition_to(status) {
            return Err(ThreadServiceError::InvalidTransition {
                from: thread.status,
                to: status,
            });
        }
        thread.status = status;
        thread.updated_at = current_unix_millis();
        self.repo.update(&thread).await?;
        Ok(thread)
    }

    /// Close a thread, recording an optional closing summary and resolution.
    pub async fn close(
        &self,
        thread_id: &str,
        summary: Option<String>,
        resolution: Option<String>,
    ) -> Result<Thread, ThreadServiceError> {
        let mut thread = self.get(thread_id).await?;
        if !thread.status.can_transition_to(ThreadStatus::Closed) {
            return Err(ThreadServiceError::InvalidTransition {
                from: thread.status,
                to: ThreadStatus::Closed,
            });
        }
        thread.status = ThreadStatus::Closed;
        thread.closing_summary = summary;
        thread.resolution = resolution;
        thread.updated_at = current_unix_millis();
        self.repo.update(&thread).await?;
        Ok(thread)
    }

    /// Archive a closed thread. Retention is recorded for the backend's
    /// reaper; the hub itself does not delete archived threads.
    pub async fn archive(
        &self,
        thread_id: &str,
        retention_ms: Option<u64>,
    ) -> Result<Thread, ThreadServiceError> {
        let mut thread = self.get(thread_id).await?;
        if !thread.status.can_transition_to(ThreadStatus::Archived) {
            return Err(ThreadServiceError::InvalidTransition {
                from: thread.status,
                to: ThreadStatus::Archived,
            });
        }
        thread.status = ThreadStatus::Archived;
        if let Some(retention) = retention_ms {
            thread
                .metadata
                .insert("retention_ms".into(), Value::from(retention));
        }
        thread.updated_at = current_unix_millis();
        self.repo.update(&thread).await?;
        Ok(thread)
    }

    /// Produce (or refresh) the thread summary.
    ///
    /// A summary is only produced once the log exceeds the configured
    /// threshold, unless the policy forces one. Re-summarization replaces
    /// the stored summary and bumps its version.
    pub async fn summarize(
        &self,
        thread_id: &str,
        policy: SummarizePolicy,
    ) -> Result<Option<ThreadSummary>, ThreadServiceError> {
        let mut thread = self.get(thread_id).await?;
        let count = self.repo.message_count(thread_id).await?;
        if !policy.force && count <= self.config.summary_threshold {
            return Ok(None);
        }

        let keep_tail = policy.keep_tail.unwrap_or(self.config.min_tail_messages) as u64;
        let covers_through = count.saturating_sub(keep_tail);
        if covers_through == 0 {
            return Ok(None);
        }
        let to_summarize = self
            .repo
            .list_messages(
                thread_id,
                &MessageQuery {
                    before_seq: Some(covers_through),
                    limit: 200,
                    ..Default::default()
                },
            )
            .await?;

        let content = self
            .summarizer
            .summarize(&thread, &to_summarize, thread.summary.as_ref())
            .await
            .map_err(|e| ThreadServiceError::Summarize(e.to_string()))?;

        let version = thread.summary.as_ref().map_or(1, |s| s.version + 1);
        let summary = ThreadSummary {
            content,
            version,
            covers_through_seq: covers_through - 1,
            created_at: current_unix_millis(),
        };
        thread.summary = Some(summary.clone());
        thread.updated_at = summary.created_at;
        self.repo.update(&thread).await?;
        debug!(thread_id, version, "thread summarized");
        Ok(Some(summary))
    }

    /// Assemble the prompt context for an agent under a token budget.
    pub async fn get_context(
        &self,
        thread_id: &str,
        budget: ContextBudget,
    ) -> Result<ContextWindow, ThreadServiceError> {
        let thread = self.get(thread_id).await?;
        // Fetch the newest window of history; assembly trims to budget.
        let mut messages = self
            .repo
            .list_messages(
                thread_id,
                &MessageQuery {
                    limit: 200,
                    reverse: true,
                    ..Default::default()
                },
            )
            .await?;
        messages.reverse();
        Ok(context::assemble(
            &thread,
            &messages,
            budget,
            self.config.min_tail_messages,
        ))
    }

    /// List threads, optionally scoped to one agent.
    pub async fn list(&self, agent_id: Option<&str>) -> Result<Vec<Thread>, ThreadServiceError> {
        Ok(self.repo.list_threads(agent_id).await?)
    }
}
