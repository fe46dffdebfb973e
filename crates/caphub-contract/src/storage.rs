//! Persistence and queue contracts.
//!
//! The hub only assumes these interfaces; backends live behind them. The
//! required guarantees: strongly consistent read-after-write for single
//! entities, ordered appends for thread messages, and atomic cross-entity
//! transactions where a method is documented as transactional.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::{ErrorCode, HubError};
use crate::thread::{Message, Role, Thread};

/// Errors surfaced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound(_) => HubError::new(ErrorCode::Internal, err.to_string()),
            StoreError::AlreadyExists(_) | StoreError::Conflict(_) => {
                HubError::new(ErrorCode::Conflict, err.to_string())
            }
            StoreError::Serialization(_) => HubError::new(ErrorCode::ValidSchema, err.to_string()),
            StoreError::Backend(_) => {
                HubError::new(ErrorCode::NetUpstream, err.to_string()).with_retryable(true)
            }
        }
    }
}

/// Message listing parameters.
#[derive(Debug, Clone)]
pub struct MessageQuery {
    /// Return messages with sequence strictly greater than this value.
    pub after_seq: Option<u64>,
    /// Return messages with sequence strictly less than this value.
    pub before_seq: Option<u64>,
    /// Maximum number of messages to return (clamped to 1..=200).
    pub limit: usize,
    /// Return newest-first instead of append order.
    pub reverse: bool,
    /// Filter by role.
    pub role: Option<Role>,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            after_seq: None,
            before_seq: None,
            limit: 50,
            reverse: false,
            role: None,
        }
    }
}

impl MessageQuery {
    pub fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, 200)
    }
}

/// Durable thread + message persistence.
///
/// `append_message` must be atomic and ordered: the assigned sequence is a
/// total order consistent with append time, and a message is either durable
/// and visible or absent.
#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn create(&self, thread: &Thread) -> Result<(), StoreError>;

    async fn load(&self, thread_id: &str) -> Result<Option<Thread>, StoreError>;

    /// Persist thread-level fields (status, summary, metadata). Messages are
    /// append-only and not touched by this call.
    async fn update(&self, thread: &Thread) -> Result<(), StoreError>;

    /// Append a message, assigning its per-thread sequence. Repeated appends
    /// with the same idempotency key return the originally stored message.
    async fn append_message(
        &self,
        thread_id: &str,
        message: Message,
    ) -> Result<Message, StoreError>;

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, StoreError>;

    async fn message_count(&self, thread_id: &str) -> Result<u64, StoreError>;

    async fn list_threads(&self, agent_id: Option<&str>) -> Result<Vec<Thread>, StoreError>;
}

/// Write-through persistence for agent records.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Upsert an agent record; durable before return.
    async fn put(&self, agent: &Agent) -> Result<(), StoreError>;

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, StoreError>;

    async fn delete(&self, agent_id: &str) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Agent>, StoreError>;
}

/// Durable key → blob mapping for resumable run snapshots.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// A claimed queue job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: String,
    pub payload: Vec<u8>,
    /// Unix millis when the claim lease lapses.
    pub lease_expires_at: u64,
}

/// At-least-once work queue used in distributed mode.
///
/// Redelivery is safe because the executor replays from checkpoints.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a job keyed by id. Re-enqueueing an in-flight id is a no-op.
    async fn enqueue(&self, job_id: &str, payload: Vec<u8>) -> Result<(), StoreError>;

    /// Claim the next available job with a lease of the given duration.
    async fn claim(&self, lease: Duration) -> Result<Option<QueueJob>, StoreError>;

    /// Acknowledge successful completion; removes the job.
    async fn ack(&self, job_id: &str) -> Result<(), StoreError>;

    /// Negative-acknowledge; the job becomes claimable again immediately.
    async fn nack(&self, job_id: &str) -> Result<(), StoreError>;

    /// Return leases held past their expiry to the queue. Returns how many
    /// jobs were recovered.
    async fn requeue_expired(&self) -> Result<u64, StoreError>;

    /// Jobs currently waiting to be claimed.
    async fn pending_len(&self) -> Result<usize, StoreError>;
}
