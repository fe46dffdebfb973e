use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use caphub_contract::storage::{QueueJob, StoreError, WorkQueue};
use caphub_contract::time::current_unix_millis;

struct QueueState {
    /// Waiting jobs in FIFO order.
    ready: VecDeque<String>,
    /// job_id → payload, for both ready and in-flight jobs.
    payloads: HashMap<String, Vec<u8>>,
    /// job_id → lease expiry (unix millis) for claimed jobs.
    leases: HashMap<String, u64>,
}

/// In-memory at-least-once work queue with claim leases.
///
/// Mirrors the distributed-mode queue contract: claim with a lease,
/// acknowledge on completion, negative-acknowledge to requeue, and a
/// visibility timeout that returns abandoned leases.
#[derive(Default)]
pub struct MemoryWorkQueue {
    state: tokio::sync::Mutex<QueueState>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            payloads: HashMap::new(),
            leases: HashMap::new(),
        }
    }
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, job_id: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.payloads.contains_key(job_id) {
            // Already queued or in flight; at-least-once permits the no-op.
            return Ok(());
        }
        state.payloads.insert(job_id.to_string(), payload);
        state.ready.push_back(job_id.to_string());
        Ok(())
    }

    async fn claim(&self, lease: Duration) -> Result<Option<QueueJob>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job_id) = state.ready.pop_front() else {
            return Ok(None);
        };
        let lease_expires_at = current_unix_millis() + lease.as_millis() as u64;
        state.leases.insert(job_id.clone(), lease_expires_at);
        let payload = state
            .payloads
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("payload missing for job {job_id}")))?;
        Ok(Some(QueueJob {
            job_id,
            payload,
            lease_expires_at,
        }))
    }

    async fn ack(&self, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.leases.remove(job_id);
        state.payloads.remove(job_id);
        Ok(())
    }

    async fn nack(&self, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.leases.remove(job_id).is_some() && state.payloads.contains_key(job_id) {
            state.ready.push_back(job_id.to_string());
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, StoreError> {
        let now = current_unix_millis();
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, &expires)| expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in &expired {
            state.leases.remove(job_id);
            if state.payloads.contains_key(job_id) {
                state.ready.push_back(job_id.clone());
            }
        }
        Ok(expired.len() as u64)
    }

    async fn pending_len(&self) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ready.len())
    }
}
