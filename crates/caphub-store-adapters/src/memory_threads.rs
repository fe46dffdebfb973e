use std::collections::HashMap;

use async_trait::async_trait;
use caphub_contract::storage::{MessageQuery, StoreError, ThreadRepository};
use caphub_contract::thread::{Message, Thread};
use caphub_contract::time::current_unix_millis;

struct ThreadEntry {
    thread: Thread,
    messages: Vec<Message>,
    /// idempotency_key → index into `messages`.
    idempotency: HashMap<String, usize>,
}

/// In-memory thread repository for testing and local mode.
#[derive(Default)]
pub struct MemoryThreadRepository {
    entries: tokio::sync::RwLock<HashMap<String, ThreadEntry>>,
}

impl MemoryThreadRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadRepository for MemoryThreadRepository {
    async fn create(&self, thread: &Thread) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&thread.thread_id) {
            return Err(StoreError::AlreadyExists(thread.thread_id.clone()));
        }
        entries.insert(
            thread.thread_id.clone(),
            ThreadEntry {
                thread: thread.clone(),
                messages: Vec::new(),
                idempotency: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(thread_id).map(|e| e.thread.clone()))
    }

    async fn update(&self, thread: &Thread) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&thread.thread_id)
            .ok_or_else(|| StoreError::NotFound(thread.thread_id.clone()))?;
        entry.thread = thread.clone();
        entry.thread.updated_at = current_unix_millis();
        Ok(())
    }

    async fn append_message(
        &self,
        thread_id: &str,
        mut message: Message,
    ) -> Result<Message, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::NotFound(thread_id.to_string()))?;

        if let Some(ref key) = message.idempotency_key {
            if let Some(&idx) = entry.idempotency.get(key) {
                return Ok(entry.messages[idx].clone());
            }
        }

        message.seq = entry.messages.len() as u64;
        if let Some(ref key) = message.idempotency_key {
            entry.idempotency.insert(key.clone(), entry.messages.len());
        }
        entry.messages.push(message.clone());
        entry.thread.updated_at = current_unix_millis();
        Ok(message)
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, StoreError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(thread_id)
            .ok_or_else(|| StoreError::NotFound(thread_id.to_string()))?;

        let mut selected: Vec<Message> = entry
            .messages
            .iter()
            .filter(|m| query.after_seq.map_or(true, |s| m.seq > s))
            .filter(|m| query.before_seq.map_or(true, |s| m.seq < s))
            .filter(|m| query.role.map_or(true, |r| m.role == r))
            .cloned()
            .collect();

        if query.reverse {
            selected.reverse();
        }
        selected.truncate(query.clamped_limit());
        Ok(selected)
    }

    async fn message_count(&self, thread_id: &str) -> Result<u64, StoreError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(thread_id)
            .ok_or_else(|| StoreError::NotFound(thread_id.to_string()))?;
        Ok(entry.messages.len() as u64)
    }

    async fn list_threads(&self, agent_id: Option<&str>) -> Result<Vec<Thread>, StoreError> {
        let entries = self.entries.read().await;
        let mut threads: Vec<Thread> = entries
            .values()
            .filter(|e| agent_id.map_or(true, |a| e.thread.agent_id == a))
            .map(|e| e.thread.clone())
            .collect();
        threads.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        Ok(threads)
    }
}
