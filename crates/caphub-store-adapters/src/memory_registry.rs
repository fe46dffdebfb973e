use std::collections::HashMap;

use async_trait::async_trait;
use caphub_contract::agent::Agent;
use caphub_contract::storage::{RegistryStore, StoreError};

/// In-memory agent store for testing and local mode.
#[derive(Default)]
pub struct MemoryRegistryStore {
    agents: tokio::sync::RwLock<HashMap<String, Agent>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn put(&self, agent: &Agent) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        agents.insert(agent.agent_id.clone(), agent.clone());
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let agents = self.agents.read().await;
        Ok(agents.get(agent_id).cloned())
    }

    async fn delete(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        agents.remove(agent_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Agent>, StoreError> {
        let agents = self.agents.read().await;
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(list)
    }
}
