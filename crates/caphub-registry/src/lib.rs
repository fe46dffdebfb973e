//! Agent registry: the authoritative catalog of agents, their lifecycle
//! state, concurrency slots, and health.
//!
//! Writes are write-through: a registration is durable in the backing store
//! before the call returns, and the in-memory cache reflects the post-write
//! state atomically.

mod health;

use std::collections::HashMap;
use std::sync::Arc;

use caphub_contract::agent::{
    Agent, AgentPatch, AgentSpec, AgentStatus, DiscoveryCriteria, HealthState, HealthStatus,
    LifecycleState,
};
use caphub_contract::bus::EventBus;
use caphub_contract::error::{ErrorCode, HubError};
use caphub_contract::event::HubEvent;
use caphub_contract::storage::{RegistryStore, StoreError};
use caphub_contract::time::current_unix_millis;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use health::{AlwaysHealthyProbe, HealthProbe, HealthProber, ProbeSample};

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentRegistryError {
    #[error("agent {agent_id}@{version} already registered")]
    Conflict { agent_id: String, version: String },

    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent {agent_id} not ready: {reason}")]
    NotReady { agent_id: String, reason: String },

    #[error("agent {0} is unhealthy")]
    Unhealthy(String),

    #[error("agent {agent_id}: invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        agent_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("system {system} is at its agent cap ({cap})")]
    SystemAtCapacity { system: String, cap: usize },

    #[error("invalid agent spec: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AgentRegistryError> for HubError {
    fn from(err: AgentRegistryError) -> Self {
        match &err {
            AgentRegistryError::Conflict { .. } => HubError::conflict(err.to_string()),
            AgentRegistryError::NotFound(id) => HubError::agent_not_found(id),
            AgentRegistryError::NotReady { agent_id, reason } => {
                HubError::agent_not_ready(agent_id, reason)
            }
            AgentRegistryError::Unhealthy(id) => HubError::agent_unhealthy(id),
            AgentRegistryError::InvalidTransition { .. } => {
                HubError::new(ErrorCode::ValidLifecycleTransition, err.to_string())
            }
            AgentRegistryError::SystemAtCapacity { .. } => HubError::conflict(err.to_string()),
            AgentRegistryError::Validation(msg) => HubError::validation(msg.clone()),
            AgentRegistryError::Store(inner) => {
                HubError::internal(format!("registry store: {inner}"))
            }
        }
    }
}

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cap on registered agents per system namespace.
    pub max_agents_per_system: usize,
    /// Success-rate floor below which an agent is at best degraded.
    pub success_rate_floor: f64,
    /// Consecutive failed probes before an agent turns unhealthy.
    pub unhealthy_threshold: u32,
    /// Rolling probe-window length.
    pub probe_window: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_agents_per_system: 100,
            success_rate_floor: 0.9,
            unhealthy_threshold: 3,
            probe_window: 20,
        }
    }
}

/// A held concurrency slot. Dropping the slot releases it.
pub struct RunSlot {
    agent_id: String,
    _permit: OwnedSemaphorePermit,
}

impl RunSlot {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

struct AgentEntry {
    agent: Agent,
    slots: Arc<Semaphore>,
    slot_capacity: u32,
    /// Rolling probe window, newest last.
    window: Vec<ProbeSample>,
    consecutive_failures: u32,
}

impl AgentEntry {
    fn new(agent: Agent) -> Self {
        let capacity = agent.extensions.max_concurrent_runs;
        Self {
            agent,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            slot_capacity: capacity,
            window: Vec::new(),
            consecutive_failures: 0,
        }
    }

    fn active_runs(&self) -> u32 {
        self.slot_capacity
            .saturating_sub(self.slots.available_permits() as u32)
    }

    fn resize_slots(&mut self, new_capacity: u32) {
        if new_capacity > self.slot_capacity {
            self.slots
                .add_permits((new_capacity - self.slot_capacity) as usize);
        } else if new_capacity < self.slot_capacity {
            self.slots
                .forget_permits((self.slot_capacity - new_capacity) as usize);
        }
        self.slot_capacity = new_capacity;
    }
}

/// The agent registry service.
pub struct AgentRegistry {
    config: RegistryConfig,
    store: Arc<dyn RegistryStore>,
    bus: EventBus,
    entries: RwLock<HashMap<String, AgentEntry>>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, bus: EventBus, config: RegistryConfig) -> Self {
        Self {
            config,
            store,
            bus,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Re-warm the cache from the backing store (startup, or a worker
    /// joining a distributed deployment).
    pub async fn warm(&self) -> Result<usize, AgentRegistryError> {
        let agents = self.store.list().await?;
        let mut entries = self.entries.write().await;
        let count = agents.len();
        for agent in agents {
            entries
                .entry(agent.agent_id.clone())
                .or_insert_with(|| AgentEntry::new(agent));
        }
        info!(agents = count, "registry cache warmed");
        Ok(count)
    }

    /// Register a new agent.
    ///
    /// Fails with a conflict when an agent with the same id and version is
    /// already present in a non-terminal lifecycle state. Initialization is
    /// synchronous for in-process agents, so the stored record lands in
    /// `ready`.
    pub async fn register(&self, spec: AgentSpec) -> Result<Agent, AgentRegistryError> {
        if spec.agent_id.trim().is_empty() {
            return Err(AgentRegistryError::Validation("empty agent_id".into()));
        }
        if spec.extensions.max_concurrent_runs == 0 {
            return Err(AgentRegistryError::Validation(
                "max_concurrent_runs must be at least 1".into(),
            ));
        }

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&spec.agent_id) {
            let live = !matches!(
                existing.agent.lifecycle_state,
                LifecycleState::Stopped | LifecycleState::Failed
            );
            if live && existing.agent.version == spec.version {
                return Err(AgentRegistryError::Conflict {
                    agent_id: spec.agent_id,
                    version: spec.version.to_string(),
                });
            }
        }
        if let Some(ref system) = spec.system {
            let in_system = entries
                .values()
                .filter(|e| e.agent.system.as_deref() == Some(system.as_str()))
                .count();
            if in_system >= self.config.max_agents_per_system {
                return Err(AgentRegistryError::SystemAtCapacity {
                    system: system.clone(),
                    cap: self.config.max_agents_per_system,
                });
            }
        }

        let mut agent = spec.into_agent();
        agent.lifecycle_state = LifecycleState::Ready;

        // Durable before the cache (and the caller) sees it.
        self.store.put(&agent).await?;
        entries.insert(agent.agent_id.clone(), AgentEntry::new(agent.clone()));
        info!(agent_id = %agent.agent_id, version = %agent.version, "agent registered");
        Ok(agent)
    }

    /// Apply a partial update.
    pub async fn update(
        &self,
        agent_id: &str,
        patch: AgentPatch,
    ) -> Result<Agent, AgentRegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))?;

        let mut updated = entry.agent.clone();
        if let Some(state) = patch.lifecycle_state {
            if !updated.lifecycle_state.can_transition_to(state) {
                return Err(AgentRegistryError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from: updated.lifecycle_state,
                    to: state,
                });
            }
            updated.lifecycle_state = state;
        }
        if let Some(status) = patch.status {
            updated.status = status;
        }
        if let Some(capabilities) = patch.capabilities {
            updated.capabilities = capabilities;
        }
        if let Some(extensions) = patch.extensions {
            updated.extensions = extensions;
        }
        if let Some(weight) = patch.routing_weight {
            updated.routing_weight = weight;
        }
        updated.updated_at = current_unix_millis();

        self.store.put(&updated).await?;
        if updated.extensions.max_concurrent_runs != entry.slot_capacity {
            entry.resize_slots(updated.extensions.max_concurrent_runs);
        }
        entry.agent = updated.clone();
        Ok(updated)
    }

    pub async fn delete(&self, agent_id: &str) -> Result<(), AgentRegistryError> {
        let mut entries = self.entries.write().await;
        if entries.remove(agent_id).is_none() {
            return Err(AgentRegistryError::NotFound(agent_id.to_string()));
        }
        self.store.delete(agent_id).await?;
        debug!(agent_id, "agent deleted");
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Result<Agent, AgentRegistryError> {
        let entries = self.entries.read().await;
        entries
            .get(agent_id)
            .map(|e| e.agent.clone())
            .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))
    }

    /// Mark an agent deprecated. Deprecated agents stay resolvable but are
    /// excluded from dispatch gating.
    pub async fn deprecate(&self, agent_id: &str) -> Result<Agent, AgentRegistryError> {
        self.update(
            agent_id,
            AgentPatch {
                status: Some(AgentStatus::Deprecated),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_routing_weight(
        &self,
        agent_id: &str,
        weight: i64,
    ) -> Result<Agent, AgentRegistryError> {
        self.update(
            agent_id,
            AgentPatch {
                routing_weight: Some(weight),
                ..Default::default()
            },
        )
        .await
    }

    /// Discover agents matching the criteria, sorted by health (healthy
    /// first), then routing weight descending, then lexicographic id.
    pub async fn discover(&self, criteria: &DiscoveryCriteria) -> Vec<Agent> {
        let entries = self.entries.read().await;
        let mut matched: Vec<Agent> = entries
            .values()
            .map(|e| e.agent.clone())
            .filter(|a| criteria.matches(a))
            .collect();

        fn health_rank(agent: &Agent) -> u8 {
            match agent.health.as_ref().map(|h| h.state) {
                Some(HealthState::Healthy) | None => 0,
                Some(HealthState::Degraded) => 1,
                Some(HealthState::Unhealthy) => 2,
            }
        }
        matched.sort_by(|a, b| {
            health_rank(a)
                .cmp(&health_rank(b))
                .then(b.routing_weight.cmp(&a.routing_weight))
                .then(a.agent_id.cmp(&b.agent_id))
        });

        let offset = criteria.offset.unwrap_or(0).min(matched.len());
        let mut matched = matched.split_off(offset);
        if let Some(limit) = criteria.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Current health snapshot.
    pub async fn health(&self, agent_id: &str) -> Result<HealthStatus, AgentRegistryError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(agent_id)
            .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))?;
        Ok(entry.agent.health.clone().unwrap_or_default())
    }

    /// Check the dispatch gate: active status, dispatchable lifecycle state,
    /// and not unhealthy. The concurrency limit is enforced by slot
    /// acquisition, not here.
    pub async fn ensure_dispatchable(&self, agent_id: &str) -> Result<Agent, AgentRegistryError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(agent_id)
            .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))?;
        let agent = &entry.agent;

        if agent.status != AgentStatus::Active {
            return Err(AgentRegistryError::NotReady {
                agent_id: agent_id.to_string(),
                reason: format!("status is {:?}", agent.status),
            });
        }
        if !agent.lifecycle_state.is_dispatchable() {
            return Err(AgentRegistryError::NotReady {
                agent_id: agent_id.to_string(),
                reason: format!("lifecycle state is {:?}", agent.lifecycle_state),
            });
        }
        if agent.health.as_ref().map(|h| h.state) == Some(HealthState::Unhealthy) {
            return Err(AgentRegistryError::Unhealthy(agent_id.to_string()));
        }
        Ok(agent.clone())
    }

    /// Try to claim a concurrency slot without waiting.
    pub async fn try_acquire_slot(
        &self,
        agent_id: &str,
    ) -> Result<Option<RunSlot>, AgentRegistryError> {
        let slots = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(agent_id)
                .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))?;
            entry.slots.clone()
        };
        match slots.try_acquire_owned() {
            Ok(permit) => Ok(Some(RunSlot {
                agent_id: agent_id.to_string(),
                _permit: permit,
            })),
            Err(_) => Ok(None),
        }
    }

    /// Claim a concurrency slot, waiting until one frees or the token fires.
    ///
    /// Returns `None` when cancelled while waiting.
    pub async fn acquire_slot(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RunSlot>, AgentRegistryError> {
        let slots = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(agent_id)
                .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))?;
            entry.slots.clone()
        };
        tokio::select! {
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => Ok(Some(RunSlot {
                    agent_id: agent_id.to_string(),
                    _permit: permit,
                })),
                Err(_) => Err(AgentRegistryError::NotReady {
                    agent_id: agent_id.to_string(),
                    reason: "agent slots closed".into(),
                }),
            },
            _ = cancel.cancelled() => Ok(None),
        }
    }

    /// Live active-run count for an agent.
    pub async fn active_runs(&self, agent_id: &str) -> Result<u32, AgentRegistryError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(agent_id)
            .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))?;
        Ok(entry.active_runs())
    }

    /// Record a health probe sample and recompute the composite status.
    ///
    /// Publishes `agent:health_changed` when the composite state moves.
    pub async fn record_probe(
        &self,
        agent_id: &str,
        sample: ProbeSample,
        queued_runs: u32,
    ) -> Result<HealthStatus, AgentRegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AgentRegistryError::NotFound(agent_id.to_string()))?;

        if sample.success {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
        }
        entry.window.push(sample);
        let excess = entry.window.len().saturating_sub(self.config.probe_window);
        if excess > 0 {
            entry.window.drain(..excess);
        }

        let successes = entry.window.iter().filter(|s| s.success).count();
        let success_rate = successes as f64 / entry.window.len() as f64;
        let avg_latency_ms = entry.window.iter().map(|s| s.latency_ms).sum::<f64>()
            / entry.window.len() as f64;
        let (latest_checks, latest_success) = entry
            .window
            .last()
            .map(|s| (s.checks.clone(), s.success))
            .unwrap_or((Vec::new(), true));

        let critical_failure = latest_checks.iter().any(|c| c.critical && !c.passed);
        let any_failure = latest_checks.iter().any(|c| !c.passed) || !latest_success;
        let state = if critical_failure
            || entry.consecutive_failures >= self.config.unhealthy_threshold
        {
            HealthState::Unhealthy
        } else if any_failure || success_rate < self.config.success_rate_floor {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        let previous = entry
            .agent
            .health
            .as_ref()
            .map(|h| h.state)
            .unwrap_or_default();
        let status = HealthStatus {
            state,
            avg_latency_ms,
            success_rate,
            active_runs: entry.active_runs(),
            queued_runs,
            checks: latest_checks,
            consecutive_failures: entry.consecutive_failures,
            checked_at: current_unix_millis(),
        };
        entry.agent.health = Some(status.clone());
        entry.agent.updated_at = status.checked_at;
        self.store.put(&entry.agent).await?;

        if previous != state {
            debug!(agent_id, ?previous, ?state, "agent health changed");
            self.bus.publish(HubEvent::AgentHealthChanged {
                agent_id: agent_id.to_string(),
                from: previous,
                to: state,
            });
        }
        Ok(status)
    }

    /// Ids of all cached agents.
    pub async fn agent_ids(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caphub_contract::agent::{AgentExtensions, AgentVersion, ComponentCheck};
    use caphub_store_adapters::MemoryRegistryStore;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(
            Arc::new(MemoryRegistryStore::new()),
            EventBus::default(),
            RegistryConfig::default(),
        )
    }

    fn spec(id: &str) -> AgentSpec {
        AgentSpec::new(id, AgentVersion::new(1, 0, 0))
    }

    #[tokio::test]
    async fn test_register_then_get_roundtrip() {
        let registry = registry();
        let registered = registry.register(spec("a-1")).await.unwrap();
        assert_eq!(registered.lifecycle_state, LifecycleState::Ready);

        let fetched = registry.get("a-1").await.unwrap();
        assert_eq!(fetched.agent_id, registered.agent_id);
        assert_eq!(fetched.version, registered.version);
    }

    #[tokio::test]
    async fn test_register_conflict_same_version() {
        let registry = registry();
        registry.register(spec("a-1")).await.unwrap();
        let err = registry.register(spec("a-1")).await.unwrap_err();
        assert!(matches!(err, AgentRegistryError::Conflict { .. }));

        // A different version is allowed to replace.
        let next = AgentSpec::new("a-1", AgentVersion::new(1, 1, 0));
        registry.register(next).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_gating() {
        let registry = registry();
        registry.register(spec("a-1")).await.unwrap();
        registry.ensure_dispatchable("a-1").await.unwrap();

        registry.deprecate("a-1").await.unwrap();
        let err = registry.ensure_dispatchable("a-1").await.unwrap_err();
        assert!(matches!(err, AgentRegistryError::NotReady { .. }));

        let err = registry.ensure_dispatchable("missing").await.unwrap_err();
        assert!(matches!(err, AgentRegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_slot_limit_and_release() {
        let registry = registry();
        let mut s = spec("a-1");
        s.extensions = AgentExtensions {
            max_concurrent_runs: 2,
            ..Default::default()
        };
        registry.register(s).await.unwrap();

        let slot1 = registry.try_acquire_slot("a-1").await.unwrap().unwrap();
        let _slot2 = registry.try_acquire_slot("a-1").await.unwrap().unwrap();
        assert!(registry.try_acquire_slot("a-1").await.unwrap().is_none());
        assert_eq!(registry.active_runs("a-1").await.unwrap(), 2);

        drop(slot1);
        assert!(registry.try_acquire_slot("a-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_discovery_sorting() {
        let registry = registry();
        registry.register(spec("b")).await.unwrap();
        registry.register(spec("a")).await.unwrap();
        registry.register(spec("c")).await.unwrap();
        registry.set_routing_weight("c", 10).await.unwrap();

        // Degrade "a" with three failed probes.
        for _ in 0..3 {
            registry
                .record_probe("a", ProbeSample::failure(5.0), 0)
                .await
                .unwrap();
        }

        let found = registry.discover(&DiscoveryCriteria::default()).await;
        let ids: Vec<&str> = found.iter().map(|a| a.agent_id.as_str()).collect();
        // healthy first (weight desc, then id), unhealthy last
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_health_streak_turns_unhealthy() {
        let registry = registry();
        registry.register(spec("a-1")).await.unwrap();

        let status = registry
            .record_probe("a-1", ProbeSample::success(10.0), 0)
            .await
            .unwrap();
        assert_eq!(status.state, HealthState::Healthy);

        for _ in 0..2 {
            registry
                .record_probe("a-1", ProbeSample::failure(10.0), 0)
                .await
                .unwrap();
        }
        let status = registry
            .record_probe("a-1", ProbeSample::failure(10.0), 0)
            .await
            .unwrap();
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.state, HealthState::Unhealthy);

        let err = registry.ensure_dispatchable("a-1").await.unwrap_err();
        assert!(matches!(err, AgentRegistryError::Unhealthy(_)));
    }

    #[tokio::test]
    async fn test_critical_check_is_unhealthy_immediately() {
        let registry = registry();
        registry.register(spec("a-1")).await.unwrap();
        let sample = ProbeSample {
            success: true,
            latency_ms: 3.0,
            checks: vec![ComponentCheck {
                component: "store".into(),
                passed: false,
                critical: true,
                detail: None,
            }],
        };
        let status = registry.record_probe("a-1", sample, 0).await.unwrap();
        assert_eq!(status.state, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_invalid_lifecycle_transition_rejected() {
        let registry = registry();
        registry.register(spec("a-1")).await.unwrap();
        let err = registry
            .update(
                "a-1",
                AgentPatch {
                    lifecycle_state: Some(LifecycleState::Registered),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentRegistryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_warm_reloads_from_store() {
        let store = Arc::new(MemoryRegistryStore::new());
        let registry = AgentRegistry::new(store.clone(), EventBus::default(), RegistryConfig::default());
        registry.register(spec("a-1")).await.unwrap();

        let second =
            AgentRegistry::new(store, EventBus::default(), RegistryConfig::default());
        assert_eq!(second.warm().await.unwrap(), 1);
        second.get("a-1").await.unwrap();
    }
}
