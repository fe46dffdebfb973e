//! Background health probing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caphub_contract::agent::{Agent, ComponentCheck};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::AgentRegistry;

/// One probe observation.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    pub success: bool,
    pub latency_ms: f64,
    pub checks: Vec<ComponentCheck>,
}

impl ProbeSample {
    pub fn success(latency_ms: f64) -> Self {
        Self {
            success: true,
            latency_ms,
            checks: Vec::new(),
        }
    }

    pub fn failure(latency_ms: f64) -> Self {
        Self {
            success: false,
            latency_ms,
            checks: Vec::new(),
        }
    }
}

/// Probe target abstraction. The real target is whatever backs the agent
/// (a process, an endpoint); tests and local mode plug in stubs.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, agent: &Agent) -> ProbeSample;
}

/// Probe stub that always reports success. Used in local mode where agents
/// are in-process and have no external surface to check.
pub struct AlwaysHealthyProbe;

#[async_trait]
impl HealthProbe for AlwaysHealthyProbe {
    async fn probe(&self, _agent: &Agent) -> ProbeSample {
        ProbeSample::success(0.0)
    }
}

/// Periodic prober driving [`AgentRegistry::record_probe`] for every agent.
pub struct HealthProber {
    registry: Arc<AgentRegistry>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl HealthProber {
    pub fn new(
        registry: Arc<AgentRegistry>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            probe,
            interval,
            shutdown,
        }
    }

    /// Spawn the probe loop. The task exits when the shutdown token fires.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        debug!("health prober stopping");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                for agent_id in self.registry.agent_ids().await {
                    let Ok(agent) = self.registry.get(&agent_id).await else {
                        continue;
                    };
                    let sample = self.probe.probe(&agent).await;
                    if let Err(err) = self.registry.record_probe(&agent_id, sample, 0).await {
                        warn!(agent_id, error = %err, "failed to record health probe");
                    }
                }
            }
        })
    }
}
