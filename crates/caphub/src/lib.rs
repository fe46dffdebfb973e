//! The capability hub: a coordination service that registers agents, opens
//! stateful conversation threads against them, and drives runs through
//! typed steps.
//!
//! [`Hub`] is the composition root: it wires the registry, thread store,
//! handler router, interrupt subsystem, and run executor together, and owns
//! shutdown of every background task.

mod config;

use std::sync::Arc;

use caphub_contract::bus::EventBus;
use caphub_contract::storage::{CheckpointStore, RegistryStore, ThreadRepository, WorkQueue};
use caphub_executor::{ExecutorConfig, RetryPolicy, RunExecutor};
use caphub_interrupt::{InterruptService, InterruptSweeper};
use caphub_registry::{
    AgentRegistry, AlwaysHealthyProbe, HealthProbe, HealthProber, RegistryConfig,
};
use caphub_router::{HandlerRegistry, HandlerRegistryError, RouterConfig};
use caphub_store_adapters::{
    MemoryCheckpointStore, MemoryRegistryStore, MemoryThreadRepository, MemoryWorkQueue,
};
use caphub_threads::{Summarizer, ThreadConfig, ThreadService, TruncatingSummarizer};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use caphub_contract as contract;
pub use caphub_contract::{
    Agent, AgentPatch, AgentSpec, AgentStatus, AgentVersion, Capabilities, ContextStrategy,
    ContextWindow, DiscoveryCriteria, ErrorCode, HandlerInput, HandlerMetadata, HandlerOutput,
    HealthState, HealthStatus, HubEvent, Interrupt, InterruptFilter, InterruptPayload,
    InterruptPriority, InterruptRequest, InterruptResponse, InterruptStatus, InterruptType,
    LifecycleState, Message, MessageMetadata, Operation, ParallelPolicy, Role, Run, RunFilter, RunInput,
    RunOptions, RunOutput, RunStatus, Step, StepContext, StepError, StepHandler, StepStatus,
    StepType, Thread, ThreadStatus, TokenUsage,
};
pub use caphub_contract::HubError;
pub use caphub_executor::{run_parallel_step, ParallelChild};
pub use caphub_interrupt::InterruptServiceError;
pub use caphub_registry::AgentRegistryError;
pub use caphub_router::HandlerRegistryError as RouterError;
pub use caphub_threads::{ContextBudget, SummarizePolicy, ThreadServiceError};
pub use config::HubConfig;

/// Errors raised while assembling a hub.
#[derive(Debug, thiserror::Error)]
pub enum HubBuildError {
    #[error(transparent)]
    Handler(#[from] HandlerRegistryError),

    #[error("invalid hub configuration: {0}")]
    Config(String),
}

/// Builder for [`Hub`]. Storage adapters default to the in-memory
/// implementations; production deployments inject their backends.
pub struct HubBuilder {
    config: HubConfig,
    registry_store: Option<Arc<dyn RegistryStore>>,
    thread_repository: Option<Arc<dyn ThreadRepository>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    work_queue: Option<Arc<dyn WorkQueue>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    health_probe: Option<Arc<dyn HealthProbe>>,
    handlers: Vec<Arc<dyn StepHandler>>,
}

impl HubBuilder {
    pub fn new() -> Self {
        Self {
            config: HubConfig::default(),
            registry_store: None,
            thread_repository: None,
            checkpoint_store: None,
            work_queue: None,
            summarizer: None,
            health_probe: None,
            handlers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_registry_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.registry_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_thread_repository(mut self, repo: Arc<dyn ThreadRepository>) -> Self {
        self.thread_repository = Some(repo);
        self
    }

    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_work_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.work_queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    #[must_use]
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Wire everything together. Handler registration happens here, so
    /// duplicate handlers fail the build rather than the first route.
    pub async fn build(self) -> Result<Hub, HubBuildError> {
        if self.config.pool_size == 0 {
            return Err(HubBuildError::Config("pool_size must be at least 1".into()));
        }

        let bus = EventBus::new(self.config.event_buffer);
        let shutdown = CancellationToken::new();

        let registry = Arc::new(AgentRegistry::new(
            self.registry_store
                .unwrap_or_else(|| Arc::new(MemoryRegistryStore::new())),
            bus.clone(),
            RegistryConfig {
                max_agents_per_system: self.config.max_agents_per_system,
                unhealthy_threshold: self.config.unhealthy_threshold,
                ..Default::default()
            },
        ));
        let threads = Arc::new(ThreadService::new(
            self.thread_repository
                .unwrap_or_else(|| Arc::new(MemoryThreadRepository::new())),
            self.summarizer
                .unwrap_or_else(|| Arc::new(TruncatingSummarizer::default())),
            ThreadConfig::default(),
        ));
        let handlers = Arc::new(HandlerRegistry::new(RouterConfig {
            min_confidence: self.config.min_routing_confidence,
            capability_routing: true,
        }));
        for handler in self.handlers {
            handlers.register(handler).await?;
        }
        let interrupts = Arc::new(InterruptService::new(bus.clone()));
        let checkpoints = self
            .checkpoint_store
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));
        let queue: Option<Arc<dyn WorkQueue>> = if self.config.distributed {
            Some(
                self.work_queue
                    .unwrap_or_else(|| Arc::new(MemoryWorkQueue::new())),
            )
        } else {
            self.work_queue
        };

        let executor = Arc::new(RunExecutor::new(
            ExecutorConfig {
                pool_size: self.config.pool_size,
                checkpoint_interval: self.config.checkpoint_interval(),
                max_timeout: std::time::Duration::from_millis(self.config.max_timeout_ms),
                default_timeout: std::time::Duration::from_millis(self.config.default_timeout_ms),
                retry: RetryPolicy {
                    max_attempts: self.config.max_retry_attempts,
                    ..Default::default()
                },
                distributed: self.config.distributed,
                ..Default::default()
            },
            registry.clone(),
            threads.clone(),
            handlers.clone(),
            interrupts.clone(),
            checkpoints,
            queue,
            bus.clone(),
            shutdown.clone(),
        ));

        Ok(Hub {
            config: self.config,
            bus,
            registry,
            threads,
            handlers,
            interrupts,
            executor,
            health_probe: self
                .health_probe
                .unwrap_or_else(|| Arc::new(AlwaysHealthyProbe)),
            shutdown,
        })
    }
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled hub. Owns every service and the shutdown token.
pub struct Hub {
    config: HubConfig,
    bus: EventBus,
    registry: Arc<AgentRegistry>,
    threads: Arc<ThreadService>,
    handlers: Arc<HandlerRegistry>,
    interrupts: Arc<InterruptService>,
    executor: Arc<RunExecutor>,
    health_probe: Arc<dyn HealthProbe>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").finish_non_exhaustive()
    }
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    /// Start background machinery: worker pool, health prober, interrupt
    /// sweeper. Then warm the registry cache and recover checkpointed runs.
    pub async fn start(&self) -> Result<(), HubError> {
        self.executor.start();
        HealthProber::new(
            self.registry.clone(),
            self.health_probe.clone(),
            self.config.health_check_interval(),
            self.shutdown.clone(),
        )
        .spawn();
        InterruptSweeper::new(
            self.interrupts.clone(),
            self.config.interrupt_sweep_interval(),
            self.shutdown.clone(),
        )
        .spawn();

        self.registry.warm().await.map_err(HubError::from)?;
        let recovered = self.executor.recover().await?;
        if !recovered.is_empty() {
            info!(runs = recovered.len(), "recovered checkpointed runs");
        }
        Ok(())
    }

    /// Cancel all background tasks and wait for workers to drain.
    pub async fn shutdown(&self) {
        info!("hub shutting down");
        self.executor.stop().await;
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn threads(&self) -> &Arc<ThreadService> {
        &self.threads
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn interrupts(&self) -> &Arc<InterruptService> {
        &self.interrupts
    }

    pub fn executor(&self) -> &Arc<RunExecutor> {
        &self.executor
    }
}
