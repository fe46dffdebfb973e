//! Hub configuration, loadable from the environment.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

/// Top-level tunables for a hub instance.
///
/// Every field maps to a `CAPHUB_*` environment variable; secrets for
/// upstream services are opaque to the core and never read here.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Executor worker-pool size. `CAPHUB_POOL_SIZE`
    pub pool_size: usize,
    /// Checkpoint cadence. `CAPHUB_CHECKPOINT_INTERVAL_MS`
    pub checkpoint_interval_ms: u64,
    /// Fallback run deadline when neither caller nor agent set one.
    /// `CAPHUB_DEFAULT_TIMEOUT_MS`
    pub default_timeout_ms: u64,
    /// Process-wide deadline ceiling. `CAPHUB_MAX_TIMEOUT_MS`
    pub max_timeout_ms: u64,
    /// Health probe cadence. `CAPHUB_HEALTH_CHECK_INTERVAL_MS`
    pub health_check_interval_ms: u64,
    /// Consecutive probe failures before unhealthy. `CAPHUB_UNHEALTHY_THRESHOLD`
    pub unhealthy_threshold: u32,
    /// Routing confidence floor. `CAPHUB_MIN_ROUTING_CONFIDENCE`
    pub min_routing_confidence: f64,
    /// Registration cap per system namespace. `CAPHUB_MAX_AGENTS_PER_SYSTEM`
    pub max_agents_per_system: usize,
    /// Dispatch through the distributed work queue. `CAPHUB_DISTRIBUTED`
    pub distributed: bool,
    /// Distributed queue endpoint, opaque to the core. `CAPHUB_QUEUE_ENDPOINT`
    pub queue_endpoint: Option<String>,
    /// Backing store endpoint, opaque to the core. `CAPHUB_STORE_ENDPOINT`
    pub store_endpoint: Option<String>,
    /// Event-bus buffer per subscriber. `CAPHUB_EVENT_BUFFER`
    pub event_buffer: usize,
    /// Interrupt expiry sweep cadence. `CAPHUB_INTERRUPT_SWEEP_INTERVAL_MS`
    pub interrupt_sweep_interval_ms: u64,
    /// Retry attempts for retryable handler errors. `CAPHUB_MAX_RETRY_ATTEMPTS`
    pub max_retry_attempts: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            checkpoint_interval_ms: 10_000,
            default_timeout_ms: 120_000,
            max_timeout_ms: 600_000,
            health_check_interval_ms: 30_000,
            unhealthy_threshold: 3,
            min_routing_confidence: 0.5,
            max_agents_per_system: 100,
            distributed: false,
            queue_endpoint: None,
            store_endpoint: None,
            event_buffer: 1024,
            interrupt_sweep_interval_ms: 1_000,
            max_retry_attempts: 3,
        }
    }
}

impl HubConfig {
    /// Read configuration from `CAPHUB_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pool_size: env_parse("CAPHUB_POOL_SIZE", defaults.pool_size),
            checkpoint_interval_ms: env_parse(
                "CAPHUB_CHECKPOINT_INTERVAL_MS",
                defaults.checkpoint_interval_ms,
            ),
            default_timeout_ms: env_parse("CAPHUB_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms),
            max_timeout_ms: env_parse("CAPHUB_MAX_TIMEOUT_MS", defaults.max_timeout_ms),
            health_check_interval_ms: env_parse(
                "CAPHUB_HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval_ms,
            ),
            unhealthy_threshold: env_parse("CAPHUB_UNHEALTHY_THRESHOLD", defaults.unhealthy_threshold),
            min_routing_confidence: env_parse(
                "CAPHUB_MIN_ROUTING_CONFIDENCE",
                defaults.min_routing_confidence,
            ),
            max_agents_per_system: env_parse(
                "CAPHUB_MAX_AGENTS_PER_SYSTEM",
                defaults.max_agents_per_system,
            ),
            distributed: env_parse("CAPHUB_DISTRIBUTED", defaults.distributed),
            queue_endpoint: std::env::var("CAPHUB_QUEUE_ENDPOINT").ok(),
            store_endpoint: std::env::var("CAPHUB_STORE_ENDPOINT").ok(),
            event_buffer: env_parse("CAPHUB_EVENT_BUFFER", defaults.event_buffer),
            interrupt_sweep_interval_ms: env_parse(
                "CAPHUB_INTERRUPT_SWEEP_INTERVAL_MS",
                defaults.interrupt_sweep_interval_ms,
            ),
            max_retry_attempts: env_parse("CAPHUB_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts),
        }
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn interrupt_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.interrupt_sweep_interval_ms)
    }
}
