//! Agent records: the authoritative capability surface of the registry.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::time::current_unix_millis;

/// Agent version: major/minor/patch with optional pre-release and build tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AgentVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre_release: Option<String>,
    pub build: Option<String>,
}

impl AgentVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
            build: None,
        }
    }
}

impl PartialOrd for AgentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Build metadata is ignored for ordering; a pre-release sorts below
        // the matching release.
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(_), None) => std::cmp::Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.pre_release {
            write!(f, "-{pre}")?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

/// Error parsing an [`AgentVersion`] string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version: {0}")]
pub struct VersionParseError(pub String);

impl FromStr for AgentVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (core, build) = match s.split_once('+') {
            Some((c, b)) => (c, Some(b.to_string())),
            None => (s, None),
        };
        let (core, pre_release) = match core.split_once('-') {
            Some((c, p)) => (c, Some(p.to_string())),
            None => (core, None),
        };
        let mut parts = core.splitn(3, '.');
        let mut next = |name: &str| {
            parts
                .next()
                .ok_or_else(|| VersionParseError(format!("{s}: missing {name}")))?
                .parse::<u64>()
                .map_err(|_| VersionParseError(s.to_string()))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Self {
            major,
            minor,
            patch,
            pre_release,
            build,
        })
    }
}

impl Serialize for AgentVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Administrative agent status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
    Maintenance,
}

/// Agent lifecycle state.
///
/// Advances monotonically within a cohort:
/// registered → initializing → ready → {idle ↔ running ↔ waiting} → draining → stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Registered,
    Initializing,
    Ready,
    Idle,
    Running,
    Waiting,
    Interrupted,
    Draining,
    Stopped,
    Error,
    Failed,
    Maintenance,
}

impl LifecycleState {
    /// States in which a run may be dispatched to the agent.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::Idle | LifecycleState::Running
        )
    }

    /// Cohort rank used for the monotonic-advance check. States within the
    /// active cohort (idle/running/waiting/interrupted) may cycle freely.
    fn cohort(&self) -> u8 {
        match self {
            LifecycleState::Registered => 0,
            LifecycleState::Initializing => 1,
            LifecycleState::Ready => 2,
            LifecycleState::Idle
            | LifecycleState::Running
            | LifecycleState::Waiting
            | LifecycleState::Interrupted => 3,
            LifecycleState::Draining => 4,
            LifecycleState::Stopped => 5,
            // Error/failed/maintenance are reachable from anywhere.
            LifecycleState::Error | LifecycleState::Failed | LifecycleState::Maintenance => 6,
        }
    }

    /// Whether transitioning to `next` honors the monotonic cohort order.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        if matches!(self, LifecycleState::Stopped | LifecycleState::Failed) {
            return false;
        }
        // Maintenance may return to ready.
        if *self == LifecycleState::Maintenance {
            return matches!(
                next,
                LifecycleState::Ready | LifecycleState::Stopped | LifecycleState::Failed
            );
        }
        if matches!(
            next,
            LifecycleState::Error | LifecycleState::Failed | LifecycleState::Maintenance
        ) {
            return true;
        }
        let (from, to) = (self.cohort(), next.cohort());
        if from == 3 && to == 3 {
            return true;
        }
        to == from + 1 || (from == 2 && to == 3)
    }
}

/// What an agent can do: domains, permitted skill actions, tool names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub domains: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub actions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tools: BTreeSet<String>,
    #[serde(default)]
    pub parallel_tool_calls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u64>,
}

impl Capabilities {
    /// Union of tools and actions, used by capability routing.
    pub fn surface(&self) -> BTreeSet<&str> {
        self.tools
            .iter()
            .chain(self.actions.iter())
            .map(String::as_str)
            .collect()
    }
}

fn default_max_concurrent_runs() -> u32 {
    4
}

fn default_timeout_ms() -> u64 {
    120_000
}

/// Feature flags and execution limits advertised by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExtensions {
    #[serde(default)]
    pub supports_threads: bool,
    #[serde(default)]
    pub supports_interrupts: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub requires_approval: bool,
    /// What happens when an interrupt expires: fail the run, or continue
    /// with a null response.
    #[serde(default)]
    pub interrupt_expiry_policy: InterruptExpiryPolicy,
}

impl Default for AgentExtensions {
    fn default() -> Self {
        Self {
            supports_threads: false,
            supports_interrupts: false,
            supports_streaming: false,
            max_concurrent_runs: default_max_concurrent_runs(),
            default_timeout_ms: default_timeout_ms(),
            requires_approval: false,
            interrupt_expiry_policy: InterruptExpiryPolicy::default(),
        }
    }
}

/// Agent policy applied when an owning interrupt expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptExpiryPolicy {
    /// The run fails with `CAP_INTERRUPT_EXPIRED`.
    #[default]
    FailRun,
    /// The run resumes with a null response.
    ContinueWithout,
}

/// Composite health verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

/// One component-level health check inside a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub component: String,
    pub passed: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Most recent aggregated health snapshot for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub avg_latency_ms: f64,
    /// Success rate over the rolling probe window, in [0,1].
    pub success_rate: f64,
    pub active_runs: u32,
    pub queued_runs: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<ComponentCheck>,
    pub consecutive_failures: u32,
    pub checked_at: u64,
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub version: AgentVersion,
    /// Owning system/namespace, used for discovery filters and per-system caps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Free-form agent type tag (`llm`, `tool`, `composite`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub extensions: AgentExtensions,
    /// Discovery tiebreaker, higher first.
    #[serde(default)]
    pub routing_weight: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Agent {
    /// Whether the registry may dispatch a new run to this agent, ignoring
    /// the concurrency limit (checked separately against live slot counts).
    pub fn is_dispatchable(&self) -> bool {
        self.status == AgentStatus::Active && self.lifecycle_state.is_dispatchable()
    }
}

/// Registration payload for a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    pub version: AgentVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub extensions: AgentExtensions,
    #[serde(default)]
    pub routing_weight: i64,
}

impl AgentSpec {
    pub fn new(agent_id: impl Into<String>, version: AgentVersion) -> Self {
        Self {
            agent_id: agent_id.into(),
            version,
            system: None,
            agent_type: None,
            capabilities: Capabilities::default(),
            extensions: AgentExtensions::default(),
            routing_weight: 0,
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    #[must_use]
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: AgentExtensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Materialize a fresh [`Agent`] record from this spec.
    pub fn into_agent(self) -> Agent {
        let now = current_unix_millis();
        Agent {
            agent_id: self.agent_id,
            version: self.version,
            system: self.system,
            agent_type: self.agent_type,
            status: AgentStatus::Active,
            lifecycle_state: LifecycleState::Registered,
            capabilities: self.capabilities,
            extensions: self.extensions,
            routing_weight: self.routing_weight,
            health: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for an existing agent. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_state: Option<LifecycleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<AgentExtensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_weight: Option<i64>,
}

/// Discovery filter. All present criteria must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    /// Require membership in this domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Require this tool to be present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_threads: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_interrupts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl DiscoveryCriteria {
    pub fn matches(&self, agent: &Agent) -> bool {
        if let Some(ref system) = self.system {
            if agent.system.as_deref() != Some(system.as_str()) {
                return false;
            }
        }
        if let Some(ref agent_type) = self.agent_type {
            if agent.agent_type.as_deref() != Some(agent_type.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if agent.status != status {
                return false;
            }
        }
        if let Some(ref domain) = self.domain {
            if !agent.capabilities.domains.contains(domain) {
                return false;
            }
        }
        if let Some(ref tool) = self.tool {
            if !agent.capabilities.tools.contains(tool) {
                return false;
            }
        }
        if let Some(flag) = self.supports_threads {
            if agent.extensions.supports_threads != flag {
                return false;
            }
        }
        if let Some(flag) = self.supports_interrupts {
            if agent.extensions.supports_interrupts != flag {
                return false;
            }
        }
        if let Some(flag) = self.supports_streaming {
            if agent.extensions.supports_streaming != flag {
                return false;
            }
        }
        true
    }
}
