//! Step handler registry and router.
//!
//! Routing proceeds in phases: an explicit `operation` field wins outright;
//! otherwise the input shape is pattern-matched to an operation; candidates
//! are filtered by agent capabilities and the winner is picked by priority,
//! then version, then name. Confidence below the configured floor routes to
//! nothing.

mod pattern;

use std::collections::HashMap;
use std::sync::Arc;

use caphub_contract::agent::Agent;
use caphub_contract::error::HubError;
use caphub_contract::handler::{HandlerMetadata, Operation, StepHandler};
use caphub_contract::run::RunInput;
use tokio::sync::RwLock;
use tracing::debug;

pub use pattern::{detect_operation, DetectedOperation};

/// Handler registry errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerRegistryError {
    #[error("handler {name}@{version} already registered")]
    Conflict { name: String, version: String },

    #[error("invalid handler metadata: {0}")]
    Validation(String),
}

impl From<HandlerRegistryError> for HubError {
    fn from(err: HandlerRegistryError) -> Self {
        match &err {
            HandlerRegistryError::Conflict { .. } => HubError::conflict(err.to_string()),
            HandlerRegistryError::Validation(msg) => HubError::validation(msg.clone()),
        }
    }
}

/// Which routing phase selected the handler. Recorded for observability;
/// never used for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// The input carried an explicit `operation`.
    Explicit,
    /// The operation was inferred from the input shape.
    Pattern,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::Explicit => "explicit",
            RouteReason::Pattern => "pattern",
        }
    }
}

/// The routing verdict.
#[derive(Clone)]
pub struct RouteDecision {
    pub handler: Arc<dyn StepHandler>,
    pub metadata: HandlerMetadata,
    pub operation: Operation,
    /// Confidence in [0,1] that the chosen operation matches the input.
    pub confidence: f64,
    /// Human-readable record of which phase selected the handler.
    pub reason: String,
}

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Verdicts below this confidence route to nothing.
    pub min_confidence: f64,
    /// When enabled, handlers whose required capabilities the agent lacks
    /// are dropped from the candidate set.
    pub capability_routing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            capability_routing: true,
        }
    }
}

struct Registered {
    metadata: HandlerMetadata,
    handler: Arc<dyn StepHandler>,
}

/// Catalog of step handlers plus the routing logic over it.
pub struct HandlerRegistry {
    config: RouterConfig,
    handlers: RwLock<HashMap<Operation, Vec<Registered>>>,
}

impl HandlerRegistry {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a handler. Duplicate name + version is rejected.
    pub async fn register(&self, handler: Arc<dyn StepHandler>) -> Result<(), HandlerRegistryError> {
        let metadata = handler.metadata();
        if metadata.name.trim().is_empty() {
            return Err(HandlerRegistryError::Validation("empty handler name".into()));
        }
        let mut handlers = self.handlers.write().await;
        let for_operation = handlers.entry(metadata.operation).or_default();
        if for_operation
            .iter()
            .any(|r| r.metadata.name == metadata.name && r.metadata.version == metadata.version)
        {
            return Err(HandlerRegistryError::Conflict {
                name: metadata.name,
                version: metadata.version.to_string(),
            });
        }
        debug!(name = %metadata.name, operation = %metadata.operation, "handler registered");
        for_operation.push(Registered { metadata, handler });
        Ok(())
    }

    /// Number of registered handlers.
    pub async fn len(&self) -> usize {
        let handlers = self.handlers.read().await;
        handlers.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All registered handler metadata, sorted by operation then name.
    pub async fn list(&self) -> Vec<HandlerMetadata> {
        let handlers = self.handlers.read().await;
        let mut all: Vec<HandlerMetadata> = handlers
            .values()
            .flat_map(|v| v.iter().map(|r| r.metadata.clone()))
            .collect();
        all.sort_by(|a, b| {
            a.operation
                .to_string()
                .cmp(&b.operation.to_string())
                .then(a.name.cmp(&b.name))
        });
        all
    }

    /// Route an input for an agent. Returns `None` when no handler clears
    /// the confidence floor.
    pub async fn route(&self, input: &RunInput, agent: &Agent) -> Option<RouteDecision> {
        // Phase 1: explicit operation, or pattern detection on the shape.
        let (operation, confidence, reason) = match input.operation {
            Some(operation) => (operation, 1.0, RouteReason::Explicit),
            None => {
                let detected = pattern::detect_operation(&input.context)?;
                (detected.operation, detected.confidence, RouteReason::Pattern)
            }
        };
        if confidence < self.config.min_confidence {
            return None;
        }

        let handlers = self.handlers.read().await;
        let candidates = handlers.get(&operation)?;

        // Phase 2: capability filter.
        let surface = agent.capabilities.surface();
        let eligible: Vec<&Registered> = candidates
            .iter()
            .filter(|r| {
                !self.config.capability_routing
                    || r.metadata
                        .required_capabilities
                        .iter()
                        .all(|cap| surface.contains(cap.as_str()))
            })
            .collect();

        // Phase 3: max priority, ties broken by higher version then name.
        let winner = eligible.into_iter().max_by(|a, b| {
            a.metadata
                .priority
                .cmp(&b.metadata.priority)
                .then(a.metadata.version.cmp(&b.metadata.version))
                .then(b.metadata.name.cmp(&a.metadata.name))
        })?;

        debug!(
            handler = %winner.metadata.name,
            operation = %operation,
            confidence,
            reason = reason.as_str(),
            "input routed"
        );
        Some(RouteDecision {
            handler: winner.handler.clone(),
            metadata: winner.metadata.clone(),
            operation,
            confidence,
            reason: format!(
                "{}: {} -> {}@{}",
                reason.as_str(),
                operation,
                winner.metadata.name,
                winner.metadata.version
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use caphub_contract::agent::{AgentSpec, AgentVersion};
    use caphub_contract::handler::{HandlerInput, HandlerOutput, StepContext, StepError};
    use serde_json::{json, Value};

    struct FixedHandler {
        metadata: HandlerMetadata,
    }

    impl FixedHandler {
        fn boxed(name: &str, version: AgentVersion, operation: Operation, priority: i32) -> Arc<dyn StepHandler> {
            Arc::new(Self {
                metadata: HandlerMetadata::new(name, version, operation).with_priority(priority),
            })
        }
    }

    #[async_trait]
    impl StepHandler for FixedHandler {
        fn metadata(&self) -> HandlerMetadata {
            self.metadata.clone()
        }

        async fn execute(
            &self,
            _ctx: &dyn StepContext,
            _input: HandlerInput,
        ) -> Result<HandlerOutput, StepError> {
            Ok(HandlerOutput::text("ok"))
        }
    }

    fn agent() -> Agent {
        AgentSpec::new("a-1", AgentVersion::new(1, 0, 0)).into_agent()
    }

    fn rag_input(context: Value) -> RunInput {
        let mut input = RunInput::new("a-1");
        input.context = context.as_object().cloned().unwrap_or_default();
        input
    }

    #[tokio::test]
    async fn test_duplicate_name_version_rejected() {
        let registry = HandlerRegistry::new(RouterConfig::default());
        registry
            .register(FixedHandler::boxed("h", AgentVersion::new(1, 0, 0), Operation::Rag, 0))
            .await
            .unwrap();
        let err = registry
            .register(FixedHandler::boxed("h", AgentVersion::new(1, 0, 0), Operation::Rag, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerRegistryError::Conflict { .. }));

        // Same name at a new version is fine.
        registry
            .register(FixedHandler::boxed("h", AgentVersion::new(1, 1, 0), Operation::Rag, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_priority_precedence() {
        let registry = HandlerRegistry::new(RouterConfig::default());
        registry
            .register(FixedHandler::boxed("low", AgentVersion::new(1, 0, 0), Operation::Rag, 50))
            .await
            .unwrap();
        registry
            .register(FixedHandler::boxed("high", AgentVersion::new(1, 0, 0), Operation::Rag, 100))
            .await
            .unwrap();

        // Pattern-detected rag: query + context_ids.
        let input = rag_input(json!({"query": "x", "context_ids": ["a"]}));
        let decision = registry.route(&input, &agent()).await.unwrap();
        assert_eq!(decision.metadata.name, "high");
        assert!(decision.reason.starts_with("pattern"));
        assert!((decision.confidence - 0.90).abs() < f64::EPSILON);

        // Explicit operation records the explicit phase at confidence 1.0.
        let input = rag_input(json!({"query": "x"})).with_operation(Operation::Rag);
        let decision = registry.route(&input, &agent()).await.unwrap();
        assert_eq!(decision.metadata.name, "high");
        assert!(decision.reason.starts_with("explicit"));
        assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_version_breaks_priority_tie() {
        let registry = HandlerRegistry::new(RouterConfig::default());
        registry
            .register(FixedHandler::boxed("h", AgentVersion::new(1, 0, 0), Operation::Generic, 10))
            .await
            .unwrap();
        registry
            .register(FixedHandler::boxed("h", AgentVersion::new(2, 0, 0), Operation::Generic, 10))
            .await
            .unwrap();

        let input = RunInput::new("a-1").with_operation(Operation::Generic);
        let decision = registry.route(&input, &agent()).await.unwrap();
        assert_eq!(decision.metadata.version, AgentVersion::new(2, 0, 0));
    }

    #[tokio::test]
    async fn test_capability_filter_drops_candidates() {
        let registry = HandlerRegistry::new(RouterConfig::default());
        let needs_search = Arc::new(FixedHandler {
            metadata: HandlerMetadata::new("needs-search", AgentVersion::new(1, 0, 0), Operation::Rag)
                .with_priority(100)
                .with_required_capabilities(vec!["search".into()]),
        });
        registry.register(needs_search).await.unwrap();
        registry
            .register(FixedHandler::boxed("plain", AgentVersion::new(1, 0, 0), Operation::Rag, 1))
            .await
            .unwrap();

        // Agent without the search tool: the higher-priority candidate is dropped.
        let input = rag_input(json!({"query": "x"})).with_operation(Operation::Rag);
        let decision = registry.route(&input, &agent()).await.unwrap();
        assert_eq!(decision.metadata.name, "plain");

        // With the tool, the filtered candidate wins on priority.
        let mut capable = agent();
        capable.capabilities.tools.insert("search".into());
        let decision = registry.route(&input, &capable).await.unwrap();
        assert_eq!(decision.metadata.name, "needs-search");
    }

    #[tokio::test]
    async fn test_low_confidence_routes_to_none() {
        let registry = HandlerRegistry::new(RouterConfig {
            min_confidence: 0.7,
            capability_routing: true,
        });
        registry
            .register(FixedHandler::boxed("g", AgentVersion::new(1, 0, 0), Operation::Rag, 0))
            .await
            .unwrap();

        // `query` alone detects rag at 0.60, below the 0.7 floor.
        let input = rag_input(json!({"query": "x"}));
        assert!(registry.route(&input, &agent()).await.is_none());
    }

    #[tokio::test]
    async fn test_no_handler_for_operation() {
        let registry = HandlerRegistry::new(RouterConfig::default());
        let input = RunInput::new("a-1").with_operation(Operation::Extraction);
        assert!(registry.route(&input, &agent()).await.is_none());
    }
}
