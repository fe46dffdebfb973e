use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caphub_contract::agent::{AgentExtensions, AgentSpec, AgentVersion, InterruptExpiryPolicy};
use caphub_contract::bus::EventBus;
use caphub_contract::error::ErrorCode;
use caphub_contract::handler::{
    HandlerInput, HandlerMetadata, HandlerOutput, InterruptRequest, Operation, StepContext,
    StepError,
};
use caphub_contract::interrupt::{
    InterruptFilter, InterruptPayload, InterruptResponse, InterruptStatus, InterruptType,
};
use caphub_contract::run::{
    ParallelPolicy, RunInput, RunOptions, RunStatus, Step, StepType, TokenUsage,
};
use caphub_contract::thread::Message;
use caphub_contract::HubError;
use caphub_executor::{run_parallel_step, ExecutorConfig, ParallelChild, RunExecutor};
use caphub_interrupt::{InterruptService, InterruptSweeper};
use caphub_registry::{AgentRegistry, RegistryConfig};
use caphub_router::{HandlerRegistry, RouterConfig};
use caphub_store_adapters::{
    MemoryCheckpointStore, MemoryRegistryStore, MemoryThreadRepository,
};
use caphub_threads::{ThreadConfig, ThreadService, TruncatingSummarizer};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Harness {
    registry: Arc<AgentRegistry>,
    threads: Arc<ThreadService>,
    handlers: Arc<HandlerRegistry>,
    interrupts: Arc<InterruptService>,
    checkpoints: Arc<MemoryCheckpointStore>,
    bus: EventBus,
    executor: Arc<RunExecutor>,
    shutdown: CancellationToken,
}

async fn harness_with(config: ExecutorConfig, checkpoints: Arc<MemoryCheckpointStore>) -> Harness {
    let bus = EventBus::new(256);
    let shutdown = CancellationToken::new();
    let registry = Arc::new(AgentRegistry::new(
        Arc::new(MemoryRegistryStore::new()),
        bus.clone(),
        RegistryConfig::default(),
    ));
    let threads = Arc::new(ThreadService::new(
        Arc::new(MemoryThreadRepository::new()),
        Arc::new(TruncatingSummarizer::default()),
        ThreadConfig::default(),
    ));
    let handlers = Arc::new(HandlerRegistry::new(RouterConfig::default()));
    let interrupts = Arc::new(InterruptService::new(bus.clone()));
    let executor = Arc::new(RunExecutor::new(
        config,
        registry.clone(),
        threads.clone(),
        handlers.clone(),
        interrupts.clone(),
        checkpoints.clone(),
        None,
        bus.clone(),
        shutdown.clone(),
    ));
    executor.start();
    InterruptSweeper::new(interrupts.clone(), Duration::from_millis(20), shutdown.clone()).spawn();
    Harness {
        registry,
        threads,
        handlers,
        interrupts,
        checkpoints,
        bus,
        executor,
        shutdown,
    }
}

async fn harness() -> Harness {
    harness_with(
        ExecutorConfig::default(),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await
}

impl Harness {
    async fn register_agent(&self, agent_id: &str, extensions: AgentExtensions) {
        self.registry
            .register(AgentSpec::new(agent_id, AgentVersion::new(1, 0, 0)).with_extensions(extensions))
            .await
            .unwrap();
    }

    async fn teardown(self) {
        self.shutdown.cancel();
    }
}

/// Poll a condition until it holds or two seconds elapse.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ---------------------------------------------------------------------------
// Test handlers
// ---------------------------------------------------------------------------

/// Completes with a fixed response after recording one llm_call step.
struct EchoHandler;

#[async_trait]
impl caphub_contract::StepHandler for EchoHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("echo", AgentVersion::new(1, 0, 0), Operation::Generic)
    }

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        let step_id = ctx
            .add_step(Step::new(
                StepType::LlmCall,
                "respond",
                json!({ "messages": input.messages.len() }),
            ))
            .await?;
        ctx.update_token_usage(TokenUsage::new(10, 5)).await?;
        ctx.complete_step(&step_id, json!({ "text": "echo" })).await?;
        Ok(HandlerOutput::text(format!(
            "echo:{} messages",
            input.messages.len()
        )))
    }
}

/// Waits for the gate to open, then completes.
struct GatedHandler {
    gate: tokio::sync::watch::Receiver<bool>,
}

#[async_trait]
impl caphub_contract::StepHandler for GatedHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("gated", AgentVersion::new(1, 0, 0), Operation::Generic)
    }

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        _input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        let mut gate = self.gate.clone();
        loop {
            if *gate.borrow() {
                break;
            }
            if ctx.is_cancelled() {
                return Err(StepError(HubError::run_cancelled(ctx.run_id())));
            }
            if gate.changed().await.is_err() {
                break;
            }
        }
        Ok(HandlerOutput::text("done"))
    }
}

/// Blocks on never-resolving I/O and ignores cancellation.
struct HangingHandler;

#[async_trait]
impl caphub_contract::StepHandler for HangingHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("hang", AgentVersion::new(1, 0, 0), Operation::Generic)
    }

    async fn execute(
        &self,
        _ctx: &dyn StepContext,
        _input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        futures::future::pending::<()>().await;
        unreachable!()
    }
}

/// Suspends on an approval interrupt, then records the decision as a step.
struct ApprovalHandler {
    interrupt_timeout_ms: u64,
}

#[async_trait]
impl caphub_contract::StepHandler for ApprovalHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("approval", AgentVersion::new(1, 0, 0), Operation::Generic)
    }

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        _input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        let response = ctx
            .interrupt(InterruptRequest::new(
                InterruptType::ApprovalRequired,
                InterruptPayload::new("approve the action?").with_proposed_action("do-it"),
                self.interrupt_timeout_ms,
            ))
            .await?;

        let step_id = ctx
            .add_step(Step::new(
                StepType::Decision,
                "apply-approval",
                json!({ "approval": response.value }),
            ))
            .await?;
        ctx.complete_step(&step_id, json!({ "applied": true })).await?;
        Ok(HandlerOutput::text(format!(
            "approved={}",
            response.approved()
        )))
    }
}

/// Two sequential steps with replay-aware execution and side-effect counters.
struct TwoStepHandler {
    step_one_runs: Arc<AtomicUsize>,
    step_two_runs: Arc<AtomicUsize>,
}

#[async_trait]
impl caphub_contract::StepHandler for TwoStepHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("two-step", AgentVersion::new(1, 0, 0), Operation::Generic)
    }

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        _input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        let first = match ctx.completed_step_output("step-one").await {
            Some(output) => output,
            None => {
                self.step_one_runs.fetch_add(1, Ordering::SeqCst);
                let step_id = ctx
                    .add_step(Step::new(StepType::ToolCall, "step-one", json!({})))
                    .await?;
                let output = json!({ "value": 21 });
                ctx.complete_step(&step_id, output.clone()).await?;
                output
            }
        };

        let second = match ctx.completed_step_output("step-two").await {
            Some(output) => output,
            None => {
                self.step_two_runs.fetch_add(1, Ordering::SeqCst);
                let step_id = ctx
                    .add_step(Step::new(StepType::ToolCall, "step-two", first.clone()))
                    .await?;
                let doubled = first["value"].as_u64().unwrap_or(0) * 2;
                let output = json!({ "value": doubled });
                ctx.complete_step(&step_id, output.clone()).await?;
                output
            }
        };

        Ok(HandlerOutput::text(format!("result={}", second["value"])))
    }
}

/// Fans out two parallel children, one of which fails.
struct ParallelHandler {
    policy: ParallelPolicy,
}

#[async_trait]
impl caphub_contract::StepHandler for ParallelHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("fanout", AgentVersion::new(1, 0, 0), Operation::Generic)
    }

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        _input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        let children = vec![
            ParallelChild::new(
                "ok-child",
                StepType::ToolCall,
                json!({}),
                Box::pin(async { Ok(json!({ "n": 1 })) }),
            ),
            ParallelChild::new(
                "bad-child",
                StepType::ToolCall,
                json!({}),
                Box::pin(async { Err(HubError::execution_failed("child exploded")) }),
            ),
        ];
        let results = run_parallel_step(ctx, "fan-out", self.policy, children).await?;
        let survivors = results.iter().filter(|r| r.is_ok()).count();
        Ok(HandlerOutput::text(format!("survivors={survivors}")))
    }
}

/// Emits stream events before completing.
struct StreamingHandler;

#[async_trait]
impl caphub_contract::StepHandler for StreamingHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("streamer", AgentVersion::new(1, 0, 0), Operation::Generic)
    }

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        _input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        for delta in ["hel", "lo"] {
            ctx.emit(caphub_contract::StreamEvent::Token {
                delta: delta.to_string(),
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(HandlerOutput::text("hello"))
    }
}

fn generic_input(agent_id: &str) -> RunInput {
    RunInput::new(agent_id).with_operation(Operation::Generic)
}

// ---------------------------------------------------------------------------
// Boundary scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_healthy_dispatch_respects_concurrency_limit() {
    let h = harness().await;
    h.register_agent(
        "llm-agent",
        AgentExtensions {
            max_concurrent_runs: 2,
            ..Default::default()
        },
    )
    .await;
    let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);
    h.handlers
        .register(Arc::new(GatedHandler { gate: gate_rx }))
        .await
        .unwrap();

    let mut run_ids = Vec::new();
    for _ in 0..3 {
        let run = h.executor.submit(generic_input("llm-agent")).await.unwrap();
        run_ids.push(run.run_id);
    }

    // Two enter running; the third surfaces as queued until a slot frees.
    let executor = h.executor.clone();
    let ids = run_ids.clone();
    wait_until(|| {
        let executor = executor.clone();
        let ids = ids.clone();
        async move {
            let mut running = 0;
            let mut queued = 0;
            for id in &ids {
                match executor.get_run(id).await.unwrap().status {
                    RunStatus::Running => running += 1,
                    RunStatus::Queued => queued += 1,
                    _ => {}
                }
            }
            running == 2 && queued == 1
        }
    })
    .await;
    assert_eq!(h.registry.active_runs("llm-agent").await.unwrap(), 2);

    gate_tx.send(true).unwrap();
    for id in &run_ids {
        let run = h.executor.wait_terminal(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed, "run {id}");
    }
    // Slots release as workers finish tearing the runs down.
    let registry = h.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move { registry.active_runs("llm-agent").await.unwrap() == 0 }
    })
    .await;
    h.teardown().await;
}

#[tokio::test]
async fn test_timeout_force_terminates_unresponsive_handler() {
    let h = harness_with(
        ExecutorConfig {
            grace: Duration::from_millis(50),
            ..Default::default()
        },
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await;
    h.register_agent(
        "slow-agent",
        AgentExtensions {
            default_timeout_ms: 150,
            ..Default::default()
        },
    )
    .await;
    h.handlers.register(Arc::new(HangingHandler)).await.unwrap();

    let run = h.executor.submit(generic_input("slow-agent")).await.unwrap();
    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Timeout);
    assert_eq!(finished.error.unwrap().code, ErrorCode::CapRunTimeout);
    h.teardown().await;
}

#[tokio::test]
async fn test_interrupt_resolution_resumes_run() {
    let h = harness().await;
    h.register_agent(
        "hitl-agent",
        AgentExtensions {
            supports_interrupts: true,
            ..Default::default()
        },
    )
    .await;
    h.handlers
        .register(Arc::new(ApprovalHandler {
            interrupt_timeout_ms: 60_000,
        }))
        .await
        .unwrap();

    let mut sub = h.bus.subscribe();
    let run = h.executor.submit(generic_input("hitl-agent")).await.unwrap();

    // The run suspends and the interrupt event carries the record.
    let interrupt = loop {
        match sub.recv().await.unwrap() {
            caphub_contract::HubEvent::RunInterrupted { interrupt, .. } => break *interrupt,
            _ => continue,
        }
    };
    assert_eq!(
        h.executor.get_run(&run.run_id).await.unwrap().status,
        RunStatus::Interrupted
    );
    assert_eq!(interrupt.status, InterruptStatus::Pending);

    h.interrupts
        .resolve(
            &interrupt.interrupt_id,
            InterruptResponse::new(json!("approve")),
        )
        .await
        .unwrap();

    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.output.unwrap().response, "approved=true");
    // The decision step records the approval in its input.
    let decision = finished
        .steps
        .iter()
        .find(|s| s.name == "apply-approval")
        .unwrap();
    assert_eq!(decision.input["approval"], json!("approve"));
    h.teardown().await;
}

#[tokio::test]
async fn test_interrupt_expiry_fails_run() {
    let h = harness().await;
    h.register_agent(
        "hitl-agent",
        AgentExtensions {
            supports_interrupts: true,
            ..Default::default()
        },
    )
    .await;
    h.handlers
        .register(Arc::new(ApprovalHandler {
            interrupt_timeout_ms: 60,
        }))
        .await
        .unwrap();

    let run = h.executor.submit(generic_input("hitl-agent")).await.unwrap();
    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(
        finished.error.unwrap().code,
        ErrorCode::CapInterruptExpired
    );

    let interrupts = h
        .interrupts
        .list(&InterruptFilter {
            run_id: Some(run.run_id.clone()),
            ..Default::default()
        })
        .await;
    assert_eq!(interrupts[0].status, InterruptStatus::Expired);
    h.teardown().await;
}

#[tokio::test]
async fn test_interrupt_expiry_continue_without_policy() {
    let h = harness().await;
    h.register_agent(
        "lenient-agent",
        AgentExtensions {
            supports_interrupts: true,
            interrupt_expiry_policy: InterruptExpiryPolicy::ContinueWithout,
            ..Default::default()
        },
    )
    .await;
    h.handlers
        .register(Arc::new(ApprovalHandler {
            interrupt_timeout_ms: 60,
        }))
        .await
        .unwrap();

    let run = h.executor.submit(generic_input("lenient-agent")).await.unwrap();
    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
    // The run resumes with a null response instead of failing.
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.output.unwrap().response, "approved=false");
    h.teardown().await;
}

#[tokio::test]
async fn test_restart_recovery_skips_completed_steps() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    // Baseline: a clean run through both steps.
    let baseline_output;
    {
        let h = harness().await;
        h.register_agent("agent", AgentExtensions::default()).await;
        h.handlers
            .register(Arc::new(TwoStepHandler {
                step_one_runs: Arc::new(AtomicUsize::new(0)),
                step_two_runs: Arc::new(AtomicUsize::new(0)),
            }))
            .await
            .unwrap();
        let run = h.executor.submit(generic_input("agent")).await.unwrap();
        let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
        baseline_output = finished.output.unwrap().response;
        h.teardown().await;
    }

    // Simulate a worker crash after step-one: a checkpoint holding a running
    // run with one completed step, owned by no live worker.
    let crashed_run_id = {
        let mut crashed = caphub_contract::Run::new(generic_input("agent"));
        crashed.status = RunStatus::Running;
        crashed.started_at = Some(crashed.created_at);
        crashed.current_handler = Some("two-step".into());
        let mut step = Step::new(StepType::ToolCall, "step-one", json!({}));
        step.status = caphub_contract::StepStatus::Completed;
        step.output = json!({ "value": 21 });
        crashed.steps = vec![step];

        let run_id = crashed.run_id.clone();
        let blob = serde_json::to_vec(&caphub_executor::RunCheckpoint::of(crashed)).unwrap();
        use caphub_contract::storage::CheckpointStore;
        checkpoints
            .put(&caphub_executor::checkpoint_key(&run_id), blob)
            .await
            .unwrap();
        run_id
    };

    // Restart: the run resumes after the completed step; step-one is not
    // executed twice and the output matches the single-worker baseline.
    let h = harness_with(ExecutorConfig::default(), checkpoints).await;
    h.register_agent("agent", AgentExtensions::default()).await;
    let step_one_runs = Arc::new(AtomicUsize::new(0));
    let step_two_runs = Arc::new(AtomicUsize::new(0));
    h.handlers
        .register(Arc::new(TwoStepHandler {
            step_one_runs: step_one_runs.clone(),
            step_two_runs: step_two_runs.clone(),
        }))
        .await
        .unwrap();

    let resumed = h.executor.recover().await.unwrap();
    assert_eq!(resumed, vec![crashed_run_id.clone()]);

    let finished = h.executor.wait_terminal(&crashed_run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.output.unwrap().response, baseline_output);
    assert_eq!(step_one_runs.load(Ordering::SeqCst), 0, "step-one replayed");
    assert_eq!(step_two_runs.load(Ordering::SeqCst), 1);
    h.teardown().await;
}

// ---------------------------------------------------------------------------
// Additional executor behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancellation_is_idempotent_and_observable() {
    let h = harness().await;
    h.register_agent("agent", AgentExtensions::default()).await;
    let (_gate_tx, gate_rx) = tokio::sync::watch::channel(false);
    h.handlers
        .register(Arc::new(GatedHandler { gate: gate_rx }))
        .await
        .unwrap();

    let run = h.executor.submit(generic_input("agent")).await.unwrap();
    let executor = h.executor.clone();
    let id = run.run_id.clone();
    wait_until(|| {
        let executor = executor.clone();
        let id = id.clone();
        async move { executor.get_run(&id).await.unwrap().status == RunStatus::Running }
    })
    .await;

    let cancelled = h
        .executor
        .cancel(&run.run_id, Some("operator request".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(cancelled.error.as_ref().unwrap().code, ErrorCode::CapRunCancelled);

    // Cancelling a terminal run is a no-op returning the current state.
    let again = h.executor.cancel(&run.run_id, None).await.unwrap();
    assert_eq!(again.status, RunStatus::Cancelled);
    h.teardown().await;
}

#[tokio::test]
async fn test_cancel_resolves_owning_interrupt() {
    let h = harness().await;
    h.register_agent(
        "hitl-agent",
        AgentExtensions {
            supports_interrupts: true,
            ..Default::default()
        },
    )
    .await;
    h.handlers
        .register(Arc::new(ApprovalHandler {
            interrupt_timeout_ms: 60_000,
        }))
        .await
        .unwrap();

    let run = h.executor.submit(generic_input("hitl-agent")).await.unwrap();
    let executor = h.executor.clone();
    let id = run.run_id.clone();
    wait_until(|| {
        let executor = executor.clone();
        let id = id.clone();
        async move { executor.get_run(&id).await.unwrap().status == RunStatus::Interrupted }
    })
    .await;

    h.executor.cancel(&run.run_id, None).await.unwrap();
    let interrupts = h
        .interrupts
        .list(&InterruptFilter {
            run_id: Some(run.run_id.clone()),
            ..Default::default()
        })
        .await;
    assert_eq!(interrupts[0].status, InterruptStatus::Cancelled);
    h.teardown().await;
}

#[tokio::test]
async fn test_parallel_strict_fails_lenient_survives() {
    let h = harness().await;
    h.register_agent("strict-agent", AgentExtensions::default()).await;

    h.handlers
        .register(Arc::new(ParallelHandler {
            policy: ParallelPolicy::Strict,
        }))
        .await
        .unwrap();
    let run = h.executor.submit(generic_input("strict-agent")).await.unwrap();
    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    let parent = finished.steps.iter().find(|s| s.name == "fan-out").unwrap();
    assert_eq!(parent.status, caphub_contract::StepStatus::Failed);
    assert_eq!(parent.children.len(), 2);

    // Fresh hub with the lenient policy: the run completes with survivors.
    let h2 = harness().await;
    h2.register_agent("lenient-agent", AgentExtensions::default()).await;
    h2.handlers
        .register(Arc::new(ParallelHandler {
            policy: ParallelPolicy::Lenient,
        }))
        .await
        .unwrap();
    let run = h2
        .executor
        .submit(generic_input("lenient-agent"))
        .await
        .unwrap();
    let finished = h2.executor.wait_terminal(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.output.unwrap().response, "survivors=1");
    h.teardown().await;
    h2.teardown().await;
}

#[tokio::test]
async fn test_streaming_events_in_order() {
    let h = harness().await;
    h.register_agent(
        "streamer",
        AgentExtensions {
            supports_streaming: true,
            ..Default::default()
        },
    )
    .await;
    h.handlers.register(Arc::new(StreamingHandler)).await.unwrap();

    let mut sub = h.bus.subscribe();
    let input = generic_input("streamer").with_options(RunOptions {
        stream: true,
        ..Default::default()
    });
    let run = h.executor.submit(input).await.unwrap();

    let mut deltas = Vec::new();
    loop {
        match sub.recv().await.unwrap() {
            caphub_contract::HubEvent::Token { run_id, delta } if run_id == run.run_id => {
                deltas.push(delta);
            }
            event if event.is_terminal() => break,
            _ => continue,
        }
    }
    assert_eq!(deltas, vec!["hel".to_string(), "lo".to_string()]);

    let finished = h.executor.get_run(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    h.teardown().await;
}

#[tokio::test]
async fn test_no_handler_fails_with_execution_error() {
    let h = harness().await;
    h.register_agent("agent", AgentExtensions::default()).await;
    // No handler registered for the operation.
    let run = h
        .executor
        .submit(RunInput::new("agent").with_operation(Operation::Extraction))
        .await
        .unwrap();
    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(
        finished.error.unwrap().code,
        ErrorCode::CapRunExecutionFailed
    );
    h.teardown().await;
}

#[tokio::test]
async fn test_thread_context_materializes_messages() {
    let h = harness().await;
    h.register_agent(
        "threaded",
        AgentExtensions {
            supports_threads: true,
            ..Default::default()
        },
    )
    .await;
    h.handlers.register(Arc::new(EchoHandler)).await.unwrap();

    let thread = h
        .threads
        .create(
            "threaded",
            Default::default(),
            vec![Message::user("first"), Message::assistant("second")],
        )
        .await
        .unwrap();

    let input = RunInput::new("threaded")
        .with_thread(&thread.thread_id)
        .with_operation(Operation::Generic);
    let run = h.executor.submit(input).await.unwrap();
    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.output.unwrap().response, "echo:2 messages");
    assert_eq!(finished.thread_cursor, Some(1));
    assert_eq!(finished.usage.total_tokens, 15);
    h.teardown().await;
}

#[tokio::test]
async fn test_submit_validation_errors() {
    let h = harness().await;

    // Unknown agent.
    let err = h.executor.submit(generic_input("ghost")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::CapAgentNotFound);

    // Thread on an agent without thread support.
    h.register_agent("plain", AgentExtensions::default()).await;
    let err = h
        .executor
        .submit(generic_input("plain").with_thread("thr_x"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidInput);

    // Closed threads reject runs with the taxonomy code.
    h.register_agent(
        "threaded",
        AgentExtensions {
            supports_threads: true,
            ..Default::default()
        },
    )
    .await;
    let thread = h
        .threads
        .create("threaded", Default::default(), vec![])
        .await
        .unwrap();
    h.threads.close(&thread.thread_id, None, None).await.unwrap();
    let err = h
        .executor
        .submit(generic_input("threaded").with_thread(&thread.thread_id))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::CapThreadClosed);
    h.teardown().await;
}

#[tokio::test]
async fn test_terminal_status_never_overwritten() {
    let h = harness().await;
    h.register_agent("agent", AgentExtensions::default()).await;
    h.handlers.register(Arc::new(EchoHandler)).await.unwrap();

    let run = h.executor.submit(generic_input("agent")).await.unwrap();
    let finished = h.executor.wait_terminal(&run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);

    // A late cancel does not overwrite the terminal status.
    let after = h.executor.cancel(&run.run_id, None).await.unwrap();
    assert_eq!(after.status, RunStatus::Completed);

    // Step timestamps are monotonic and every step is terminal.
    assert!(finished
        .steps
        .windows(2)
        .all(|w| w[0].created_at <= w[1].created_at));
    assert!(finished.steps.iter().all(|s| s.status.is_terminal()));
    h.teardown().await;
}
