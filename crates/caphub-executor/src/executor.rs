//! The run executor: a per-run state machine wrapped by a dispatcher that
//! multiplexes many runs across a fixed worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use caphub_contract::bus::EventBus;
use caphub_contract::error::{ErrorCode, HubError};
use caphub_contract::event::HubEvent;
use caphub_contract::handler::{HandlerInput, HandlerOutput, StepError, StepHandler};
use caphub_contract::run::{Run, RunFilter, RunInput, RunOutput, RunStatus};
use caphub_contract::storage::{CheckpointStore, WorkQueue};
use caphub_contract::thread::{ContextWindow, Message, ThreadStatus};
use caphub_contract::time::current_unix_millis;
use caphub_interrupt::InterruptService;
use caphub_registry::AgentRegistry;
use caphub_router::HandlerRegistry;
use caphub_threads::{ContextBudget, ThreadService};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::context::ExecutionContext;
use crate::deadline::DeadlineClock;
use crate::retry::RetryPolicy;

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker pool size.
    pub pool_size: usize,
    /// Periodic checkpoint cadence.
    pub checkpoint_interval: Duration,
    /// Process-wide upper bound on any run deadline.
    pub max_timeout: Duration,
    /// Deadline applied when neither the caller nor the agent set one.
    pub default_timeout: Duration,
    /// Grace window between deadline expiry and force-termination.
    pub grace: Duration,
    /// Retry policy for retryable handler errors.
    pub retry: RetryPolicy,
    /// Context-token budget used when an agent does not advertise one.
    pub default_context_tokens: u64,
    /// Route runs through the distributed work queue instead of the local
    /// FIFO.
    pub distributed: bool,
    /// Distributed mode: idle poll interval against the queue.
    pub queue_poll_interval: Duration,
    /// Distributed mode: claim lease duration.
    pub lease_ttl: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            checkpoint_interval: Duration::from_secs(10),
            max_timeout: Duration::from_secs(600),
            default_timeout: Duration::from_secs(120),
            grace: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            default_context_tokens: 8192,
            distributed: false,
            queue_poll_interval: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// Live state of one run: the record all callbacks serialize on, plus the
/// run's abort controller.
#[derive(Clone)]
pub struct RunRecord {
    pub(crate) run: Arc<Mutex<Run>>,
    pub(crate) cancel: CancellationToken,
}

enum DriveOutcome {
    Done(HandlerOutput),
    Failed(HubError),
    Cancelled,
    TimedOut,
}

/// The run executor service.
pub struct RunExecutor {
    config: ExecutorConfig,
    registry: Arc<AgentRegistry>,
    threads: Arc<ThreadService>,
    handlers: Arc<HandlerRegistry>,
    interrupts: Arc<InterruptService>,
    checkpoints: Arc<dyn CheckpointStore>,
    queue: Option<Arc<dyn WorkQueue>>,
    bus: EventBus,
    runs: RwLock<HashMap<String, RunRecord>>,
    local_tx: mpsc::UnboundedSender<String>,
    local_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    shutdown: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RunExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<AgentRegistry>,
        threads: Arc<ThreadService>,
        handlers: Arc<HandlerRegistry>,
        interrupts: Arc<InterruptService>,
        checkpoints: Arc<dyn CheckpointStore>,
        queue: Option<Arc<dyn WorkQueue>>,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            threads,
            handlers,
            interrupts,
            checkpoints,
            queue,
            bus,
            runs: RwLock::new(HashMap::new()),
            local_tx,
            local_rx: Mutex::new(local_rx),
            shutdown,
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn interrupts(&self) -> &InterruptService {
        &self.interrupts
    }

    /// Spawn the worker pool (and, in distributed mode, the lease sweeper).
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("worker list lock");
        if !workers.is_empty() {
            return;
        }
        for idx in 0..self.config.pool_size.max(1) {
            let executor = self.clone();
            workers.push(tokio::spawn(async move {
                executor.worker_loop(idx).await;
            }));
        }
        if self.config.distributed {
            if let Some(queue) = self.queue.clone() {
                let shutdown = self.shutdown.clone();
                let interval = self.config.lease_ttl / 2;
                workers.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(50)));
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = ticker.tick() => {}
                        }
                        match queue.requeue_expired().await {
                            Ok(0) => {}
                            Ok(n) => info!(recovered = n, "returned expired queue leases"),
                            Err(err) => warn!(error = %err, "lease sweep failed"),
                        }
                    }
                }));
            }
        }
        info!(pool_size = self.config.pool_size, distributed = self.config.distributed, "executor started");
    }

    /// Stop accepting work and wait for workers to drain.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker list lock");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Submit a run. Validates the input, persists the pending record, and
    /// enqueues it for a worker.
    pub async fn submit(&self, input: RunInput) -> Result<Run, HubError> {
        let agent = self
            .registry
            .ensure_dispatchable(&input.agent_id)
            .await
            .map_err(HubError::from)?;

        if let Some(ref thread_id) = input.thread_id {
            if !agent.extensions.supports_threads {
                return Err(HubError::validation(format!(
                    "agent {} does not support threads",
                    agent.agent_id
                )));
            }
            let thread = self.threads.get(thread_id).await.map_err(HubError::from)?;
            if thread.agent_id != input.agent_id {
                return Err(HubError::validation(format!(
                    "thread {thread_id} belongs to agent {}",
                    thread.agent_id
                )));
            }
            match thread.status {
                ThreadStatus::Active => {}
                ThreadStatus::Closed | ThreadStatus::Archived => {
                    return Err(HubError::thread_closed(thread_id));
                }
                ThreadStatus::Paused => {
                    return Err(HubError::validation(format!("thread {thread_id} is paused")));
                }
            }
        }
        for message in &input.messages {
            if message.content.trim().is_empty() {
                return Err(HubError::validation("message content must not be empty"));
            }
        }
        let run = Run::new(input);
        let record = RunRecord {
            run: Arc::new(Mutex::new(run.clone())),
            cancel: self.shutdown.child_token(),
        };
        self.runs
            .write()
            .await
            .insert(run.run_id.clone(), record.clone());
        self.persist(&run).await?;

        let snapshot = if self.config.distributed {
            let queue = self
                .queue
                .as_ref()
                .ok_or_else(|| HubError::internal("distributed mode without a queue"))?;
            let queued = self
                .apply_transition(&record, RunStatus::Queued, |_| {})
                .await?;
            queue
                .enqueue(&queued.run_id, queued.run_id.clone().into_bytes())
                .await
                .map_err(HubError::from)?;
            queued
        } else {
            // Local mode: the run goes straight to a worker; it only surfaces
            // as queued if it has to wait for an agent slot.
            self.local_tx
                .send(run.run_id.clone())
                .map_err(|_| HubError::internal("executor is shut down"))?;
            run
        };
        debug!(run_id = %snapshot.run_id, agent_id = %snapshot.agent_id, "run submitted");
        Ok(snapshot)
    }

    /// Current snapshot of a run.
    pub async fn get_run(&self, run_id: &str) -> Result<Run, HubError> {
        let record = self.record(run_id).await?;
        let run = record.run.lock().await;
        Ok(run.clone())
    }

    /// List run snapshots matching the filter, newest first.
    pub async fn list_runs(&self, filter: &RunFilter) -> Vec<Run> {
        let records: Vec<RunRecord> = {
            let runs = self.runs.read().await;
            runs.values().cloned().collect()
        };
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            let run = record.run.lock().await.clone();
            if let Some(ref agent_id) = filter.agent_id {
                if &run.agent_id != agent_id {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if run.status != status {
                    continue;
                }
            }
            snapshots.push(run);
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            snapshots.truncate(filter.limit);
        }
        snapshots
    }

    /// Cancel a run. Idempotent: cancelling a terminal run is a no-op that
    /// returns the current state. Returns once the terminal status is
    /// durable.
    pub async fn cancel(&self, run_id: &str, reason: Option<String>) -> Result<Run, HubError> {
        let record = self.record(run_id).await?;
        let snapshot = {
            let mut run = record.run.lock().await;
            if run.status.is_terminal() {
                return Ok(run.clone());
            }
            let mut error = HubError::run_cancelled(run_id);
            if let Some(reason) = reason {
                error = error.with_context("reason", serde_json::Value::String(reason));
            }
            let now = current_unix_millis();
            run.status = RunStatus::Cancelled;
            run.error = Some(error);
            run.finished_at = Some(now);
            run.updated_at = now;
            run.clone()
        };
        self.persist(&snapshot).await?;
        record.cancel.cancel();
        self.interrupts.cancel_for_run(run_id).await;
        self.bus.publish(HubEvent::RunCancelled {
            run_id: run_id.to_string(),
            error: snapshot.error.clone().unwrap_or_else(|| HubError::run_cancelled(run_id)),
        });
        info!(run_id, "run cancelled");
        Ok(snapshot)
    }

    /// Block until a run reaches a terminal status.
    pub async fn wait_terminal(&self, run_id: &str) -> Result<Run, HubError> {
        let mut sub = self.bus.subscribe_run(run_id);
        loop {
            let run = self.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            match sub.recv().await {
                Some(event) if event.is_terminal() => return self.get_run(run_id).await,
                Some(_) => continue,
                None => return self.get_run(run_id).await,
            }
        }
    }

    /// Re-enqueue non-terminal checkpointed runs after a restart.
    ///
    /// Completed steps are retained so handlers replay past them; the last
    /// non-terminal step is dropped and retried from its input.
    pub async fn recover(&self) -> Result<Vec<String>, HubError> {
        let mut resumed = Vec::new();
        for run_id in checkpoint::list_run_ids(self.checkpoints.as_ref()).await? {
            {
                let runs = self.runs.read().await;
                if runs.contains_key(&run_id) {
                    continue;
                }
            }
            let Some(cp) = checkpoint::read(self.checkpoints.as_ref(), &run_id).await? else {
                continue;
            };
            let mut run = cp.run;
            if run.status.is_terminal() {
                continue;
            }
            run.steps.retain(|s| s.status.is_terminal());
            run.status = RunStatus::Pending;
            run.started_at = None;
            run.updated_at = current_unix_millis();

            let record = RunRecord {
                run: Arc::new(Mutex::new(run.clone())),
                cancel: self.shutdown.child_token(),
            };
            self.runs.write().await.insert(run_id.clone(), record.clone());
            self.persist(&run).await?;

            if self.config.distributed {
                if let Some(queue) = self.queue.as_ref() {
                    let queued = self
                        .apply_transition(&record, RunStatus::Queued, |_| {})
                        .await?;
                    queue
                        .enqueue(&queued.run_id, queued.run_id.clone().into_bytes())
                        .await
                        .map_err(HubError::from)?;
                }
            } else {
                self.local_tx
                    .send(run_id.clone())
                    .map_err(|_| HubError::internal("executor is shut down"))?;
            }
            info!(run_id = %run_id, "run recovered from checkpoint");
            resumed.push(run_id);
        }
        Ok(resumed)
    }

    // --- internals ---

    async fn record(&self, run_id: &str) -> Result<RunRecord, HubError> {
        let runs = self.runs.read().await;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| HubError::run_not_found(run_id))
    }

    pub(crate) async fn persist(&self, run: &Run) -> Result<(), HubError> {
        checkpoint::write(self.checkpoints.as_ref(), run).await
    }

    /// Apply a state-machine transition under the record lock and persist
    /// the result. Illegal transitions (e.g. racing a cancel) conflict.
    pub(crate) async fn apply_transition(
        &self,
        record: &RunRecord,
        next: RunStatus,
        mutate: impl FnOnce(&mut Run),
    ) -> Result<Run, HubError> {
        let snapshot = {
            let mut run = record.run.lock().await;
            if !run.status.can_transition_to(next) {
                return Err(HubError::conflict(format!(
                    "illegal run transition {:?} -> {next:?}",
                    run.status
                )));
            }
            run.status = next;
            run.updated_at = current_unix_millis();
            mutate(&mut run);
            run.clone()
        };
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    /// Terminal transition that tolerates losing the race to another
    /// terminal writer (cancel vs. timeout vs. worker).
    async fn try_finish(
        &self,
        record: &RunRecord,
        next: RunStatus,
        mutate: impl FnOnce(&mut Run),
    ) -> Option<Run> {
        match self.apply_transition(record, next, mutate).await {
            Ok(run) => Some(run),
            Err(_) => None,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_idx: usize) {
        debug!(worker = worker_idx, "worker started");
        if self.config.distributed {
            self.distributed_worker_loop().await;
        } else {
            self.local_worker_loop().await;
        }
        debug!(worker = worker_idx, "worker stopped");
    }

    async fn local_worker_loop(self: &Arc<Self>) {
        loop {
            let run_id = {
                let mut rx = self.local_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    run_id = rx.recv() => run_id,
                }
            };
            match run_id {
                Some(run_id) => self.process_run(&run_id).await,
                None => return,
            }
        }
    }

    async fn distributed_worker_loop(self: &Arc<Self>) {
        let Some(queue) = self.queue.clone() else {
            warn!("distributed mode without a queue; worker idle");
            return;
        };
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let job = match queue.claim(self.config.lease_ttl).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.queue_poll_interval) => continue,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "queue claim failed");
                    tokio::time::sleep(self.config.queue_poll_interval).await;
                    continue;
                }
            };
            let run_id = String::from_utf8_lossy(&job.payload).to_string();
            self.process_run(&run_id).await;
            if let Err(err) = queue.ack(&job.job_id).await {
                warn!(job_id = %job.job_id, error = %err, "queue ack failed");
            }
        }
    }

    /// Drive one run from its queue slot to a terminal status.
    async fn process_run(self: &Arc<Self>, run_id: &str) {
        // A redelivered distributed job may land on a worker that has no
        // record yet; rebuild it from the checkpoint.
        let record = match self.record(run_id).await {
            Ok(record) => record,
            Err(_) => match self.rebuild_record(run_id).await {
                Some(record) => record,
                None => {
                    warn!(run_id, "no record or checkpoint for queued run");
                    return;
                }
            },
        };

        let snapshot = record.run.lock().await.clone();
        if snapshot.status.is_terminal() {
            return;
        }

        // Concurrency gate: an over-capacity run surfaces as queued until a
        // slot frees.
        let slot = match self.registry.try_acquire_slot(&snapshot.agent_id).await {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                if snapshot.status == RunStatus::Pending {
                    let _ = self
                        .apply_transition(&record, RunStatus::Queued, |_| {})
                        .await;
                }
                match self
                    .registry
                    .acquire_slot(&snapshot.agent_id, &record.cancel)
                    .await
                {
                    Ok(Some(slot)) => slot,
                    Ok(None) => return, // cancelled while waiting
                    Err(err) => {
                        self.fail_run(&record, HubError::from(err)).await;
                        return;
                    }
                }
            }
            Err(err) => {
                self.fail_run(&record, HubError::from(err)).await;
                return;
            }
        };

        // Gate again at dispatch time; the agent may have changed since
        // submission.
        let agent = match self.registry.ensure_dispatchable(&snapshot.agent_id).await {
            Ok(agent) => agent,
            Err(err) => {
                self.fail_run(&record, HubError::from(err)).await;
                return;
            }
        };

        // Materialize thread context when the input names a thread and
        // carries no messages of its own.
        let mut messages: Vec<Message> = snapshot.input.messages.clone();
        let mut thread_context: Option<ContextWindow> = None;
        if let Some(ref thread_id) = snapshot.thread_id {
            let budget = agent
                .capabilities
                .max_context_tokens
                .unwrap_or(self.config.default_context_tokens);
            match self
                .threads
                .get_context(thread_id, ContextBudget::recent(budget))
                .await
            {
                Ok(window) => {
                    if messages.is_empty() {
                        messages = materialize_messages(&window);
                    }
                    thread_context = Some(window);
                }
                Err(err) => {
                    self.fail_run(&record, HubError::from(err)).await;
                    return;
                }
            }
        }

        // Route to a handler.
        let Some(decision) = self.handlers.route(&snapshot.input, &agent).await else {
            self.fail_run(
                &record,
                HubError::execution_failed("no handler matched the run input"),
            )
            .await;
            return;
        };

        let thread_cursor = thread_context.as_ref().and_then(|w| w.cursor);
        let handler_name = decision.metadata.name.clone();
        let started = match self
            .apply_transition(&record, RunStatus::Running, |run| {
                run.started_at = Some(current_unix_millis());
                run.current_handler = Some(handler_name.clone());
                run.thread_cursor = thread_cursor;
            })
            .await
        {
            Ok(run) => run,
            // Lost to a cancel between claim and dispatch.
            Err(_) => return,
        };
        self.bus.publish(HubEvent::RunStarted {
            run_id: started.run_id.clone(),
            agent_id: started.agent_id.clone(),
        });

        let budget_ms = effective_timeout_ms(
            started.input.options.timeout_ms,
            agent.extensions.default_timeout_ms,
            self.config.default_timeout,
            self.config.max_timeout,
        );
        let deadline = Arc::new(DeadlineClock::new(Duration::from_millis(budget_ms)));
        let streaming_enabled = started.input.options.stream && agent.extensions.supports_streaming;

        let ctx = ExecutionContext::new(
            self.clone(),
            record.clone(),
            started.run_id.clone(),
            agent,
            thread_context,
            record.cancel.clone(),
            deadline.clone(),
            streaming_enabled,
        );
        let handler_input = HandlerInput {
            operation: decision.operation,
            messages,
            context: started.input.context.clone(),
        };

        let outcome = self
            .drive(&ctx, decision.handler, handler_input, &record, &deadline)
            .await;
        drop(ctx);

        match outcome {
            DriveOutcome::Done(output) => {
                let finished_at = current_unix_millis();
                let started_at = started.started_at.unwrap_or(finished_at);
                let completed = self
                    .try_finish(&record, RunStatus::Completed, |run| {
                        run.finished_at = Some(finished_at);
                        run.output = Some(RunOutput {
                            response: output.response.clone(),
                            data: output.data.clone(),
                            artifacts: output.artifacts.clone(),
                            usage: run.usage,
                            duration_ms: finished_at.saturating_sub(started_at),
                        });
                    })
                    .await;
                if let Some(run) = completed {
                    self.bus.publish(HubEvent::RunCompleted {
                        run_id: run.run_id.clone(),
                        response: output.response,
                        usage: run.usage,
                    });
                    info!(run_id = %run.run_id, "run completed");
                }
            }
            DriveOutcome::Failed(error) if error.code == ErrorCode::CapRunCancelled => {
                // A cancelled suspension surfaces as a handler error; the
                // cancel path has usually already sealed the record.
                let _ = self
                    .try_finish(&record, RunStatus::Cancelled, |run| {
                        run.error = Some(error.clone());
                        run.finished_at = Some(current_unix_millis());
                    })
                    .await;
            }
            DriveOutcome::Failed(error) => {
                self.fail_run(&record, error).await;
            }
            DriveOutcome::Cancelled => {
                // User cancel seals the record itself; anything else here is
                // hub shutdown.
                let _ = self
                    .try_finish(&record, RunStatus::Cancelled, |run| {
                        run.error = Some(HubError::run_cancelled(run_id));
                        run.finished_at = Some(current_unix_millis());
                    })
                    .await;
            }
            DriveOutcome::TimedOut => {
                let error = HubError::run_timeout(run_id);
                let timed_out = self
                    .try_finish(&record, RunStatus::Timeout, |run| {
                        run.error = Some(error.clone());
                        run.finished_at = Some(current_unix_millis());
                    })
                    .await;
                if timed_out.is_some() {
                    self.interrupts.cancel_for_run(run_id).await;
                    self.bus.publish(HubEvent::RunTimeout {
                        run_id: run_id.to_string(),
                        error,
                    });
                    warn!(run_id, "run timed out");
                }
            }
        }
        drop(slot);
    }

    /// Run the handler future under the abort controller, the deadline, and
    /// the periodic checkpoint ticker, retrying retryable errors.
    async fn drive(
        self: &Arc<Self>,
        ctx: &ExecutionContext,
        handler: Arc<dyn StepHandler>,
        input: HandlerInput,
        record: &RunRecord,
        deadline: &Arc<DeadlineClock>,
    ) -> DriveOutcome {
        enum Inner {
            Finished(Result<HandlerOutput, StepError>),
            Cancelled,
            Deadline,
        }

        let mut ticker = tokio::time::interval(self.config.checkpoint_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the first tick is immediate

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let fut = handler.execute(ctx, input.clone());
            tokio::pin!(fut);
            let inner = loop {
                tokio::select! {
                    biased;
                    _ = record.cancel.cancelled() => break Inner::Cancelled,
                    _ = deadline.expired() => break Inner::Deadline,
                    _ = ticker.tick() => {
                        let snapshot = record.run.lock().await.clone();
                        if let Err(err) = self.persist(&snapshot).await {
                            warn!(run_id = %snapshot.run_id, error = %err, "periodic checkpoint failed");
                        }
                        continue;
                    }
                    result = &mut fut => break Inner::Finished(result),
                }
            };

            match inner {
                Inner::Finished(Ok(output)) => return DriveOutcome::Done(output),
                Inner::Finished(Err(error)) => {
                    if error.retryable() && attempt < self.config.retry.max_attempts {
                        warn!(
                            run_id = %ctx.run_id,
                            attempt,
                            error = %error,
                            "retrying handler after retryable error"
                        );
                        if self.config.retry.wait(attempt, &record.cancel).await {
                            return DriveOutcome::Cancelled;
                        }
                        continue;
                    }
                    return DriveOutcome::Failed(error.into_inner());
                }
                Inner::Cancelled => return DriveOutcome::Cancelled,
                Inner::Deadline => {
                    // Fire the abort controller; give the handler a grace
                    // window to unwind before force-terminating.
                    record.cancel.cancel();
                    tokio::select! {
                        _ = &mut fut => {}
                        _ = tokio::time::sleep(self.config.grace) => {}
                    }
                    return DriveOutcome::TimedOut;
                }
            }
        }
    }

    async fn fail_run(&self, record: &RunRecord, error: HubError) {
        let failed = self
            .try_finish(record, RunStatus::Failed, |run| {
                run.error = Some(error.clone());
                run.finished_at = Some(current_unix_millis());
            })
            .await;
        if let Some(run) = failed {
            self.bus.publish(HubEvent::RunFailed {
                run_id: run.run_id.clone(),
                error,
            });
            warn!(run_id = %run.run_id, "run failed");
        }
    }

    async fn rebuild_record(&self, run_id: &str) -> Option<RunRecord> {
        let cp = checkpoint::read(self.checkpoints.as_ref(), run_id)
            .await
            .ok()??;
        let mut run = cp.run;
        if run.status.is_terminal() {
            return None;
        }
        run.steps.retain(|s| s.status.is_terminal());
        let record = RunRecord {
            run: Arc::new(Mutex::new(run)),
            cancel: self.shutdown.child_token(),
        };
        let mut runs = self.runs.write().await;
        Some(runs.entry(run_id.to_string()).or_insert(record).clone())
    }
}

/// Deadline: the lesser of the caller's and the agent's timeout, bounded by
/// the process-wide maximum. An agent timeout of zero means unset.
fn effective_timeout_ms(
    requested: Option<u64>,
    agent_default: u64,
    default: Duration,
    max: Duration,
) -> u64 {
    let agent_default = if agent_default == 0 {
        default.as_millis() as u64
    } else {
        agent_default
    };
    let base = match requested {
        Some(requested) => requested.min(agent_default),
        None => agent_default,
    };
    base.min(max.as_millis() as u64)
}

/// Flatten a context window into handler messages: summary first, then
/// pinned decision points, then the verbatim tail.
fn materialize_messages(window: &ContextWindow) -> Vec<Message> {
    let mut messages = Vec::with_capacity(window.messages.len() + window.pinned.len() + 1);
    if let Some(ref summary) = window.summary {
        messages.push(Message::system(format!("Conversation summary:\n{summary}")));
    }
    messages.extend(window.pinned.iter().cloned());
    messages.extend(window.messages.iter().cloned());
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeout_takes_the_lesser() {
        let default = Duration::from_secs(120);
        let max = Duration::from_secs(600);
        assert_eq!(
            effective_timeout_ms(Some(5_000), 120_000, default, max),
            5_000
        );
        assert_eq!(
            effective_timeout_ms(Some(300_000), 120_000, default, max),
            120_000
        );
        assert_eq!(effective_timeout_ms(None, 120_000, default, max), 120_000);
        // Zero agent default falls back to the hub default.
        assert_eq!(effective_timeout_ms(None, 0, default, max), 120_000);
        // Bounded by the process-wide maximum.
        assert_eq!(
            effective_timeout_ms(Some(900_000), 900_000, default, max),
            600_000
        );
    }

    #[test]
    fn test_materialize_messages_order() {
        let mut window = ContextWindow::default();
        window.summary = Some("earlier".into());
        window.messages = vec![Message::user("tail")];
        let messages = materialize_messages(&window);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("earlier"));
        assert_eq!(messages[1].content, "tail");
    }
}
