//! Per-run execution context handed to step handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caphub_contract::agent::{Agent, InterruptExpiryPolicy};
use caphub_contract::error::HubError;
use caphub_contract::event::{HubEvent, StreamEvent};
use caphub_contract::handler::{InterruptRequest, StepContext, StepError};
use caphub_contract::interrupt::{InterruptResponse, InterruptSpec};
use caphub_contract::run::{RunInput, RunOutput, RunStatus, Step, StepStatus, StepType, TokenUsage};
use caphub_contract::thread::ContextWindow;
use caphub_contract::time::current_unix_millis;
use caphub_interrupt::InterruptOutcome;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::deadline::DeadlineClock;
use crate::executor::{RunExecutor, RunRecord};

/// The executor's implementation of [`StepContext`].
///
/// Step callbacks lock the run record, mutate it, and persist a checkpoint,
/// so per-run step order stays linear and every callback is durable.
pub struct ExecutionContext {
    pub(crate) executor: Arc<RunExecutor>,
    pub(crate) record: RunRecord,
    pub(crate) run_id: String,
    pub(crate) agent: Agent,
    pub(crate) thread_context: Option<ContextWindow>,
    pub(crate) cancel: CancellationToken,
    pub(crate) deadline: Arc<DeadlineClock>,
    pub(crate) streaming_enabled: bool,
    streaming_started: AtomicBool,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        executor: Arc<RunExecutor>,
        record: RunRecord,
        run_id: String,
        agent: Agent,
        thread_context: Option<ContextWindow>,
        cancel: CancellationToken,
        deadline: Arc<DeadlineClock>,
        streaming_enabled: bool,
    ) -> Self {
        Self {
            executor,
            record,
            run_id,
            agent,
            thread_context,
            cancel,
            deadline,
            streaming_enabled,
            streaming_started: AtomicBool::new(false),
        }
    }

    async fn resume_running(&self, interrupt_id: &str) -> Result<(), StepError> {
        self.executor
            .apply_transition(&self.record, RunStatus::Running, |_| {})
            .await
            .map_err(StepError)?;
        self.deadline.resume();
        self.executor.bus().publish(HubEvent::RunResumed {
            run_id: self.run_id.clone(),
            interrupt_id: interrupt_id.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl StepContext for ExecutionContext {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn agent(&self) -> &Agent {
        &self.agent
    }

    fn thread_context(&self) -> Option<&ContextWindow> {
        self.thread_context.as_ref()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn remaining_deadline(&self) -> Duration {
        self.deadline.remaining()
    }

    fn emit(&self, event: StreamEvent) {
        if !self.streaming_enabled {
            return;
        }
        // First stream event moves the run into `streaming`. The transition
        // is persisted off the hot path; event order on the bus is already
        // fixed by publish order here.
        if !self.streaming_started.swap(true, Ordering::SeqCst) {
            let executor = self.executor.clone();
            let record = self.record.clone();
            tokio::spawn(async move {
                let _ = executor
                    .apply_transition(&record, RunStatus::Streaming, |_| {})
                    .await;
            });
        }
        let event = match event {
            StreamEvent::Token { delta } => HubEvent::Token {
                run_id: self.run_id.clone(),
                delta,
            },
            StreamEvent::ToolCalling {
                tool_name,
                arguments,
            } => HubEvent::ToolCalling {
                run_id: self.run_id.clone(),
                tool_name,
                arguments,
            },
            StreamEvent::ToolResult { tool_name, result } => HubEvent::ToolResult {
                run_id: self.run_id.clone(),
                tool_name,
                result,
            },
        };
        self.executor.bus().publish(event);
    }

    async fn add_step(&self, mut step: Step) -> Result<String, StepError> {
        step.status = StepStatus::Running;
        let step_id = step.step_id.clone();
        let name = step.name.clone();
        let snapshot = {
            let mut run = self.record.run.lock().await;
            run.steps.push(step);
            run.updated_at = current_unix_millis();
            run.clone()
        };
        self.executor.persist(&snapshot).await.map_err(StepError)?;
        self.executor.bus().publish(HubEvent::StepStarted {
            run_id: self.run_id.clone(),
            step_id: step_id.clone(),
            name,
        });
        Ok(step_id)
    }

    async fn complete_step(&self, step_id: &str, output: Value) -> Result<(), StepError> {
        let (snapshot, name) = {
            let mut run = self.record.run.lock().await;
            let step = run
                .steps
                .iter_mut()
                .find(|s| s.step_id == step_id)
                .ok_or_else(|| StepError(HubError::internal(format!("unknown step {step_id}"))))?;
            if step.status.is_terminal() {
                return Err(StepError(HubError::conflict(format!(
                    "step {step_id} is already {:?}",
                    step.status
                ))));
            }
            let now = current_unix_millis();
            step.status = StepStatus::Completed;
            step.output = output;
            step.completed_at = Some(now);
            step.duration_ms = Some(now.saturating_sub(step.created_at));
            let name = step.name.clone();
            run.updated_at = now;
            (run.clone(), name)
        };
        self.executor.persist(&snapshot).await.map_err(StepError)?;
        self.executor.bus().publish(HubEvent::StepCompleted {
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            name,
        });
        Ok(())
    }

    async fn fail_step(&self, step_id: &str, error: HubError) -> Result<(), StepError> {
        let snapshot = {
            let mut run = self.record.run.lock().await;
            let step = run
                .steps
                .iter_mut()
                .find(|s| s.step_id == step_id)
                .ok_or_else(|| StepError(HubError::internal(format!("unknown step {step_id}"))))?;
            if step.status.is_terminal() {
                return Err(StepError(HubError::conflict(format!(
                    "step {step_id} is already {:?}",
                    step.status
                ))));
            }
            let now = current_unix_millis();
            step.status = StepStatus::Failed;
            step.error = Some(error);
            step.completed_at = Some(now);
            step.duration_ms = Some(now.saturating_sub(step.created_at));
            run.updated_at = now;
            run.clone()
        };
        self.executor.persist(&snapshot).await.map_err(StepError)?;
        Ok(())
    }

    async fn update_child_step(
        &self,
        parent_id: &str,
        child_id: &str,
        status: StepStatus,
        output: Value,
        error: Option<HubError>,
    ) -> Result<(), StepError> {
        let snapshot = {
            let mut run = self.record.run.lock().await;
            let parent = run
                .steps
                .iter_mut()
                .find(|s| s.step_id == parent_id)
                .ok_or_else(|| {
                    StepError(HubError::internal(format!("unknown step {parent_id}")))
                })?;
            let child = parent
                .children
                .iter_mut()
                .find(|c| c.step_id == child_id)
                .ok_or_else(|| {
                    StepError(HubError::internal(format!("unknown child step {child_id}")))
                })?;
            if child.status.is_terminal() {
                return Err(StepError(HubError::conflict(format!(
                    "child step {child_id} is already {:?}",
                    child.status
                ))));
            }
            let now = current_unix_millis();
            child.status = status;
            child.output = output;
            child.error = error;
            child.completed_at = status.is_terminal().then_some(now);
            run.updated_at = now;
            run.clone()
        };
        self.executor.persist(&snapshot).await.map_err(StepError)?;
        Ok(())
    }

    async fn update_token_usage(&self, usage: TokenUsage) -> Result<(), StepError> {
        let snapshot = {
            let mut run = self.record.run.lock().await;
            run.usage.add(usage);
            run.updated_at = current_unix_millis();
            run.clone()
        };
        self.executor.persist(&snapshot).await.map_err(StepError)?;
        Ok(())
    }

    async fn completed_step_output(&self, name: &str) -> Option<Value> {
        let run = self.record.run.lock().await;
        run.steps
            .iter()
            .find(|s| s.name == name && s.status == StepStatus::Completed)
            .map(|s| s.output.clone())
    }

    async fn interrupt(&self, request: InterruptRequest) -> Result<InterruptResponse, StepError> {
        if !self.agent.extensions.supports_interrupts {
            return Err(StepError(HubError::validation(format!(
                "agent {} does not support interrupts",
                self.agent.agent_id
            ))));
        }

        let thread_id = {
            let run = self.record.run.lock().await;
            run.thread_id.clone()
        };
        let mut spec = InterruptSpec::new(
            self.run_id.clone(),
            self.agent.agent_id.clone(),
            request.interrupt_type,
            request.payload,
            request.timeout_ms,
        )
        .with_priority(request.priority);
        spec.thread_id = thread_id;

        let (interrupt, resume) = self
            .executor
            .interrupts()
            .create(spec)
            .await
            .map_err(|e| StepError(HubError::from(e)))?;

        self.executor
            .apply_transition(&self.record, RunStatus::Interrupted, |_| {})
            .await
            .map_err(StepError)?;
        self.deadline.pause();
        debug!(run_id = %self.run_id, interrupt_id = %interrupt.interrupt_id, "run suspended");
        self.executor.bus().publish(HubEvent::RunInterrupted {
            run_id: self.run_id.clone(),
            interrupt: Box::new(interrupt.clone()),
        });

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(StepError(HubError::run_cancelled(&self.run_id)));
            }
            outcome = resume => outcome,
        };

        match outcome {
            Ok(InterruptOutcome::Resolved(response)) => {
                self.resume_running(&interrupt.interrupt_id).await?;
                Ok(response)
            }
            Ok(InterruptOutcome::Expired) => {
                match self.agent.extensions.interrupt_expiry_policy {
                    InterruptExpiryPolicy::ContinueWithout => {
                        self.resume_running(&interrupt.interrupt_id).await?;
                        Ok(InterruptResponse::new(Value::Null))
                    }
                    InterruptExpiryPolicy::FailRun => Err(StepError(HubError::interrupt_expired(
                        &interrupt.interrupt_id,
                    ))),
                }
            }
            // Interrupt cancelled, or the service went away with it.
            Ok(InterruptOutcome::Cancelled) | Err(_) => {
                Err(StepError(HubError::run_cancelled(&self.run_id)))
            }
        }
    }

    async fn call_agent(&self, mut input: RunInput) -> Result<RunOutput, StepError> {
        // The child inherits the parent's remaining deadline.
        let remaining = self.deadline.remaining().as_millis() as u64;
        input.options.timeout_ms = Some(match input.options.timeout_ms {
            Some(requested) => requested.min(remaining),
            None => remaining,
        });
        let called_agent = input.agent_id.clone();

        let child = self
            .executor
            .submit(input)
            .await
            .map_err(StepError)?;
        let step_id = self
            .add_step(
                Step::new(
                    StepType::AgentCall,
                    format!("call:{called_agent}"),
                    json!({ "run_id": child.run_id }),
                )
                .with_called_agent(called_agent),
            )
            .await?;

        let finished = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(StepError(HubError::run_cancelled(&self.run_id)));
            }
            finished = self.executor.wait_terminal(&child.run_id) => finished.map_err(StepError)?,
        };

        match (finished.status, finished.output) {
            (RunStatus::Completed, Some(output)) => {
                self.complete_step(
                    &step_id,
                    json!({ "response": output.response.clone(), "usage": output.usage }),
                )
                .await?;
                self.update_token_usage(output.usage).await?;
                Ok(output)
            }
            (status, _) => {
                let error = finished.error.unwrap_or_else(|| {
                    HubError::execution_failed(format!("sub-agent run ended {status:?}"))
                });
                self.fail_step(&step_id, error.clone()).await?;
                Err(StepError(error))
            }
        }
    }
}
