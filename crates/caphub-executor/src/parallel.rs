//! Parallel child-step execution.

use caphub_contract::error::HubError;
use caphub_contract::handler::{StepContext, StepError};
use caphub_contract::run::{ParallelPolicy, Step, StepStatus, StepType};
use futures::future::BoxFuture;
use serde_json::{json, Value};

/// One child of a `parallel_execution` step: its record plus the work.
pub struct ParallelChild {
    pub step: Step,
    pub task: BoxFuture<'static, Result<Value, HubError>>,
}

impl ParallelChild {
    pub fn new(
        name: impl Into<String>,
        step_type: StepType,
        input: Value,
        task: BoxFuture<'static, Result<Value, HubError>>,
    ) -> Self {
        Self {
            step: Step::new(step_type, name, input),
            task,
        }
    }
}

/// Run N children concurrently under one `parallel_execution` parent step.
///
/// Children share the parent run's deadline (the run's abort controller
/// governs the whole handler future). Under the strict policy the first
/// child failure fails the parent; under the lenient policy the parent
/// completes with the surviving results.
pub async fn run_parallel_step(
    ctx: &dyn StepContext,
    name: impl Into<String>,
    policy: ParallelPolicy,
    children: Vec<ParallelChild>,
) -> Result<Vec<Result<Value, HubError>>, StepError> {
    let mut parent = Step::new(StepType::ParallelExecution, name, Value::Null)
        .with_parallel_policy(policy);
    let mut tasks = Vec::with_capacity(children.len());
    let mut child_ids = Vec::with_capacity(children.len());
    for child in children {
        child_ids.push(child.step.step_id.clone());
        parent.children.push(child.step);
        tasks.push(child.task);
    }
    let parent_id = ctx.add_step(parent).await?;

    // Children are dispatched concurrently; their relative completion order
    // is not observable.
    let outcomes = futures::future::join_all(tasks).await;

    let mut results = Vec::with_capacity(outcomes.len());
    let mut first_failure: Option<HubError> = None;
    for (child_id, outcome) in child_ids.iter().zip(outcomes) {
        match outcome {
            Ok(value) => {
                ctx.update_child_step(&parent_id, child_id, StepStatus::Completed, value.clone(), None)
                    .await?;
                results.push(Ok(value));
            }
            Err(error) => {
                ctx.update_child_step(
                    &parent_id,
                    child_id,
                    StepStatus::Failed,
                    Value::Null,
                    Some(error.clone()),
                )
                .await?;
                if first_failure.is_none() {
                    first_failure = Some(error.clone());
                }
                results.push(Err(error));
            }
        }
    }

    match (policy, first_failure) {
        (ParallelPolicy::Strict, Some(error)) => {
            ctx.fail_step(&parent_id, error.clone()).await?;
            Err(StepError(error))
        }
        _ => {
            let completed = results.iter().filter(|r| r.is_ok()).count();
            ctx.complete_step(
                &parent_id,
                json!({ "children": results.len(), "completed": completed }),
            )
            .await?;
            Ok(results)
        }
    }
}
