//! Built-in step handlers shipped with the server binary.
//!
//! Real deployments register provider-backed handlers (LLM, retrieval,
//! tools) through [`caphub::HubBuilder::with_handler`]; these built-ins keep
//! a bare server usable for wiring checks and local development.

use async_trait::async_trait;
use caphub::{
    AgentVersion, HandlerInput, HandlerMetadata, HandlerOutput, Operation, Role, StepContext,
    StepError,
};
use caphub_contract::run::{Step, StepType, TokenUsage};
use serde_json::json;

/// Echoes the latest user message back. Advertises the `generic` operation.
pub struct EchoHandler;

#[async_trait]
impl caphub::contract::StepHandler for EchoHandler {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new("builtin-echo", AgentVersion::new(1, 0, 0), Operation::Generic)
            .with_description("Echoes the latest user message")
    }

    async fn execute(
        &self,
        ctx: &dyn StepContext,
        input: HandlerInput,
    ) -> Result<HandlerOutput, StepError> {
        let last_user = input
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .or_else(|| {
                input
                    .context
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let step_id = ctx
            .add_step(Step::new(
                StepType::LlmCall,
                "echo",
                json!({ "chars": last_user.len() }),
            ))
            .await?;
        ctx.update_token_usage(TokenUsage::new(last_user.len() as u64 / 4, 1))
            .await?;
        ctx.complete_step(&step_id, json!({ "echoed": true })).await?;
        Ok(HandlerOutput::text(last_user))
    }
}
