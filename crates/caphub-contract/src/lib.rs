//! Shared contracts for the capability hub: data model, lifecycle events,
//! error taxonomy, and the storage/queue interfaces backends implement.
#![allow(missing_docs)]

pub mod agent;
pub mod bus;
pub mod error;
pub mod event;
pub mod handler;
pub mod interrupt;
pub mod run;
pub mod storage;
pub mod thread;
pub mod time;

// agent
pub use agent::{
    Agent, AgentExtensions, AgentPatch, AgentSpec, AgentStatus, AgentVersion, Capabilities,
    ComponentCheck, DiscoveryCriteria, HealthState, HealthStatus, InterruptExpiryPolicy,
    LifecycleState, VersionParseError,
};

// thread
pub use thread::{
    ContextStrategy, ContextWindow, Message, MessageMetadata, Role, Thread, ThreadStatus,
    ThreadSummary,
};

// run
pub use run::{
    context_str, ContextMap, MetadataMap, ParallelPolicy, Run, RunFilter, RunInput, RunOptions,
    RunOutput, RunStatus, Step, StepStatus, StepType, TokenUsage,
};

// interrupt
pub use interrupt::{
    Interrupt, InterruptFilter, InterruptPayload, InterruptPriority, InterruptResponse,
    InterruptSpec, InterruptStatus, InterruptType,
};

// handler
pub use handler::{
    HandlerInput, HandlerMetadata, HandlerOutput, InterruptRequest, Operation, StepContext,
    StepError, StepHandler,
};

// error
pub use error::{ErrorCode, HubError};

// events
pub use bus::{BusSubscription, EventBus};
pub use event::{HubEvent, StreamEvent};

// storage
pub use storage::{
    CheckpointStore, MessageQuery, QueueJob, RegistryStore, StoreError, ThreadRepository,
    WorkQueue,
};

pub use time::{current_unix_millis, gen_id};
