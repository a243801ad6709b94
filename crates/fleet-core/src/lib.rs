//! fleet-core — shared types, task registry, wire envelopes and configuration.
//! All other fleet crates depend on this one.

pub mod config;
pub mod envelope;
pub mod error;
pub mod model;
pub mod task;

mod hex_bytes;

pub use envelope::{Correlation, QueueBody, QueueReply, ReplyStat};
pub use error::{EngineError, ProviderError, TaskError};
pub use model::{
    AgentStatus, Cluster, ClusterSpec, Disposition, Node, NodeRole, Operation, OperationRequest,
    OperationStatus, OperationType, ReturnData, StepState, StepStatus,
};
pub use task::{Action, Execution, Task, TaskMeta};
