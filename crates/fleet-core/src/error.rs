//! Error taxonomy shared by the agent and the orchestrator.
//!
//! Decode and provider errors never cross the bus as errors: the agent turns
//! them into an error `QueueReply` with the message preserved. Timeouts and
//! unreachable nodes are not errors at all, they are NodeStep classifications
//! owned by the engine.

/// Task envelope / payload decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("unknown task type {0:?}")]
    UnknownTaskType(String),
    #[error("malformed {task_type} payload: {source}")]
    Malformed {
        task_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("failed to encode task: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Capability provider failures. The message is surfaced verbatim to operators.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unsupported platform {vendor} {version}")]
    UnsupportedPlatform { vendor: String, version: String },
    #[error("{operation} is not implemented on {platform}")]
    NotImplemented {
        platform: String,
        operation: &'static str,
    },
    #[error("command `{command}` exited with {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },
    #[error("command `{command}` timed out after {secs}s")]
    CommandTimeout { command: String, secs: u64 },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

/// Orchestration failures that end an Operation in `error`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step {step:?} aborted: {reason}")]
    PolicyAbort { step: String, reason: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to build node steps for {step:?}: {reason}")]
    DynamicStep { step: String, reason: String },
    #[error("operation {0} is already running on this host")]
    AlreadyRunning(String),
    #[error("operation {id} is owned by engine host {host:?}")]
    ForeignHost { id: String, host: String },
    #[error("operation has no steps")]
    EmptyPlan,
    #[error("no plan for {0} operations")]
    NoPlan(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("bus error: {0}")]
    Bus(String),
    #[error("store error: {0}")]
    Store(String),
}
