//! Wire envelopes exchanged between the orchestrator and node agents.
//!
//! `QueueBody` is the request: one task addressed to one node for one
//! NodeStep. `QueueReply` is the outcome. Both travel as JSON.

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::model::{Cluster, ReturnData};
use crate::task::{self, Task};

/// Bus subjects used by the protocol.
pub mod subjects {
    /// Well-known subject for replies that are not sent on a request's
    /// `reply_to` (detached tasks, fallbacks).
    pub const REPLIES: &str = "fleet.replies";
    /// Operation submission requests.
    pub const SUBMIT: &str = "fleet.operations.submit";

    /// Subject a single node's agent listens on.
    pub fn node(node_id: &str) -> String {
        format!("fleet.node.{node_id}")
    }

    /// Shared subject for "any agent in this group". Subscribers join the
    /// queue group of the same name so exactly one handles each request.
    pub fn group(group: &str) -> String {
        format!("fleet.group.{group}")
    }

    /// Private reply inbox for one requester.
    pub fn inbox(owner: &str) -> String {
        format!("_INBOX.{owner}")
    }
}

/// Task request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBody {
    pub operation_id: String,
    pub task_type: String,
    /// Snapshot of the cluster at dispatch time.
    pub clusters: Cluster,
    pub node_step_id: String,
    /// Position of this task within its NodeStep. Echoed in the reply.
    #[serde(default)]
    pub task_index: usize,
    /// Task payload, decoded with the registry entry for `task_type`.
    #[serde(with = "crate::hex_bytes")]
    pub task_data: Vec<u8>,
    #[serde(default)]
    pub resource_server_url: String,
    #[serde(default)]
    pub step_return_data: ReturnData,
}

impl QueueBody {
    pub fn new(
        operation_id: impl Into<String>,
        node_step_id: impl Into<String>,
        cluster: Cluster,
        task: &Task,
    ) -> Result<Self, TaskError> {
        Ok(Self {
            operation_id: operation_id.into(),
            task_type: task.task_type().to_string(),
            clusters: cluster,
            node_step_id: node_step_id.into(),
            task_index: 0,
            task_data: task.encode()?,
            resource_server_url: String::new(),
            step_return_data: ReturnData::new(),
        })
    }

    pub fn with_task_index(mut self, index: usize) -> Self {
        self.task_index = index;
        self
    }

    pub fn with_resource_server(mut self, url: impl Into<String>) -> Self {
        self.resource_server_url = url.into();
        self
    }

    pub fn with_return_data(mut self, data: ReturnData) -> Self {
        self.step_return_data = data;
        self
    }

    pub fn decode_task(&self) -> Result<Task, TaskError> {
        task::decode(&self.task_type, &self.task_data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(self).map_err(TaskError::Encode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TaskError> {
        serde_json::from_slice(data).map_err(TaskError::Envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStat {
    Successful,
    Error,
}

/// Task outcome envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReply {
    pub operation_id: String,
    pub stat: ReplyStat,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub return_data: ReturnData,
    #[serde(rename = "node-id")]
    pub node_id: String,
    pub node_step_id: String,
    #[serde(default)]
    pub task_index: usize,
}

impl QueueReply {
    pub fn successful(corr: &Correlation, return_data: ReturnData) -> Self {
        Self {
            operation_id: corr.operation_id.clone(),
            stat: ReplyStat::Successful,
            message: String::new(),
            return_data,
            node_id: corr.node_id.clone(),
            node_step_id: corr.node_step_id.clone(),
            task_index: corr.task_index,
        }
    }

    pub fn error(corr: &Correlation, message: impl Into<String>) -> Self {
        Self {
            operation_id: corr.operation_id.clone(),
            stat: ReplyStat::Error,
            message: message.into(),
            return_data: ReturnData::new(),
            node_id: corr.node_id.clone(),
            node_step_id: corr.node_step_id.clone(),
            task_index: corr.task_index,
        }
    }

    pub fn is_success(&self) -> bool {
        self.stat == ReplyStat::Successful
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(self).map_err(TaskError::Encode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TaskError> {
        serde_json::from_slice(data).map_err(TaskError::Envelope)
    }
}

/// Fields that let the orchestrator match a reply to the NodeStep waiting for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub operation_id: String,
    pub node_id: String,
    pub node_step_id: String,
    pub task_index: usize,
}

impl Correlation {
    pub fn of(body: &QueueBody, node_id: &str) -> Self {
        Self {
            operation_id: body.operation_id.clone(),
            node_id: node_id.to_string(),
            node_step_id: body.node_step_id.clone(),
            task_index: body.task_index,
        }
    }

    /// Best-effort correlation from an envelope that failed to decode.
    pub fn recover(raw: &[u8], node_id: &str) -> Self {
        let value: serde_json::Value = serde_json::from_slice(raw).unwrap_or_default();
        let field = |name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Self {
            operation_id: field("operation_id"),
            node_id: node_id.to_string(),
            node_step_id: field("node_step_id"),
            task_index: value
                .get("task_index")
                .and_then(|v| v.as_u64())
                .and_then(|i| usize::try_from(i).ok())
                .unwrap_or_default(),
        }
    }
}
