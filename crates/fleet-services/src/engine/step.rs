//! Runtime Step and NodeStep definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::model::new_id;
use fleet_core::{Cluster, Operation, ReturnData, Task};

use super::policy::StepPolicy;

/// Builds a Step's NodeSteps from the data earlier Steps returned.
pub type DynamicNodeSteps =
    Arc<dyn Fn(&ReturnData, &Cluster, &Operation) -> Result<Vec<NodeStep>, String> + Send + Sync>;

/// The tasks one node runs for one Step, in order.
#[derive(Debug, Clone)]
pub struct NodeStep {
    pub id: String,
    pub name: String,
    pub node_id: String,
    /// Reply budget for the whole NodeStep. `None` uses the engine default.
    pub server_msg_timeout: Option<Duration>,
    pub tasks: Vec<Task>,
}

impl NodeStep {
    pub fn new(name: impl Into<String>, node_id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            node_id: node_id.into(),
            server_msg_timeout: None,
            tasks,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.server_msg_timeout = Some(timeout);
        self
    }

    /// Copy with a fresh id, so replies addressed to the old one are stale.
    pub fn renewed(&self) -> Self {
        Self {
            id: new_id(),
            ..self.clone()
        }
    }
}

#[derive(Clone)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub node_steps: Vec<NodeStep>,
    pub wait_before_run: Duration,
    pub dynamic_node_steps: Option<DynamicNodeSteps>,
    /// Skip the Step instead of failing when the dynamic constructor errors.
    pub ignore_dynamic_error: bool,
    /// Classify nodes already marked unreachable without dispatching to them.
    pub skip_unreachable: bool,
    pub max_retries: u32,
    /// Overrides the operation type's default policy.
    pub policy: Option<Arc<dyn StepPolicy>>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            node_steps: Vec::new(),
            wait_before_run: Duration::ZERO,
            dynamic_node_steps: None,
            ignore_dynamic_error: false,
            skip_unreachable: false,
            max_retries: 0,
            policy: None,
        }
    }

    pub fn with_node_steps(mut self, node_steps: Vec<NodeStep>) -> Self {
        self.node_steps = node_steps;
        self
    }

    pub fn dynamic<F>(mut self, build: F) -> Self
    where
        F: Fn(&ReturnData, &Cluster, &Operation) -> Result<Vec<NodeStep>, String>
            + Send
            + Sync
            + 'static,
    {
        self.dynamic_node_steps = Some(Arc::new(build));
        self
    }

    pub fn ignore_dynamic_error(mut self) -> Self {
        self.ignore_dynamic_error = true;
        self
    }

    pub fn skip_unreachable(mut self) -> Self {
        self.skip_unreachable = true;
        self
    }

    pub fn wait_before_run(mut self, wait: Duration) -> Self {
        self.wait_before_run = wait;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn policy(mut self, policy: impl StepPolicy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("node_steps", &self.node_steps.len())
            .field("dynamic", &self.dynamic_node_steps.is_some())
            .field("skip_unreachable", &self.skip_unreachable)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
