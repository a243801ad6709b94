//! Step policies: when to stop early, when to stop waiting, and what to do
//! once a Step has settled.

use std::sync::Arc;

use fleet_core::{Disposition, OperationType, StepState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    KeepWaiting,
    /// Classify every unsettled NodeStep as timed out and stop waiting.
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision {
    Proceed,
    /// Re-dispatch the failed and timed-out nodes.
    Retry,
    Abort(String),
}

pub trait StepPolicy: Send + Sync {
    /// Called after each NodeStep settles. `true` stops dispatching the
    /// NodeSteps that have not been sent yet.
    fn on_node_settled(&self, _state: &StepState, _node_id: &str) -> bool {
        false
    }

    /// Called after each NodeStep timeout. `consecutive` counts timeouts
    /// since the last other outcome.
    fn on_timeout(&self, _state: &StepState, _consecutive: u32) -> TimeoutDecision {
        TimeoutDecision::KeepWaiting
    }

    /// Called once per settled dispatch round. `state.attempts` counts rounds.
    fn on_complete(&self, state: &StepState, total: usize, max_retries: u32) -> StepDecision;
}

fn retry_or_abort(state: &StepState, max_retries: u32) -> StepDecision {
    if state.attempts <= max_retries && !state.retryable_nodes().is_empty() {
        StepDecision::Retry
    } else {
        StepDecision::Abort(summary(state))
    }
}

/// Human-readable account of the nodes that did not succeed.
pub fn summary(state: &StepState) -> String {
    let mut parts = Vec::new();
    if !state.on_failed_nodes.is_empty() {
        let failed: Vec<String> = state
            .on_failed_nodes
            .iter()
            .map(|(node, msg)| format!("{node} ({msg})"))
            .collect();
        parts.push(format!("failed: {}", failed.join(", ")));
    }
    if !state.on_timeout_nodes.is_empty() {
        let nodes: Vec<&str> = state.on_timeout_nodes.iter().map(String::as_str).collect();
        parts.push(format!("timed out: {}", nodes.join(", ")));
    }
    if !state.unreachable_nodes.is_empty() {
        let nodes: Vec<&str> = state.unreachable_nodes.iter().map(String::as_str).collect();
        parts.push(format!("unreachable: {}", nodes.join(", ")));
    }
    parts.join("; ")
}

/// Every node must succeed.
#[derive(Debug, Clone, Default)]
pub struct StrictPolicy {
    pub abort_on_first_failure: bool,
}

impl StepPolicy for StrictPolicy {
    fn on_node_settled(&self, state: &StepState, node_id: &str) -> bool {
        self.abort_on_first_failure
            && !matches!(state.disposition(node_id), Some(Disposition::Succeeded) | None)
    }

    fn on_complete(&self, state: &StepState, _total: usize, max_retries: u32) -> StepDecision {
        if state.unsuccessful() == 0 {
            StepDecision::Proceed
        } else {
            retry_or_abort(state, max_retries)
        }
    }
}

/// Proceed while unsuccessful nodes stay within a bound.
#[derive(Debug, Clone)]
pub struct TolerantPolicy {
    /// `None` tolerates a strict minority of the Step's nodes.
    pub max_failures: Option<usize>,
    /// Finalize after this many consecutive timeouts. 0 = never.
    pub timeout_finalize_after: u32,
}

impl TolerantPolicy {
    pub fn minority() -> Self {
        Self {
            max_failures: None,
            timeout_finalize_after: 0,
        }
    }

    pub fn up_to(max_failures: usize) -> Self {
        Self {
            max_failures: Some(max_failures),
            timeout_finalize_after: 0,
        }
    }

    pub fn finalize_after(mut self, consecutive_timeouts: u32) -> Self {
        self.timeout_finalize_after = consecutive_timeouts;
        self
    }

    fn allowed(&self, total: usize) -> usize {
        self.max_failures
            .unwrap_or_else(|| total.saturating_sub(1) / 2)
    }
}

impl StepPolicy for TolerantPolicy {
    fn on_timeout(&self, _state: &StepState, consecutive: u32) -> TimeoutDecision {
        if self.timeout_finalize_after > 0 && consecutive >= self.timeout_finalize_after {
            TimeoutDecision::Finalize
        } else {
            TimeoutDecision::KeepWaiting
        }
    }

    fn on_complete(&self, state: &StepState, total: usize, max_retries: u32) -> StepDecision {
        if state.unsuccessful() <= self.allowed(total) {
            if state.unsuccessful() > 0 {
                tracing::warn!(step = %state.name, detail = %summary(state), "tolerating node failures");
            }
            StepDecision::Proceed
        } else {
            retry_or_abort(state, max_retries)
        }
    }
}

/// Policy used by Steps that do not set their own.
pub fn default_for(operation_type: OperationType) -> Arc<dyn StepPolicy> {
    match operation_type {
        OperationType::AddWorkers => Arc::new(TolerantPolicy::minority()),
        OperationType::RemoveNodes | OperationType::DestroyCluster => {
            Arc::new(TolerantPolicy::up_to(usize::MAX))
        }
        OperationType::CreateCluster | OperationType::DeployAddons | OperationType::Upgrade => {
            Arc::new(StrictPolicy::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(success: &[&str], failed: &[&str], timed_out: &[&str]) -> StepState {
        let mut s = StepState::new("join");
        s.attempts = 1;
        for n in success {
            s.classify(n, Disposition::Succeeded);
        }
        for n in failed {
            s.classify(n, Disposition::Failed("boom".into()));
        }
        for n in timed_out {
            s.classify(n, Disposition::TimedOut);
        }
        s
    }

    #[test]
    fn strict_aborts_with_summary() {
        let s = state(&["a"], &["b"], &["c"]);
        match StrictPolicy::default().on_complete(&s, 3, 0) {
            StepDecision::Abort(reason) => {
                assert_eq!(reason, "failed: b (boom); timed out: c");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn strict_retries_within_budget() {
        let mut s = state(&["a"], &["b"], &[]);
        assert_eq!(StrictPolicy::default().on_complete(&s, 2, 1), StepDecision::Retry);
        s.attempts = 2;
        assert!(matches!(
            StrictPolicy::default().on_complete(&s, 2, 1),
            StepDecision::Abort(_)
        ));
    }

    #[test]
    fn abort_on_first_failure_only_triggers_on_failures() {
        let policy = StrictPolicy {
            abort_on_first_failure: true,
        };
        let s = state(&["a"], &["b"], &[]);
        assert!(!policy.on_node_settled(&s, "a"));
        assert!(policy.on_node_settled(&s, "b"));
    }

    #[test]
    fn tolerant_minority_bound() {
        let policy = TolerantPolicy::minority();
        let one_of_three = state(&["a", "b"], &["c"], &[]);
        assert_eq!(policy.on_complete(&one_of_three, 3, 0), StepDecision::Proceed);

        let two_of_four = state(&["a", "b"], &["c"], &["d"]);
        assert!(matches!(
            policy.on_complete(&two_of_four, 4, 0),
            StepDecision::Abort(_)
        ));
    }

    #[test]
    fn tolerant_finalizes_after_consecutive_timeouts() {
        let policy = TolerantPolicy::minority().finalize_after(2);
        let s = StepState::new("x");
        assert_eq!(policy.on_timeout(&s, 1), TimeoutDecision::KeepWaiting);
        assert_eq!(policy.on_timeout(&s, 2), TimeoutDecision::Finalize);
        assert_eq!(
            StrictPolicy::default().on_timeout(&s, 10),
            TimeoutDecision::KeepWaiting
        );
    }
}
