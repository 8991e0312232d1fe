//! Per-rule lifecycle tracking.

use execsentry_lib::models::RuleId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// Lifecycle of one rule evaluator. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    /// Registered with its matcher, not attached to the bus
    Created,
    /// Subscription exists and the evaluator task has been spawned
    Subscribed,
    /// Waiting on events or the shutdown signal
    Running,
    /// Shutdown or queue close observed; no new events are pulled
    Draining,
    /// Terminal; subscription released
    Stopped,
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleState::Created => write!(f, "created"),
            RuleState::Subscribed => write!(f, "subscribed"),
            RuleState::Running => write!(f, "running"),
            RuleState::Draining => write!(f, "draining"),
            RuleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared table of rule states.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    states: RwLock<HashMap<RuleId, RuleState>>,
}

impl LifecycleTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rule in the `Created` state. Existing entries are kept.
    pub fn track(&self, rule_id: &RuleId) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(rule_id.clone())
            .or_insert(RuleState::Created);
    }

    /// Move a rule forward to `next`.
    ///
    /// Returns `false` and leaves the state alone for unknown rules and for
    /// transitions that would not move forward.
    pub fn advance(&self, rule_id: &RuleId, next: RuleState) -> bool {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = states.get_mut(rule_id) else {
            warn!(rule_id = %rule_id, new_state = ?next, "State change for untracked rule");
            return false;
        };

        let old = *current;
        if next <= old {
            warn!(
                rule_id = %rule_id,
                old_state = ?old,
                new_state = ?next,
                "Rejected backwards state change"
            );
            return false;
        }

        *current = next;
        debug!(rule_id = %rule_id, old_state = ?old, new_state = ?next, "Rule state changed");
        true
    }

    /// Current state of one rule.
    pub fn state(&self, rule_id: &RuleId) -> Option<RuleState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rule_id)
            .copied()
    }

    /// All tracked rules and their states, ordered by rule id.
    pub fn snapshot(&self) -> Vec<(RuleId, RuleState)> {
        let mut snapshot: Vec<(RuleId, RuleState)> = self
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Number of rules currently in `state`.
    pub fn count_in(&self, state: RuleState) -> usize {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| **s == state)
            .count()
    }
}
