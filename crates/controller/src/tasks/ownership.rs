//! Run ownership index
//!
//! Maps each run identity to the Jobs it submitted and whether their dispatch slot has
//! already been handed back. The lifecycle watcher asks this index instead of comparing
//! labels, so foreign Jobs are dropped with a single lookup and a slot is released at
//! most once per Job no matter how often the Job is observed.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use super::types::{RunIdentity, TaskKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Submitted (or about to be); holds a dispatch slot.
    Claimed,
    /// Slot handed back to the dispatcher.
    Released,
}

#[derive(Debug, Clone, Default)]
pub struct OwnershipIndex {
    runs: Arc<DashMap<RunIdentity, HashMap<TaskKey, SlotState>>>,
}

impl OwnershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `run` owns `task`. Claiming an already known task keeps its state.
    pub fn claim(&self, run: &RunIdentity, task: TaskKey) {
        self.runs
            .entry(run.clone())
            .or_default()
            .entry(task)
            .or_insert(SlotState::Claimed);
    }

    pub fn is_owned(&self, run: &RunIdentity, task: &TaskKey) -> bool {
        self.state(run, task).is_some()
    }

    pub fn state(&self, run: &RunIdentity, task: &TaskKey) -> Option<SlotState> {
        self.runs
            .get(run)
            .and_then(|tasks| tasks.get(task).copied())
    }

    /// Mark the task's slot as released. Returns `true` only for the first release of an
    /// owned task; the caller emits a completion signal exactly when this returns `true`.
    pub fn release(&self, run: &RunIdentity, task: &TaskKey) -> bool {
        let Some(mut tasks) = self.runs.get_mut(run) else {
            return false;
        };
        match tasks.get_mut(task) {
            Some(state @ SlotState::Claimed) => {
                *state = SlotState::Released;
                true
            }
            _ => false,
        }
    }

    pub fn owned_count(&self, run: &RunIdentity) -> usize {
        self.runs.get(run).map_or(0, |tasks| tasks.len())
    }

    pub fn released_count(&self, run: &RunIdentity) -> usize {
        self.runs.get(run).map_or(0, |tasks| {
            tasks
                .values()
                .filter(|state| **state == SlotState::Released)
                .count()
        })
    }

    /// Drop everything recorded for a finished run.
    pub fn forget(&self, run: &RunIdentity) {
        self.runs.remove(run);
    }
}
