//! Live task status board.
//!
//! Written by event handlers from every task, read by the runner's
//! aggregation loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::engine::{TaskState, TaskStatus};

#[derive(Debug, Default)]
struct Board {
    order: Vec<String>,
    statuses: HashMap<String, TaskStatus>,
}

/// Thread-safe map of task id to latest status, kept in registration order.
#[derive(Clone, Debug, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Board>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, status: TaskStatus) {
        let mut board = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if !board.statuses.contains_key(&status.id) {
            board.order.push(status.id.clone());
        }
        board.statuses.insert(status.id.clone(), status);
    }

    /// Replaces the stored status. Unknown ids are registered.
    pub fn update(&self, status: TaskStatus) {
        self.register(status);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner
            .read()
            .ok()
            .and_then(|board| board.statuses.get(task_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|board| board.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All statuses in registration order.
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let board = self.inner.read().unwrap_or_else(|p| p.into_inner());
        board
            .order
            .iter()
            .filter_map(|id| board.statuses.get(id).cloned())
            .collect()
    }

    /// Per-state counts; every state is present.
    pub fn counts(&self) -> BTreeMap<TaskState, usize> {
        count_states(&self.snapshot())
    }

    pub fn all_terminal(&self) -> bool {
        let board = self.inner.read().unwrap_or_else(|p| p.into_inner());
        board.statuses.values().all(|status| status.state.is_terminal())
    }

    pub fn clear(&self) {
        let mut board = self.inner.write().unwrap_or_else(|p| p.into_inner());
        board.order.clear();
        board.statuses.clear();
    }
}

pub fn count_states(statuses: &[TaskStatus]) -> BTreeMap<TaskState, usize> {
    let mut counts: BTreeMap<TaskState, usize> =
        TaskState::ALL.iter().map(|state| (*state, 0)).collect();
    for status in statuses {
        *counts.entry(status.state).or_default() += 1;
    }
    counts
}
