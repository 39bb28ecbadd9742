//! Runnable-task selection with parent priority inheritance.
//!
//! A task is runnable when its status is `todo` or `approved` and every
//! dependency id maps to a `done` task (a dangling id never satisfies).
//! Ties break on *effective* priority: the highest priority (lowest
//! weight) found walking the `parent_id` chain upward, so an urgent
//! parent pulls its subtasks forward. Cycle-safe via a visited set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::maestro::task::{Task, TaskStatus};
use crate::maestro::task_store::TaskStore;

/// Selects the next runnable task from a store snapshot.
pub struct PriorityQueue {
    task_store: Arc<TaskStore>,
}

impl PriorityQueue {
    pub fn new(task_store: Arc<TaskStore>) -> Self {
        Self { task_store }
    }

    /// Minimum priority weight along the parent chain, starting from the
    /// task's own priority. Bails out safely on cycles and dangling
    /// parents.
    fn effective_priority_weight(task: &Task, task_map: &HashMap<&str, &Task>) -> u8 {
        let mut min_weight = task.priority.weight();
        let mut current = task;
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(parent_id) = current.parent_id.as_deref() {
            if !visited.insert(current.id.as_str()) {
                break;
            }
            let Some(parent) = task_map.get(parent_id) else {
                break;
            };
            min_weight = min_weight.min(parent.priority.weight());
            current = parent;
        }
        min_weight
    }

    /// All runnable tasks, sorted by `(effective_weight, created_at)`.
    pub async fn runnable_tasks(&self) -> Vec<Task> {
        let all_tasks = self.task_store.list_tasks(None, None).await;
        let task_map: HashMap<&str, &Task> =
            all_tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut runnable: Vec<&Task> = all_tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Todo | TaskStatus::Approved))
            .filter(|t| {
                t.dependencies.iter().all(|dep_id| {
                    task_map
                        .get(dep_id.as_str())
                        .map(|dep| dep.status == TaskStatus::Done)
                        .unwrap_or(false)
                })
            })
            .collect();

        runnable.sort_by_key(|t| (Self::effective_priority_weight(t, &task_map), t.created_at));
        runnable.into_iter().cloned().collect()
    }

    /// Head of the runnable queue, if any.
    pub async fn next_task(&self) -> Option<Task> {
        self.runnable_tasks().await.into_iter().next()
    }
}
