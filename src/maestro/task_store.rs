//! Persistent task graph with atomic writes and change events.
//!
//! The [`TaskStore`] owns the task list; every other component holds it by
//! handle and mutates only through this API. Each mutation is applied in
//! memory, persisted with a write-to-temp-then-rename replace in the same
//! directory, and announced on the event bus. The in-memory state stays
//! authoritative when persistence fails: the mutation and its events still
//! happen, and the caller gets the I/O error.
//!
//! On-disk format: one pretty-printed JSON array of task objects, UTF-8,
//! timestamps as ISO-8601 strings. A file that fails to parse is left in
//! place and the store starts empty.

use serde_json::json;
use std::error::Error;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::maestro::event::{Event, EventBus, EventType};
use crate::maestro::task::{Task, TaskPatch, TaskPriority, TaskStatus};

/// Errors reported by store mutations.
#[derive(Debug)]
pub enum TaskStoreError {
    /// No task with the given id.
    NotFound(String),
    /// The mutation applied in memory but could not be persisted.
    Io(std::io::Error),
}

impl fmt::Display for TaskStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStoreError::NotFound(id) => write!(f, "task not found: {}", id),
            TaskStoreError::Io(err) => write!(f, "task persistence failed: {}", err),
        }
    }
}

impl Error for TaskStoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TaskStoreError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TaskStoreError {
    fn from(err: std::io::Error) -> Self {
        TaskStoreError::Io(err)
    }
}

/// Persistent, event-publishing task store.
pub struct TaskStore {
    storage_path: PathBuf,
    event_bus: Arc<EventBus>,
    tasks: Mutex<Vec<Task>>,
}

impl TaskStore {
    /// Open a store backed by `storage_path`, loading any existing tasks.
    /// Load failures are logged and leave the store empty; the broken file
    /// is not touched until the next successful save.
    pub fn open(storage_path: impl Into<PathBuf>, event_bus: Arc<EventBus>) -> Self {
        let storage_path = storage_path.into();
        let tasks = Self::load(&storage_path);
        Self {
            storage_path,
            event_bus,
            tasks: Mutex::new(tasks),
        }
    }

    fn load(path: &Path) -> Vec<Task> {
        if !path.exists() {
            log::info!(
                "task file {} not found, starting with empty store",
                path.display()
            );
            return Vec::new();
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Vec<Task>>(&raw) {
                Ok(tasks) => {
                    log::info!("loaded {} tasks from {}", tasks.len(), path.display());
                    tasks
                }
                Err(err) => {
                    log::error!("failed to parse {}: {}", path.display(), err);
                    Vec::new()
                }
            },
            Err(err) => {
                log::error!("failed to read {}: {}", path.display(), err);
                Vec::new()
            }
        }
    }

    /// Atomic replace: temp file in the same directory, write, flush,
    /// rename over the target.
    fn save(&self, tasks: &[Task]) -> std::io::Result<()> {
        let dir = self
            .storage_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let raw = serde_json::to_string_pretty(tasks)?;
        tmp.write_all(raw.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.storage_path)
            .map_err(|persist_err| persist_err.error)?;
        Ok(())
    }

    fn save_and_report(&self, tasks: &[Task]) -> Result<(), TaskStoreError> {
        self.save(tasks).map_err(|err| {
            log::error!(
                "failed to save tasks to {}: {}",
                self.storage_path.display(),
                err
            );
            TaskStoreError::Io(err)
        })
    }

    fn publish_status_events(&self, task: &Task, old_status: TaskStatus) {
        self.event_bus.publish(Event::from_source(
            EventType::TaskStatusChanged,
            json!({
                "task_id": task.id,
                "old_status": old_status,
                "new_status": task.status,
            }),
            "task_store",
        ));
        match task.status {
            TaskStatus::Done => self.event_bus.publish(Event::from_source(
                EventType::TaskCompleted,
                task.snapshot(),
                "task_store",
            )),
            TaskStatus::Failed => self.event_bus.publish(Event::from_source(
                EventType::TaskFailed,
                task.snapshot(),
                "task_store",
            )),
            _ => {}
        }
    }

    /// Insert a new task and publish `task_created` with its snapshot.
    pub async fn add_task(&self, task: Task) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.lock().await;
        tasks.push(task.clone());
        log::info!("task added: {} ({})", task.title, task.id);
        let save = self.save_and_report(&tasks);
        drop(tasks);

        self.event_bus.publish(Event::from_source(
            EventType::TaskCreated,
            task.snapshot(),
            "task_store",
        ));
        save.map(|()| task)
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.lock().await.iter().find(|t| t.id == id).cloned()
    }

    /// Coherent snapshot of all tasks, optionally filtered.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        priority: Option<TaskPriority>,
    ) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| priority.map_or(true, |p| t.priority == p))
            .cloned()
            .collect()
    }

    /// Change a task's status, publishing `task_status_changed` plus
    /// `task_completed`/`task_failed` on terminal success/failure.
    pub async fn update_status(
        &self,
        id: &str,
        new_status: TaskStatus,
    ) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;

        let old_status = task.status;
        task.status = new_status;
        task.updated_at = chrono::Utc::now();
        if new_status == TaskStatus::Done && task.completed_at.is_none() {
            task.completed_at = Some(task.updated_at);
        }
        let snapshot = task.clone();
        log::info!(
            "task '{}' status {} -> {}",
            snapshot.title,
            old_status,
            new_status
        );
        let save = self.save_and_report(&tasks);
        drop(tasks);

        self.publish_status_events(&snapshot, old_status);
        save.map(|()| snapshot)
    }

    /// Apply a partial update in one shot. Publishes a single
    /// `task_updated` event listing the changed fields, plus the status
    /// event pair when the status changed. Context keys are merged, not
    /// replaced.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;

        let old_status = task.status;
        let mut changed: Vec<&'static str> = Vec::new();

        if let Some(title) = patch.title {
            if task.title != title {
                task.title = title;
                changed.push("title");
            }
        }
        if let Some(description) = patch.description {
            if task.description.as_deref() != Some(description.as_str()) {
                task.description = Some(description);
                changed.push("description");
            }
        }
        if let Some(priority) = patch.priority {
            if task.priority != priority {
                task.priority = priority;
                changed.push("priority");
            }
        }
        if let Some(status) = patch.status {
            if task.status != status {
                task.status = status;
                changed.push("status");
            }
        }
        if let Some(parent_id) = patch.parent_id {
            if task.parent_id != parent_id {
                task.parent_id = parent_id;
                changed.push("parent_id");
            }
        }
        if let Some(assigned_to) = patch.assigned_to {
            if task.assigned_to != assigned_to {
                task.assigned_to = assigned_to;
                changed.push("assigned_to");
            }
        }
        if let Some(summary) = patch.result_summary {
            if task.result_summary.as_deref() != Some(summary.as_str()) {
                task.result_summary = Some(summary);
                changed.push("result_summary");
            }
        }
        if !patch.context.is_empty() {
            task.context.extend(patch.context);
            changed.push("context");
        }

        if changed.is_empty() {
            return Ok(task.clone());
        }

        task.updated_at = chrono::Utc::now();
        if task.status == TaskStatus::Done && task.completed_at.is_none() {
            task.completed_at = Some(task.updated_at);
        }
        let snapshot = task.clone();
        log::info!("task {} updated: {:?}", snapshot.id, changed);
        let save = self.save_and_report(&tasks);
        drop(tasks);

        self.event_bus.publish(Event::from_source(
            EventType::TaskUpdated,
            json!({"task_id": snapshot.id, "changes": changed}),
            "task_store",
        ));
        if changed.contains(&"status") {
            self.publish_status_events(&snapshot, old_status);
        }
        save.map(|()| snapshot)
    }

    /// Add a dependency edge (idempotent).
    pub async fn add_dependency(
        &self,
        id: &str,
        dependency_id: &str,
    ) -> Result<Task, TaskStoreError> {
        self.mutate_dependencies(id, dependency_id, true).await
    }

    /// Remove a dependency edge (idempotent).
    pub async fn remove_dependency(
        &self,
        id: &str,
        dependency_id: &str,
    ) -> Result<Task, TaskStoreError> {
        self.mutate_dependencies(id, dependency_id, false).await
    }

    async fn mutate_dependencies(
        &self,
        id: &str,
        dependency_id: &str,
        add: bool,
    ) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;

        let present = task.dependencies.iter().any(|d| d == dependency_id);
        let changed = if add && !present && id != dependency_id {
            task.dependencies.push(dependency_id.to_string());
            true
        } else if !add && present {
            task.dependencies.retain(|d| d != dependency_id);
            true
        } else {
            false
        };

        if !changed {
            return Ok(task.clone());
        }

        task.updated_at = chrono::Utc::now();
        let snapshot = task.clone();
        let save = self.save_and_report(&tasks);
        drop(tasks);

        self.event_bus.publish(Event::from_source(
            EventType::TaskUpdated,
            json!({
                "task_id": snapshot.id,
                "field": "dependencies",
                "action": if add { "added" } else { "removed" },
                "dependency_id": dependency_id,
            }),
            "task_store",
        ));
        save.map(|()| snapshot)
    }

    /// Delete a task, clearing `parent_id` on its children and removing
    /// its id from every other task's dependency list. The cascade emits
    /// one `task_deleted` event and nothing else.
    pub async fn delete_task(&self, id: &str) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.iter().any(|t| t.id == id) {
            return Err(TaskStoreError::NotFound(id.to_string()));
        }

        for task in tasks.iter_mut() {
            task.dependencies.retain(|d| d != id);
            if task.parent_id.as_deref() == Some(id) {
                task.parent_id = None;
            }
        }
        tasks.retain(|t| t.id != id);
        log::info!("task deleted: {}", id);
        let save = self.save_and_report(&tasks);
        drop(tasks);

        self.event_bus.publish(Event::from_source(
            EventType::TaskDeleted,
            json!({"task_id": id}),
            "task_store",
        ));
        save
    }

    /// Direct children of `parent_id`.
    pub async fn get_subtasks(&self, parent_id: &str) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    /// Tasks this task depends on (dangling ids are skipped).
    pub async fn get_dependencies(&self, id: &str) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let Some(task) = tasks.iter().find(|t| t.id == id) else {
            return Vec::new();
        };
        task.dependencies
            .iter()
            .filter_map(|dep_id| tasks.iter().find(|t| &t.id == dep_id).cloned())
            .collect()
    }

    /// Tasks that depend on this task.
    pub async fn get_dependents(&self, id: &str) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .cloned()
            .collect()
    }

    /// Where the store persists to.
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }
}
