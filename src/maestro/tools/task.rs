//! Task graph tools.
//!
//! These are how agents drive the task store: creating work, moving it
//! through statuses, and inspecting the graph. Errors come back as plain
//! `{"status": "error"}` payloads so the model can recover on its next
//! turn instead of crashing the loop.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::maestro::task::{Task, TaskPriority, TaskStatus};
use crate::maestro::task_store::TaskStore;
use crate::maestro::tool_registry::{Tool, ToolOutput, ToolRegistry};
use crate::maestro::types::ToolError;

fn error_payload(message: impl Into<String>) -> Value {
    json!({"status": "error", "error": message.into()})
}

fn task_summary(task: &Task) -> Value {
    json!({
        "id": task.id,
        "title": task.title,
        "status": task.status,
        "priority": task.priority,
        "parent_id": task.parent_id,
        "dependencies": task.dependencies,
        "assigned_to": task.assigned_to,
    })
}

/// `add_task`: create a task, optionally parented, prioritized, and gated
/// on dependencies.
pub struct AddTaskTool {
    store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for AddTaskTool {
    fn name(&self) -> &str {
        "add_task"
    }

    fn description(&self) -> &str {
        "Create a new task in the task store. Supports priority, parent task, dependencies, and agent assignment."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "description": "Short imperative task title"},
                "description": {"type": "string", "description": "What needs to be done"},
                "priority": {
                    "type": "string",
                    "description": "One of: critical, high, medium, low, scheduled"
                },
                "parent_id": {"type": "string", "description": "Id of the parent task, if this is a subtask"},
                "dependencies": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Task ids that must be done before this one can run"
                },
                "assigned_to": {"type": "string", "description": "Agent id that should execute this task"}
            },
            "required": ["title"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let Some(title) = arguments.get("title").and_then(|v| v.as_str()) else {
            return Ok(error_payload("'title' is required"));
        };

        let mut task = Task::new(title);
        if let Some(description) = arguments.get("description").and_then(|v| v.as_str()) {
            task = task.with_description(description);
        }
        if let Some(priority) = arguments.get("priority").and_then(|v| v.as_str()) {
            task = task.with_priority(TaskPriority::parse_lenient(priority));
        }
        if let Some(parent_id) = arguments.get("parent_id").and_then(|v| v.as_str()) {
            task = task.with_parent(parent_id);
        }
        if let Some(deps) = arguments.get("dependencies").and_then(|v| v.as_array()) {
            let deps: Vec<String> = deps
                .iter()
                .filter_map(|d| d.as_str().map(str::to_string))
                .collect();
            task = task.with_dependencies(deps);
        }
        if let Some(assigned_to) = arguments.get("assigned_to").and_then(|v| v.as_str()) {
            task = task.with_assigned_to(assigned_to);
        }

        match self.store.add_task(task).await {
            Ok(created) => Ok(json!({"status": "success", "task": task_summary(&created)})),
            Err(err) => Ok(error_payload(err.to_string())),
        }
    }
}

/// `update_task_status`: move a task through its lifecycle.
pub struct UpdateTaskStatusTool {
    store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for UpdateTaskStatusTool {
    fn name(&self) -> &str {
        "update_task_status"
    }

    fn description(&self) -> &str {
        "Change the status of an existing task (todo, in_progress, blocked, waiting_approval, approved, done, failed, cancelled, paused, waiting_review)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {"type": "string"},
                "status": {"type": "string", "description": "The new status"}
            },
            "required": ["task_id", "status"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let (Some(task_id), Some(raw_status)) = (
            arguments.get("task_id").and_then(|v| v.as_str()),
            arguments.get("status").and_then(|v| v.as_str()),
        ) else {
            return Ok(error_payload("'task_id' and 'status' are required"));
        };
        let Some(status) = TaskStatus::parse(raw_status) else {
            return Ok(error_payload(format!("invalid status '{}'", raw_status)));
        };

        match self.store.update_status(task_id, status).await {
            Ok(task) => Ok(json!({"status": "success", "task": task_summary(&task)})),
            Err(err) => Ok(error_payload(err.to_string())),
        }
    }
}

/// `list_tasks`: inspect the graph, optionally filtered by status.
pub struct ListTasksTool {
    store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List tasks in the task store, optionally filtered by status."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "description": "Only return tasks in this status"}
            }
        })
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let status = match arguments.get("status").and_then(|v| v.as_str()) {
            Some(raw) => match TaskStatus::parse(raw) {
                Some(status) => Some(status),
                None => return Ok(error_payload(format!("invalid status '{}'", raw))),
            },
            None => None,
        };
        let tasks = self.store.list_tasks(status, None).await;
        let summaries: Vec<Value> = tasks.iter().map(task_summary).collect();
        Ok(json!({"status": "success", "count": summaries.len(), "tasks": summaries}))
    }
}

/// `get_task`: full snapshot of one task.
pub struct GetTaskTool {
    store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for GetTaskTool {
    fn name(&self) -> &str {
        "get_task"
    }

    fn description(&self) -> &str {
        "Fetch the full state of one task by id."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"task_id": {"type": "string"}},
            "required": ["task_id"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let Some(task_id) = arguments.get("task_id").and_then(|v| v.as_str()) else {
            return Ok(error_payload("'task_id' is required"));
        };
        match self.store.get_task(task_id).await {
            Some(task) => Ok(json!({"status": "success", "task": task.snapshot()})),
            None => Ok(error_payload(format!("task not found: {}", task_id))),
        }
    }
}

/// `delete_task`: remove a task; the store cascades the graph cleanup.
pub struct DeleteTaskTool {
    store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for DeleteTaskTool {
    fn name(&self) -> &str {
        "delete_task"
    }

    fn description(&self) -> &str {
        "Delete a task. Children lose their parent link and other tasks drop it from their dependencies."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"task_id": {"type": "string"}},
            "required": ["task_id"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let Some(task_id) = arguments.get("task_id").and_then(|v| v.as_str()) else {
            return Ok(error_payload("'task_id' is required"));
        };
        match self.store.delete_task(task_id).await {
            Ok(()) => Ok(json!({"status": "success", "deleted": task_id})),
            Err(err) => Ok(error_payload(err.to_string())),
        }
    }
}

/// Register the full task tool suite against `store`.
pub async fn register_task_tools(
    registry: &Arc<RwLock<ToolRegistry>>,
    store: Arc<TaskStore>,
) -> Result<(), ToolError> {
    let mut registry = registry.write().await;
    registry.register(Arc::new(AddTaskTool {
        store: Arc::clone(&store),
    }))?;
    registry.register(Arc::new(UpdateTaskStatusTool {
        store: Arc::clone(&store),
    }))?;
    registry.register(Arc::new(ListTasksTool {
        store: Arc::clone(&store),
    }))?;
    registry.register(Arc::new(GetTaskTool {
        store: Arc::clone(&store),
    }))?;
    registry.register(Arc::new(DeleteTaskTool { store }))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maestro::event::EventBus;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, Arc<TaskStore>, Arc<RwLock<ToolRegistry>>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(
            dir.path().join("tasks.json"),
            Arc::new(EventBus::new()),
        ));
        let registry = Arc::new(RwLock::new(ToolRegistry::new()));
        register_task_tools(&registry, Arc::clone(&store))
            .await
            .unwrap();
        (dir, store, registry)
    }

    #[tokio::test]
    async fn test_add_then_update_then_list() {
        let (_dir, store, registry) = fixture().await;
        let registry = registry.read().await;

        let add = registry.get("add_task").unwrap();
        let created = add
            .execute(json!({
                "title": "write docs",
                "priority": "high",
                "description": "user guide"
            }))
            .await
            .unwrap();
        assert_eq!(created["status"], "success");
        let task_id = created["task"]["id"].as_str().unwrap().to_string();

        let update = registry.get("update_task_status").unwrap();
        let updated = update
            .execute(json!({"task_id": task_id, "status": "done"}))
            .await
            .unwrap();
        assert_eq!(updated["task"]["status"], "done");

        let list = registry.get("list_tasks").unwrap();
        let listed = list.execute(json!({"status": "done"})).await.unwrap();
        assert_eq!(listed["count"], 1);

        assert_eq!(store.get_task(&task_id).await.unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_invalid_inputs_surface_as_error_payloads() {
        let (_dir, _store, registry) = fixture().await;
        let registry = registry.read().await;

        let update = registry.get("update_task_status").unwrap();
        let bad_status = update
            .execute(json!({"task_id": "x", "status": "nonsense"}))
            .await
            .unwrap();
        assert_eq!(bad_status["status"], "error");

        let get = registry.get("get_task").unwrap();
        let missing = get.execute(json!({"task_id": "ghost"})).await.unwrap();
        assert_eq!(missing["status"], "error");
    }

    #[tokio::test]
    async fn test_delete_task_tool() {
        let (_dir, store, registry) = fixture().await;
        let task = store.add_task(Task::new("doomed")).await.unwrap();

        let registry = registry.read().await;
        let delete = registry.get("delete_task").unwrap();
        let out = delete.execute(json!({"task_id": task.id})).await.unwrap();
        assert_eq!(out["status"], "success");
        assert!(store.get_task(&task.id).await.is_none());
    }
}
