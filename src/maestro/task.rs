//! Task graph domain types.
//!
//! Tasks form a graph twice over: `parent_id` links build the subtask tree
//! used for priority inheritance and auto-completion, and `dependencies`
//! ids gate when a task becomes runnable. Both edge sets are by id only;
//! dangling ids are tolerated (a dangling dependency simply never
//! satisfies).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Blocked,
    WaitingApproval,
    Approved,
    Done,
    Failed,
    Cancelled,
    Paused,
    WaitingReview,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
            TaskStatus::WaitingReview => "waiting_review",
        };
        write!(f, "{}", s)
    }
}

impl TaskStatus {
    /// Terminal states that the scheduler never revisits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Parse a status string; `None` on anything unrecognized.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "todo" => Some(TaskStatus::Todo),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "waiting_approval" => Some(TaskStatus::WaitingApproval),
            "approved" => Some(TaskStatus::Approved),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "paused" => Some(TaskStatus::Paused),
            "waiting_review" => Some(TaskStatus::WaitingReview),
            _ => None,
        }
    }
}

/// Scheduling priority. Lower weight runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Scheduled,
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Sort weight: critical(0) < high < medium < low < scheduled(4).
    pub fn weight(&self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Medium => 2,
            TaskPriority::Low => 3,
            TaskPriority::Scheduled => 4,
        }
    }

    /// Parse a priority string, falling back to `Medium` on anything
    /// unrecognized (agent-supplied input is untrusted).
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "scheduled" => TaskPriority::Scheduled,
            "low" => TaskPriority::Low,
            "medium" => TaskPriority::Medium,
            "high" => TaskPriority::High,
            "critical" => TaskPriority::Critical,
            other => {
                log::warn!("invalid priority '{}', defaulting to medium", other);
                TaskPriority::Medium
            }
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Scheduled => "scheduled",
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// One node of the persistent task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    /// Advisory: whether completion should be reviewed before approval.
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_feedback: Option<String>,

    /// Free-form scratch space for agents and the scheduler
    /// (`pause_reason`, `blocked_reason`, `pending_permissions`, ...).
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

impl Task {
    /// New `todo` task with defaults matching the persistence format.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            parent_id: None,
            dependencies: Vec::new(),
            tags: Vec::new(),
            assigned_to: None,
            requires_review: false,
            review_feedback: None,
            context: HashMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            result_summary: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_assigned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_to = Some(agent_id.into());
        self
    }

    /// Snapshot serialized for event payloads.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Partial update applied through `TaskStore::update_task`.
///
/// `context` entries are merged into the existing map rather than
/// replacing it, so scheduler annotations never clobber agent scratch
/// state.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub parent_id: Option<Option<String>>,
    pub assigned_to: Option<Option<String>>,
    pub result_summary: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_result_summary(mut self, summary: impl Into<String>) -> Self {
        self.result_summary = Some(summary.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.parent_id.is_none()
            && self.assigned_to.is_none()
            && self.result_summary.is_none()
            && self.context.is_empty()
    }
}
