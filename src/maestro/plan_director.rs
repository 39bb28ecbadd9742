//! Event-driven task scheduler with watchdog supervision.
//!
//! The [`PlanDirector`] consumes task lifecycle events and drives at most
//! `max_concurrent_tasks` runnable tasks through agent-backed execution.
//! Each tracked run is supervised twice over: the chunk loop refreshes an
//! activity timestamp on every streamed chunk and counts tool calls, and a
//! periodic watchdog sweep fails any run that goes inactive, overruns its
//! absolute time budget, or exceeds the tool-call cap. Failed runs land in
//! `blocked` with a `context.blocked_reason`; there is no automatic retry.
//!
//! On startup the director also recovers zombies: any task still marked
//! `in_progress` from a previous process life is parked in `paused` with
//! `context.pause_reason = "system restart cleanup"`.

use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::maestro::agent::{Agent, AgentStream};
use crate::maestro::agent_manager::AgentManager;
use crate::maestro::event::{Event, EventBus, EventType};
use crate::maestro::priority_queue::PriorityQueue;
use crate::maestro::task::{Task, TaskPatch, TaskStatus};
use crate::maestro::task_store::TaskStore;
use crate::maestro::types::StreamChunk;

/// Watchdog timeouts and concurrency limits.
#[derive(Debug, Clone)]
pub struct PlanDirectorConfig {
    /// Maximum tasks driven concurrently.
    pub max_concurrent_tasks: usize,
    /// Fail a run that produces no chunks for this long.
    pub inactivity_timeout: Duration,
    /// Fail a run that exceeds this wall-clock budget.
    pub max_total_time: Duration,
    /// Fail a run that makes more tool calls than this.
    pub max_tool_calls: u32,
    /// How often the watchdog sweeps the trackers.
    pub watchdog_interval: Duration,
}

impl Default for PlanDirectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 1,
            inactivity_timeout: Duration::from_secs(240),
            max_total_time: Duration::from_secs(900),
            max_tool_calls: 100,
            watchdog_interval: Duration::from_secs(45),
        }
    }
}

/// Per-run supervision state.
struct TaskTracker {
    start_time: Instant,
    last_activity: Instant,
    tool_calls: u32,
    title: String,
}

impl TaskTracker {
    fn new(title: String) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_activity: now,
            tool_calls: 0,
            title,
        }
    }
}

struct DirectorInner {
    config: PlanDirectorConfig,
    event_bus: Arc<EventBus>,
    task_store: Arc<TaskStore>,
    queue: PriorityQueue,
    agents: Arc<AgentManager>,
    default_agent_id: String,
    processing: Mutex<HashMap<String, TaskTracker>>,
    running: AtomicBool,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// Drives runnable tasks through agents, bounded and supervised.
///
/// Cheap to clone; clones share one scheduler.
#[derive(Clone)]
pub struct PlanDirector {
    inner: Arc<DirectorInner>,
}

impl PlanDirector {
    pub fn new(
        config: PlanDirectorConfig,
        event_bus: Arc<EventBus>,
        task_store: Arc<TaskStore>,
        agents: Arc<AgentManager>,
        default_agent_id: impl Into<String>,
    ) -> Self {
        let queue = PriorityQueue::new(Arc::clone(&task_store));
        Self {
            inner: Arc::new(DirectorInner {
                config,
                event_bus,
                task_store,
                queue,
                agents,
                default_agent_id: default_agent_id.into(),
                processing: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to task lifecycle events, start the watchdog, and recover
    /// zombie tasks. Idempotent.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("plan director starting");

        for event_type in [
            EventType::TaskCreated,
            EventType::TaskStatusChanged,
            EventType::TaskCompleted,
            EventType::TaskFailed,
        ] {
            let director = self.clone();
            self.inner
                .event_bus
                .subscribe_fn(event_type, move |_event: Event| {
                    let director = director.clone();
                    async move {
                        director.process_queue().await;
                        Ok(())
                    }
                });
        }

        let director = self.clone();
        let handle = tokio::spawn(async move {
            director.watchdog_loop().await;
        });
        *self.inner.watchdog.lock().await = Some(handle);

        self.cleanup_zombie_tasks().await;
        log::info!("plan director started");
    }

    /// Stop scheduling and cancel the watchdog. In-flight agent runs are
    /// left to finish; their trackers are already unsupervised.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.watchdog.lock().await.take() {
            handle.abort();
        }
        log::info!("plan director stopped");
    }

    /// Number of runs currently tracked (always `<= max_concurrent_tasks`
    /// for runs started by this director).
    pub async fn processing_count(&self) -> usize {
        self.inner.processing.lock().await.len()
    }

    /// Park orphaned `in_progress` tasks from a previous process life.
    async fn cleanup_zombie_tasks(&self) {
        for task in self
            .inner
            .task_store
            .list_tasks(Some(TaskStatus::InProgress), None)
            .await
        {
            log::warn!("recovering zombie task '{}' ({})", task.title, task.id);
            let patch = TaskPatch::status(TaskStatus::Paused)
                .with_context("pause_reason", json!("system restart cleanup"));
            if let Err(err) = self.inner.task_store.update_task(&task.id, patch).await {
                log::error!("zombie recovery failed for {}: {}", task.id, err);
            }
        }
    }

    /// Pull the next runnable task and launch it, respecting the
    /// concurrency bound. Called from every task lifecycle event and after
    /// every finished run.
    pub fn process_queue(&self) -> futures_util::future::BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.inner.running.load(Ordering::SeqCst) {
                return;
            }

            let next = {
                let mut processing = self.inner.processing.lock().await;
                if processing.len() >= self.inner.config.max_concurrent_tasks {
                    return;
                }
                let Some(task) = self.inner.queue.next_task().await else {
                    return;
                };
                if processing.contains_key(&task.id) {
                    return;
                }
                processing.insert(task.id.clone(), TaskTracker::new(task.title.clone()));
                task
            };

            log::info!("processing next task: {} ({})", next.title, next.id);
            let director = self.clone();
            tokio::spawn(async move {
                director.run_task(next).await;
            });
        })
    }

    fn task_prompt(task: &Task) -> String {
        format!(
            "Task: '{}' (ID: {})\nDescription: {}\nStatus: {}\n\n\
             Analyze and act. Move the task out of 'todo' to 'in_progress', \
             'waiting_approval', or 'blocked'.",
            task.title,
            task.id,
            task.description.as_deref().unwrap_or("None"),
            task.status
        )
    }

    async fn agent_for(&self, task: &Task) -> Option<Arc<Agent>> {
        if let Some(assigned) = task.assigned_to.as_deref() {
            if let Some(agent) = self.inner.agents.get(Some(assigned)).await {
                log::info!("task {} assigned to agent '{}'", task.id, assigned);
                return Some(agent);
            }
            log::warn!(
                "task {} assigned to unknown agent '{}', using default",
                task.id,
                assigned
            );
        }
        self.inner.agents.get(Some(&self.inner.default_agent_id)).await
    }

    /// Drive one task through its agent, then verify, deregister, and
    /// re-enter the queue.
    async fn run_task(&self, task: Task) {
        let task_id = task.id.clone();

        match self.agent_for(&task).await {
            Some(agent) => {
                let prompt = Self::task_prompt(&task);
                self.consume_stream(&task, agent.stream(&prompt)).await;
            }
            None => {
                self.handle_processing_failure(&task_id, "no agent available for task")
                    .await;
            }
        }

        self.inner.processing.lock().await.remove(&task_id);
        self.verify_and_cleanup(&task_id).await;
        self.process_queue().await;
    }

    async fn consume_stream(&self, task: &Task, mut stream: AgentStream) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let mut over_cap = false;
                    {
                        let mut processing = self.inner.processing.lock().await;
                        if let Some(tracker) = processing.get_mut(&task.id) {
                            tracker.last_activity = Instant::now();
                            if matches!(chunk, StreamChunk::ToolCall(_)) {
                                tracker.tool_calls += 1;
                                over_cap = tracker.tool_calls > self.inner.config.max_tool_calls;
                            }
                        }
                    }
                    if over_cap {
                        self.handle_processing_failure(
                            &task.id,
                            "Watchdog: Tool call limit exceeded",
                        )
                        .await;
                        break;
                    }

                    if let StreamChunk::PermissionRequest(calls) = &chunk {
                        let tool_names: Vec<String> =
                            calls.iter().map(|c| c.name.clone()).collect();
                        log::info!(
                            "task {} requesting permission for: {:?}",
                            task.id,
                            tool_names
                        );
                        let patch = TaskPatch::status(TaskStatus::WaitingApproval)
                            .with_context("pending_permissions", json!(tool_names));
                        if let Err(err) = self.inner.task_store.update_task(&task.id, patch).await
                        {
                            log::error!("failed to suspend task {}: {}", task.id, err);
                        }
                        self.inner.event_bus.publish(Event::from_source(
                            EventType::PlanUpdated,
                            json!({
                                "task_id": task.id,
                                "title": task.title,
                                "pending_permissions": tool_names,
                            }),
                            "plan_director",
                        ));
                        break;
                    }
                }
                Err(err) => {
                    self.handle_processing_failure(&task.id, &format!("agent crashed: {}", err))
                        .await;
                    break;
                }
            }
        }
    }

    /// Post-run safety net per the scheduler state machine.
    async fn verify_and_cleanup(&self, task_id: &str) {
        let Some(task) = self.inner.task_store.get_task(task_id).await else {
            return;
        };
        if task.status != TaskStatus::InProgress {
            return;
        }

        let subtasks = self.inner.task_store.get_subtasks(task_id).await;
        if subtasks.is_empty() {
            if task.assigned_to.is_none() {
                log::warn!("safety net: pausing '{}', no subtasks or agent", task.title);
                let patch = TaskPatch::status(TaskStatus::Paused)
                    .with_context("pause_reason", json!("no subtasks/agent assigned"));
                if let Err(err) = self.inner.task_store.update_task(task_id, patch).await {
                    log::error!("safety-net pause failed for {}: {}", task_id, err);
                }
            }
            return;
        }

        if subtasks.iter().all(|st| st.status == TaskStatus::Done) {
            let patch = TaskPatch::status(TaskStatus::Done)
                .with_result_summary("auto-complete: all subtasks finished");
            if let Err(err) = self.inner.task_store.update_task(task_id, patch).await {
                log::error!("auto-complete failed for {}: {}", task_id, err);
            }
        } else if subtasks.iter().any(|st| st.status == TaskStatus::Blocked) {
            if let Err(err) = self
                .inner
                .task_store
                .update_task(task_id, TaskPatch::status(TaskStatus::Blocked))
                .await
            {
                log::error!("blocked propagation failed for {}: {}", task_id, err);
            }
        }
    }

    /// Shared failure path: the task lands in `blocked` with the reason
    /// recorded, and no retry is attempted.
    async fn handle_processing_failure(&self, task_id: &str, reason: &str) {
        let Some(task) = self.inner.task_store.get_task(task_id).await else {
            return;
        };
        log::error!("task failure '{}': {}", task.title, reason);
        let patch = TaskPatch::status(TaskStatus::Blocked)
            .with_context("blocked_reason", json!(reason));
        if let Err(err) = self.inner.task_store.update_task(task_id, patch).await {
            log::error!("failed to mark task {} blocked: {}", task_id, err);
        }
    }

    /// Periodic sweep over the trackers.
    async fn watchdog_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.watchdog_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        while self.inner.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            let now = Instant::now();

            let expired: Vec<(String, String, f64)> = {
                let mut processing = self.inner.processing.lock().await;
                let mut expired = Vec::new();
                processing.retain(|task_id, tracker| {
                    let elapsed = now.duration_since(tracker.start_time);
                    let inactive = now.duration_since(tracker.last_activity);
                    let reason = if inactive > self.inner.config.inactivity_timeout {
                        Some("Inactivity Timeout")
                    } else if elapsed > self.inner.config.max_total_time {
                        Some("Absolute Timeout")
                    } else {
                        None
                    };
                    match reason {
                        Some(reason) => {
                            log::warn!(
                                "watchdog expiring '{}' ({}): {}",
                                tracker.title,
                                task_id,
                                reason
                            );
                            expired.push((
                                task_id.clone(),
                                reason.to_string(),
                                elapsed.as_secs_f64(),
                            ));
                            false
                        }
                        None => true,
                    }
                });
                expired
            };

            for (task_id, reason, elapsed) in expired {
                self.handle_processing_failure(&task_id, &format!("Watchdog: {}", reason))
                    .await;
                let patch =
                    TaskPatch::default().with_context("elapsed_seconds", json!(elapsed));
                if let Err(err) = self.inner.task_store.update_task(&task_id, patch).await {
                    log::error!("failed to annotate expired task {}: {}", task_id, err);
                }
            }
        }
    }
}
