//! Scheduler integration: concurrency bound, watchdog expiry, permission
//! suspension, and crash handling, all against real stores and buses with
//! millisecond-scale timings.

use async_trait::async_trait;
use maestro::agent::Agent;
use maestro::agent_manager::{AgentConfig, AgentFactory, AgentManager};
use maestro::event::{Event, EventBus, EventType};
use maestro::execution_engine::ExecutionEngine;
use maestro::memory::Memory;
use maestro::plan_director::{PlanDirector, PlanDirectorConfig};
use maestro::provider::{Provider, ProviderStream};
use maestro::task::{Task, TaskStatus};
use maestro::task_store::TaskStore;
use maestro::tool_registry::{ToolDefinition, ToolRegistry};
use maestro::types::{AgentResponse, ConfigError, Message, ProviderError, StreamChunk, ToolCall};
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Factory that hands every agent the same canned provider.
struct FixedProviderFactory {
    provider: Arc<dyn Provider>,
    event_bus: Arc<EventBus>,
}

impl AgentFactory for FixedProviderFactory {
    fn build(
        &self,
        config: &AgentConfig,
        registry: Arc<RwLock<ToolRegistry>>,
        memory: Option<Arc<Mutex<Memory>>>,
    ) -> Result<Agent, ConfigError> {
        let engine = ExecutionEngine::new(registry, Arc::clone(&self.event_bus));
        let mut agent = Agent::new(Arc::clone(&self.provider), engine)
            .with_max_steps(config.max_steps)
            .with_sensitive_tools(config.sensitive_tool_names.iter().cloned());
        if let Some(memory) = memory {
            agent = agent.with_memory(memory);
        }
        Ok(agent)
    }
}

/// Never yields a chunk; the watchdog has to reap it.
struct HangingProvider;

#[async_trait]
impl Provider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    fn model(&self) -> &str {
        "hanging-1"
    }

    async fn generate(
        &self,
        _history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<AgentResponse, ProviderError> {
        futures_util::future::pending().await
    }

    async fn stream(
        &self,
        _history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError> {
        Ok(Box::pin(futures_util::stream::pending()))
    }
}

/// Replays scripted turns across all agents built from it.
struct ScriptedProvider {
    turns: StdMutex<Vec<Vec<StreamChunk>>>,
}

impl ScriptedProvider {
    fn new(mut turns: Vec<Vec<StreamChunk>>) -> Self {
        turns.reverse();
        Self {
            turns: StdMutex::new(turns),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn generate(
        &self,
        _history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<AgentResponse, ProviderError> {
        Ok(AgentResponse::default())
    }

    async fn stream(
        &self,
        _history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError> {
        let turn = self.turns.lock().unwrap().pop().unwrap_or_default();
        let chunks: Vec<Result<StreamChunk, ProviderError>> = turn.into_iter().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

/// Always errors mid-stream.
struct CrashingProvider;

#[async_trait]
impl Provider for CrashingProvider {
    fn name(&self) -> &str {
        "crashing"
    }

    fn model(&self) -> &str {
        "crashing-1"
    }

    async fn generate(
        &self,
        _history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<AgentResponse, ProviderError> {
        Err(ProviderError::Request("upstream melted".into()))
    }

    async fn stream(
        &self,
        _history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError> {
        Err(ProviderError::Request("upstream melted".into()))
    }
}

struct Fixture {
    bus: Arc<EventBus>,
    store: Arc<TaskStore>,
    director: PlanDirector,
    _dir: tempfile::TempDir,
}

async fn fixture(provider: Arc<dyn Provider>, config: PlanDirectorConfig) -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(TaskStore::open(
        dir.path().join("tasks.json"),
        Arc::clone(&bus),
    ));
    let agents = Arc::new(AgentManager::new(Arc::new(FixedProviderFactory {
        provider,
        event_bus: Arc::clone(&bus),
    })));
    agents
        .create_and_register(
            "planner",
            AgentConfig::new("fixed", "fixed-1").with_sensitive_tools(["run_command"]),
            Arc::new(RwLock::new(ToolRegistry::new())),
            None,
        )
        .await
        .unwrap();

    let director = PlanDirector::new(
        config,
        Arc::clone(&bus),
        Arc::clone(&store),
        agents,
        "planner",
    );
    director.start().await;
    Fixture {
        bus,
        store,
        director,
        _dir: dir,
    }
}

fn fast_config() -> PlanDirectorConfig {
    PlanDirectorConfig {
        max_concurrent_tasks: 1,
        inactivity_timeout: Duration::from_millis(80),
        max_total_time: Duration::from_secs(30),
        max_tool_calls: 100,
        watchdog_interval: Duration::from_millis(40),
    }
}

#[tokio::test]
async fn test_watchdog_blocks_inactive_task_and_removes_tracker() {
    let f = fixture(Arc::new(HangingProvider), fast_config()).await;

    let task = f.store.add_task(Task::new("stuck")).await.unwrap();

    // Picked up quickly, then reaped by the watchdog.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let blocked = f.store.get_task(&task.id).await.unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert!(blocked.context["blocked_reason"]
        .as_str()
        .unwrap()
        .contains("Inactivity"));
    assert_eq!(f.director.processing_count().await, 0);
    f.director.stop().await;
}

#[tokio::test]
async fn test_concurrency_bound_holds() {
    let f = fixture(
        Arc::new(HangingProvider),
        PlanDirectorConfig {
            max_concurrent_tasks: 1,
            inactivity_timeout: Duration::from_secs(30),
            max_total_time: Duration::from_secs(60),
            max_tool_calls: 100,
            watchdog_interval: Duration::from_secs(10),
        },
    )
    .await;

    f.store.add_task(Task::new("first")).await.unwrap();
    f.store.add_task(Task::new("second")).await.unwrap();
    f.store.add_task(Task::new("third")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(f.director.processing_count().await, 1);
    // The other tasks are untouched, still runnable later.
    let todo = f.store.list_tasks(Some(TaskStatus::Todo), None).await;
    assert_eq!(todo.len(), 2);
    f.director.stop().await;
}

#[tokio::test]
async fn test_permission_request_suspends_task_and_notifies() {
    let provider = ScriptedProvider::new(vec![vec![StreamChunk::ToolCall(ToolCall::new(
        "run_command",
        json!({"command": "reboot"}),
    ))]]);
    let f = fixture(Arc::new(provider), fast_config()).await;

    let notifications = Arc::new(StdMutex::new(Vec::new()));
    {
        let notifications = Arc::clone(&notifications);
        f.bus.subscribe_fn(EventType::PlanUpdated, move |event: Event| {
            let notifications = Arc::clone(&notifications);
            async move {
                notifications.lock().unwrap().push(event);
                Ok(())
            }
        });
    }

    let task = f.store.add_task(Task::new("needs approval")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let suspended = f.store.get_task(&task.id).await.unwrap();
    assert_eq!(suspended.status, TaskStatus::WaitingApproval);
    assert_eq!(
        suspended.context["pending_permissions"],
        json!(["run_command"])
    );

    let notifications = notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].payload["task_id"], json!(task.id));
    assert_eq!(
        notifications[0].payload["pending_permissions"],
        json!(["run_command"])
    );
    f.director.stop().await;
}

#[tokio::test]
async fn test_agent_crash_blocks_task() {
    let f = fixture(Arc::new(CrashingProvider), fast_config()).await;

    let task = f.store.add_task(Task::new("crasher")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let blocked = f.store.get_task(&task.id).await.unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert!(blocked.context["blocked_reason"]
        .as_str()
        .unwrap()
        .contains("agent crashed"));
    assert_eq!(f.director.processing_count().await, 0);
    f.director.stop().await;
}

/// Reads the task id out of the scheduler prompt and moves the task to
/// `in_progress` through the real task tool, then ends its next turn.
struct TaskMovingProvider {
    started: StdMutex<std::collections::HashSet<String>>,
}

impl TaskMovingProvider {
    fn new() -> Self {
        Self {
            started: StdMutex::new(std::collections::HashSet::new()),
        }
    }

    fn extract_task_id(history: &[Message]) -> Option<String> {
        let prompt = history.iter().rev().find_map(|m| m.content.as_deref())?;
        let start = prompt.find("(ID: ")? + "(ID: ".len();
        let end = prompt[start..].find(')')? + start;
        Some(prompt[start..end].to_string())
    }
}

#[async_trait]
impl Provider for TaskMovingProvider {
    fn name(&self) -> &str {
        "task-moving"
    }

    fn model(&self) -> &str {
        "task-moving-1"
    }

    async fn generate(
        &self,
        _history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<AgentResponse, ProviderError> {
        Ok(AgentResponse::default())
    }

    async fn stream(
        &self,
        history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError> {
        let chunks: Vec<Result<StreamChunk, ProviderError>> =
            match Self::extract_task_id(history) {
                Some(task_id) if self.started.lock().unwrap().insert(task_id.clone()) => {
                    vec![Ok(StreamChunk::ToolCall(ToolCall::new(
                        "update_task_status",
                        json!({"task_id": task_id, "status": "in_progress"}),
                    )))]
                }
                _ => vec![Ok(StreamChunk::Content("handled".into()))],
            };
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

#[tokio::test]
async fn test_tasks_drain_one_by_one_through_the_safety_net() {
    let dir = tempfile::TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(TaskStore::open(
        dir.path().join("tasks.json"),
        Arc::clone(&bus),
    ));

    // The planner gets the real task tools so the provider can move tasks.
    let registry = Arc::new(RwLock::new(ToolRegistry::new()));
    maestro::tools::register_task_tools(&registry, Arc::clone(&store))
        .await
        .unwrap();

    let agents = Arc::new(AgentManager::new(Arc::new(FixedProviderFactory {
        provider: Arc::new(TaskMovingProvider::new()),
        event_bus: Arc::clone(&bus),
    })));
    agents
        .create_and_register(
            "planner",
            AgentConfig::new("fixed", "fixed-1"),
            Arc::clone(&registry),
            None,
        )
        .await
        .unwrap();

    let director = PlanDirector::new(
        fast_config(),
        Arc::clone(&bus),
        Arc::clone(&store),
        agents,
        "planner",
    );
    director.start().await;

    let one = store.add_task(Task::new("one")).await.unwrap();
    let two = store.add_task(Task::new("two")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Each task went todo -> in_progress (agent tool) -> paused (safety
    // net: leaf without assignment), and the queue drained completely.
    for id in [&one.id, &two.id] {
        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(
            task.context["pause_reason"],
            json!("no subtasks/agent assigned")
        );
    }
    assert_eq!(director.processing_count().await, 0);
    director.stop().await;
}
