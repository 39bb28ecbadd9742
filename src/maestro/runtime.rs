//! Application context and the top-level orchestrator loop.
//!
//! [`AppContext`] bundles the process-wide collaborators (event bus,
//! command bus, task store, agent manager) and is passed explicitly to
//! constructors, so tests can substitute fakes for any of them.
//!
//! [`Runtime`] is the single Command Bus consumer: it turns
//! `user_message` events into agent streams (one agent per chat id,
//! created on first use), forwards chunks to the outbound gateway, and
//! resolves `user_approval` events against the same agent's pending
//! permission request. A `system_shutdown` event drains the loop and
//! returns, which the binary maps to exit code 0.

use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::maestro::agent::Agent;
use crate::maestro::agent_manager::{AgentConfig, AgentManager, DefaultAgentFactory};
use crate::maestro::event::{CommandBus, Event, EventBus, EventType};
use crate::maestro::gateway::Gateway;
use crate::maestro::provider::ProviderRegistry;
use crate::maestro::task_store::TaskStore;
use crate::maestro::tool_registry::ToolRegistry;
use crate::maestro::types::ConfigError;

/// Process-wide collaborators, shared by handle.
#[derive(Clone)]
pub struct AppContext {
    pub event_bus: Arc<EventBus>,
    pub command_bus: Arc<CommandBus>,
    pub tasks: Arc<TaskStore>,
    pub agents: Arc<AgentManager>,
}

impl AppContext {
    /// Wire the standard context: one event bus, one command bus, a task
    /// store at `tasks_path`, and an agent manager backed by `providers`.
    pub fn new(tasks_path: impl Into<PathBuf>, providers: Arc<ProviderRegistry>) -> Self {
        let event_bus = Arc::new(EventBus::new());
        let command_bus = Arc::new(CommandBus::new());
        let tasks = Arc::new(TaskStore::open(tasks_path, Arc::clone(&event_bus)));
        let agents = Arc::new(AgentManager::new(Arc::new(DefaultAgentFactory::new(
            providers,
            Arc::clone(&event_bus),
        ))));
        Self {
            event_bus,
            command_bus,
            tasks,
            agents,
        }
    }
}

/// The top-level Command Bus consumer.
pub struct Runtime {
    ctx: AppContext,
    gateway: Arc<dyn Gateway>,
    chat_config: AgentConfig,
    chat_tools: Arc<RwLock<ToolRegistry>>,
}

impl Runtime {
    /// `chat_config` is the template used when a chat id shows up for the
    /// first time; every chat agent shares `chat_tools`.
    pub fn new(
        ctx: AppContext,
        gateway: Arc<dyn Gateway>,
        chat_config: AgentConfig,
        chat_tools: Arc<RwLock<ToolRegistry>>,
    ) -> Self {
        Self {
            ctx,
            gateway,
            chat_config,
            chat_tools,
        }
    }

    /// Request a graceful stop: the run loop exits once this event drains.
    pub fn shutdown(&self) {
        self.ctx
            .command_bus
            .send(Event::new(EventType::SystemShutdown, serde_json::json!({})));
    }

    /// Consume the Command Bus until shutdown. Events are processed
    /// strictly sequentially, which is exactly what user messages and
    /// approvals need.
    pub async fn run(&self) {
        self.ctx.event_bus.publish(Event::new(
            EventType::SystemStartup,
            serde_json::json!({}),
        ));
        log::info!("runtime loop started");

        while let Some(event) = self.ctx.command_bus.receive().await {
            match event.event_type {
                EventType::UserMessage => {
                    let (Some(chat_id), Some(text)) =
                        (event.payload_str("chat_id"), event.payload_str("text"))
                    else {
                        log::warn!("malformed user_message payload: {}", event.payload);
                        continue;
                    };
                    self.handle_user_input(chat_id, text).await;
                }
                EventType::UserApproval => {
                    let Some(chat_id) = event.payload_str("chat_id") else {
                        log::warn!("malformed user_approval payload: {}", event.payload);
                        continue;
                    };
                    let approved = event.payload["approved"].as_bool().unwrap_or(false);
                    let token = if approved { "yes" } else { "no" };
                    self.handle_user_input(chat_id, token).await;
                }
                EventType::SystemShutdown => {
                    log::info!("shutdown event received, draining runtime loop");
                    break;
                }
                other => log::debug!("runtime ignoring event type {:?}", other),
            }
        }

        self.ctx.event_bus.publish(Event::new(
            EventType::SystemShutdown,
            serde_json::json!({}),
        ));
        log::info!("runtime loop exited");
    }

    async fn handle_user_input(&self, chat_id: &str, input: &str) {
        let agent = match self.agent_for_chat(chat_id).await {
            Ok(agent) => agent,
            Err(err) => {
                log::error!("cannot create agent for chat {}: {}", chat_id, err);
                return;
            }
        };

        let mut stream = agent.stream(input);
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    if let Err(err) = self.gateway.deliver(chat_id, &chunk).await {
                        log::error!("gateway delivery failed for chat {}: {}", chat_id, err);
                    }
                }
                Err(err) => {
                    // The loop already surfaced an error chunk to the
                    // gateway; the conversation survives the failed turn.
                    log::error!("agent turn failed for chat {}: {}", chat_id, err);
                    break;
                }
            }
        }
    }

    /// One agent per chat id, created from the template on first use.
    async fn agent_for_chat(&self, chat_id: &str) -> Result<Arc<Agent>, ConfigError> {
        let key = format!("chat:{}", chat_id);
        if let Some(agent) = self.ctx.agents.get(Some(&key)).await {
            return Ok(agent);
        }
        log::info!("creating new agent for chat {}", chat_id);
        self.ctx
            .agents
            .create_and_register(
                key,
                self.chat_config.clone(),
                Arc::clone(&self.chat_tools),
                None,
            )
            .await
    }
}
