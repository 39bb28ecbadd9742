// src/lib.rs

// Import the top-level `maestro` module.
pub mod maestro;

// Re-exporting key items for easier external access.
pub use maestro::agent::{Agent, AgentStream};
pub use maestro::agent_manager::{AgentConfig, AgentConfigPatch, AgentManager};
pub use maestro::event::{CommandBus, Event, EventBus, EventType};
pub use maestro::memory::Memory;
pub use maestro::plan_director::{PlanDirector, PlanDirectorConfig};
pub use maestro::runtime::{AppContext, Runtime};
pub use maestro::task::{Task, TaskPatch, TaskPriority, TaskStatus};
pub use maestro::task_store::TaskStore;
pub use maestro::tool_registry::ToolRegistry;
pub use maestro::types::{AgentError, Message, Role, StreamChunk, ToolCall, ToolResult};

// Flat module aliases so `maestro::agent::...` is also reachable as
// `maestro::agent` from the crate root in tests and downstream code.
pub use maestro::agent;
pub use maestro::agent_manager;
pub use maestro::agent_tool;
pub use maestro::cron;
pub use maestro::event;
pub use maestro::execution_engine;
pub use maestro::gateway;
pub use maestro::memory;
pub use maestro::plan_director;
pub use maestro::priority_queue;
pub use maestro::provider;
pub use maestro::runtime;
pub use maestro::task;
pub use maestro::task_store;
pub use maestro::tool_registry;
pub use maestro::tools;
pub use maestro::types;
