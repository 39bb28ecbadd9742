//! Agents exposed as tools for nested multi-agent systems.
//!
//! [`AgentTool`] wraps an [`Agent`] so a parent agent can delegate work to
//! it through the ordinary tool contract: one `task_input` string in, the
//! sub-agent's final answer out. By default the sub-agent's memory is
//! cleared before each delegation so runs are isolated; its system prompt
//! re-seeds automatically on the next turn.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::maestro::agent::Agent;
use crate::maestro::tool_registry::{Tool, ToolOutput};

/// Wraps an [`Agent`] as a [`Tool`].
pub struct AgentTool {
    name: String,
    description: String,
    agent: Arc<Agent>,
    clear_memory: bool,
}

impl AgentTool {
    /// Expose `agent` under `name`; `description` tells the parent agent
    /// when to delegate here.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        agent: Arc<Agent>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            agent,
            clear_memory: true,
        }
    }

    /// Keep the sub-agent's memory across delegations instead of clearing
    /// it per call.
    pub fn preserve_memory(mut self) -> Self {
        self.clear_memory = false;
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_input": {
                    "type": "string",
                    "description": "The specific task or question for the sub-agent to handle."
                }
            },
            "required": ["task_input"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let Some(task_input) = arguments.get("task_input").and_then(|v| v.as_str()) else {
            return Ok(json!({
                "status": "error",
                "error": "no 'task_input' provided to the sub-agent"
            }));
        };

        if self.clear_memory {
            self.agent.memory().lock().await.clear();
        }

        log::info!(
            "delegating to sub-agent '{}': {}",
            self.name,
            task_input.chars().take(50).collect::<String>()
        );

        match self.agent.run(task_input).await {
            Ok(result) => Ok(json!({"status": "success", "result": result})),
            Err(err) => {
                log::error!("sub-agent '{}' failed: {}", self.name, err);
                Ok(json!({"status": "error", "error": err.to_string()}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maestro::event::EventBus;
    use crate::maestro::execution_engine::ExecutionEngine;
    use crate::maestro::provider::EchoProvider;
    use crate::maestro::tool_registry::ToolRegistry;
    use crate::maestro::types::Role;
    use tokio::sync::RwLock;

    fn sub_agent() -> Arc<Agent> {
        let engine = ExecutionEngine::new(
            Arc::new(RwLock::new(ToolRegistry::new())),
            Arc::new(EventBus::new()),
        );
        Arc::new(
            Agent::new(Arc::new(EchoProvider::new("echo-1")), engine)
                .with_system_prompt("You are a specialist."),
        )
    }

    #[tokio::test]
    async fn test_delegation_returns_final_content() {
        let tool = AgentTool::new("specialist", "delegate specialist work", sub_agent());
        let out = tool
            .execute(json!({"task_input": "analyze this"}))
            .await
            .unwrap();
        assert_eq!(out["status"], "success");
        assert_eq!(out["result"], "You said: analyze this");
    }

    #[tokio::test]
    async fn test_memory_cleared_and_reseeded_between_runs() {
        let agent = sub_agent();
        let tool = AgentTool::new("specialist", "delegate", Arc::clone(&agent));

        tool.execute(json!({"task_input": "first"})).await.unwrap();
        tool.execute(json!({"task_input": "second"})).await.unwrap();

        let memory = agent.memory();
        let memory = memory.lock().await;
        let history = memory.history();
        // Cleared before the second run: system + user + assistant only.
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[1].content.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_missing_task_input_reports_error() {
        let tool = AgentTool::new("specialist", "delegate", sub_agent());
        let out = tool.execute(json!({})).await.unwrap();
        assert_eq!(out["status"], "error");
    }
}
