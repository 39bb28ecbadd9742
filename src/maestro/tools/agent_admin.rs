//! Agent administration tools.
//!
//! Lets an agent inspect and reconfigure the instance manager it lives
//! in: switching the active model while keeping conversation memory, and
//! listing what is registered.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::maestro::agent_manager::AgentManager;
use crate::maestro::tool_registry::{Tool, ToolOutput, ToolRegistry};
use crate::maestro::types::ToolError;

/// `switch_model`: swap the model behind an agent, memory preserved.
pub struct SwitchModelTool {
    manager: Arc<AgentManager>,
}

#[async_trait]
impl Tool for SwitchModelTool {
    fn name(&self) -> &str {
        "switch_model"
    }

    fn description(&self) -> &str {
        "Switch an agent to a different model while preserving its conversation memory and tools. Targets the current agent unless agent_id is given."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "model": {"type": "string", "description": "The model identifier to switch to"},
                "agent_id": {"type": "string", "description": "Agent to update; defaults to the current agent"}
            },
            "required": ["model"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let Some(model) = arguments.get("model").and_then(|v| v.as_str()) else {
            return Ok(json!({"status": "error", "error": "'model' is required"}));
        };
        let agent_id = arguments.get("agent_id").and_then(|v| v.as_str());

        match self.manager.switch_model(model, agent_id).await {
            Ok(_agent) => {
                let target = match agent_id {
                    Some(id) => Some(id.to_string()),
                    None => self.manager.current_id().await,
                };
                Ok(json!({"status": "success", "model": model, "agent_id": target}))
            }
            Err(err) => Ok(json!({"status": "error", "error": err.to_string()})),
        }
    }
}

/// `list_agents`: registered agent ids and their models.
pub struct ListAgentsTool {
    manager: Arc<AgentManager>,
}

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        "list_agents"
    }

    fn description(&self) -> &str {
        "List all registered agents with their models, and which one is current."
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> ToolOutput {
        let agents: Vec<Value> = self
            .manager
            .list()
            .await
            .into_iter()
            .map(|(id, model)| json!({"id": id, "model": model}))
            .collect();
        let current = self.manager.current_id().await;
        Ok(json!({"status": "success", "current": current, "agents": agents}))
    }
}

/// Register the agent administration suite against `manager`.
pub async fn register_agent_admin_tools(
    registry: &Arc<RwLock<ToolRegistry>>,
    manager: Arc<AgentManager>,
) -> Result<(), ToolError> {
    let mut registry = registry.write().await;
    registry.register(Arc::new(SwitchModelTool {
        manager: Arc::clone(&manager),
    }))?;
    registry.register(Arc::new(ListAgentsTool { manager }))?;
    Ok(())
}
