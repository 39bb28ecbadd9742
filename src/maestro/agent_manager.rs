//! Named agent instances with lifecycle management.
//!
//! The [`AgentManager`] owns every live [`Agent`] in the process, keyed by
//! a stable id (a well-known name like `"planner"`, or a per-session key
//! like `"chat:42"`). It supports model/config switching that preserves
//! conversation memory: [`update`](AgentManager::update) rebuilds the
//! instance through the [`AgentFactory`] and re-attaches the old memory
//! and registry unless explicitly dropped, recording the prior config in
//! the instance metadata for audit.
//!
//! There is exactly one "current" agent id, used whenever callers omit an
//! id. The manager is passed around explicitly (no global); every mutation
//! serializes through its internal lock.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::maestro::agent::{Agent, DEFAULT_MAX_STEPS};
use crate::maestro::event::EventBus;
use crate::maestro::execution_engine::ExecutionEngine;
use crate::maestro::memory::Memory;
use crate::maestro::provider::ProviderRegistry;
use crate::maestro::tool_registry::ToolRegistry;
use crate::maestro::types::ConfigError;

/// Everything needed to (re)build an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub model: String,
    pub provider: String,
    pub system_prompt: Option<String>,
    pub max_steps: usize,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub sensitive_tool_names: HashSet<String>,
    /// Provider-specific extras, passed through opaquely.
    pub extras: HashMap<String, serde_json::Value>,
}

impl AgentConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            system_prompt: None,
            max_steps: DEFAULT_MAX_STEPS,
            temperature: 0.7,
            top_p: None,
            top_k: None,
            max_tokens: None,
            sensitive_tool_names: HashSet::new(),
            extras: HashMap::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_sensitive_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive_tool_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial config change applied by [`AgentManager::update`]. Unset fields
/// keep their existing values.
#[derive(Debug, Clone, Default)]
pub struct AgentConfigPatch {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub system_prompt: Option<String>,
    pub max_steps: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub sensitive_tool_names: Option<HashSet<String>>,
    pub extras: HashMap<String, serde_json::Value>,
}

impl AgentConfigPatch {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    fn apply(&self, base: &AgentConfig) -> AgentConfig {
        let mut extras = base.extras.clone();
        extras.extend(self.extras.clone());
        AgentConfig {
            model: self.model.clone().unwrap_or_else(|| base.model.clone()),
            provider: self
                .provider
                .clone()
                .unwrap_or_else(|| base.provider.clone()),
            system_prompt: self
                .system_prompt
                .clone()
                .or_else(|| base.system_prompt.clone()),
            max_steps: self.max_steps.unwrap_or(base.max_steps),
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.or(base.top_p),
            top_k: self.top_k.or(base.top_k),
            max_tokens: self.max_tokens.or(base.max_tokens),
            sensitive_tool_names: self
                .sensitive_tool_names
                .clone()
                .unwrap_or_else(|| base.sensitive_tool_names.clone()),
            extras,
        }
    }
}

/// Builds agents from configuration. Implementations resolve the provider
/// and wire the execution engine; memory is attached when given, otherwise
/// the agent creates its own.
pub trait AgentFactory: Send + Sync {
    fn build(
        &self,
        config: &AgentConfig,
        registry: Arc<RwLock<ToolRegistry>>,
        memory: Option<Arc<Mutex<Memory>>>,
    ) -> Result<Agent, ConfigError>;
}

/// Factory backed by the [`ProviderRegistry`].
pub struct DefaultAgentFactory {
    providers: Arc<ProviderRegistry>,
    event_bus: Arc<EventBus>,
}

impl DefaultAgentFactory {
    pub fn new(providers: Arc<ProviderRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            providers,
            event_bus,
        }
    }
}

impl AgentFactory for DefaultAgentFactory {
    fn build(
        &self,
        config: &AgentConfig,
        registry: Arc<RwLock<ToolRegistry>>,
        memory: Option<Arc<Mutex<Memory>>>,
    ) -> Result<Agent, ConfigError> {
        let provider = self.providers.create(&config.provider, &config.model)?;
        let engine = ExecutionEngine::new(registry, Arc::clone(&self.event_bus));
        let mut agent = Agent::new(provider, engine)
            .with_max_steps(config.max_steps)
            .with_sensitive_tools(config.sensitive_tool_names.iter().cloned());
        if let Some(prompt) = &config.system_prompt {
            agent = agent.with_system_prompt(prompt.clone());
        }
        if let Some(memory) = memory {
            agent = agent.with_memory(memory);
        }
        Ok(agent)
    }
}

/// One registered agent with its construction context.
#[derive(Clone)]
pub struct AgentInstance {
    pub id: String,
    pub agent: Arc<Agent>,
    pub config: AgentConfig,
    pub memory: Arc<Mutex<Memory>>,
    pub registry: Arc<RwLock<ToolRegistry>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
struct ManagerState {
    agents: HashMap<String, AgentInstance>,
    current: Option<String>,
}

/// Process-wide registry of named agent instances.
pub struct AgentManager {
    factory: Arc<dyn AgentFactory>,
    state: RwLock<ManagerState>,
}

impl AgentManager {
    pub fn new(factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            factory,
            state: RwLock::new(ManagerState::default()),
        }
    }

    /// Build an agent from `config` and register it under `id`. The first
    /// registered agent becomes current.
    pub async fn create_and_register(
        &self,
        id: impl Into<String>,
        config: AgentConfig,
        registry: Arc<RwLock<ToolRegistry>>,
        memory: Option<Arc<Mutex<Memory>>>,
    ) -> Result<Arc<Agent>, ConfigError> {
        let id = id.into();
        let agent = self
            .factory
            .build(&config, Arc::clone(&registry), memory)?;
        let agent = Arc::new(agent);
        let instance = AgentInstance {
            id: id.clone(),
            agent: Arc::clone(&agent),
            memory: agent.memory(),
            config,
            registry,
            metadata: HashMap::new(),
        };

        let mut state = self.state.write().await;
        state.agents.insert(id.clone(), instance);
        if state.current.is_none() {
            state.current = Some(id.clone());
        }
        log::info!("registered agent '{}'", id);
        Ok(agent)
    }

    /// Fetch an agent by id, or the current agent when `id` is `None`.
    pub async fn get(&self, id: Option<&str>) -> Option<Arc<Agent>> {
        self.get_instance(id).await.map(|inst| inst.agent)
    }

    /// Fetch the full instance (agent plus construction context).
    pub async fn get_instance(&self, id: Option<&str>) -> Option<AgentInstance> {
        let state = self.state.read().await;
        let id = match id {
            Some(id) => id.to_string(),
            None => state.current.clone()?,
        };
        state.agents.get(&id).cloned()
    }

    pub async fn current_id(&self) -> Option<String> {
        self.state.read().await.current.clone()
    }

    /// Point the default id at another registered agent.
    pub async fn set_current(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        if state.agents.contains_key(id) {
            state.current = Some(id.to_string());
            true
        } else {
            log::warn!("agent '{}' not found", id);
            false
        }
    }

    /// Registered ids with their models, sorted by id.
    pub async fn list(&self) -> Vec<(String, String)> {
        let state = self.state.read().await;
        let mut entries: Vec<(String, String)> = state
            .agents
            .values()
            .map(|inst| (inst.id.clone(), inst.config.model.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Remove an agent. Removing the current agent clears the current id.
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        let removed = state.agents.remove(id).is_some();
        if removed && state.current.as_deref() == Some(id) {
            state.current = state.agents.keys().next().cloned();
        }
        removed
    }

    /// Apply a partial config change, atomically replacing the instance
    /// with a rebuilt agent. Memory and registry are re-attached unless
    /// dropped; the prior config and update time land in metadata.
    pub async fn update(
        &self,
        id: Option<&str>,
        patch: AgentConfigPatch,
        preserve_memory: bool,
        preserve_registry: bool,
    ) -> Result<Arc<Agent>, ConfigError> {
        let mut state = self.state.write().await;
        let id = match id {
            Some(id) => id.to_string(),
            None => state
                .current
                .clone()
                .ok_or_else(|| ConfigError::UnknownAgent("<current>".to_string()))?,
        };
        let old = state
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownAgent(id.clone()))?;

        let new_config = patch.apply(&old.config);
        let registry = if preserve_registry {
            Arc::clone(&old.registry)
        } else {
            Arc::new(RwLock::new(ToolRegistry::new()))
        };
        let memory = preserve_memory.then(|| Arc::clone(&old.memory));

        let agent = Arc::new(self.factory.build(&new_config, Arc::clone(&registry), memory)?);

        let mut metadata = old.metadata.clone();
        metadata.insert(
            "previous_config".to_string(),
            serde_json::to_value(&old.config).unwrap_or(serde_json::Value::Null),
        );
        metadata.insert(
            "updated_at".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );

        log::info!(
            "updated agent '{}' ({} -> {})",
            id,
            old.config.model,
            new_config.model
        );
        state.agents.insert(
            id.clone(),
            AgentInstance {
                id,
                agent: Arc::clone(&agent),
                memory: agent.memory(),
                config: new_config,
                registry,
                metadata,
            },
        );
        Ok(agent)
    }

    /// Switch model while preserving memory and registry.
    pub async fn switch_model(
        &self,
        new_model: impl Into<String>,
        id: Option<&str>,
    ) -> Result<Arc<Agent>, ConfigError> {
        self.update(id, AgentConfigPatch::model(new_model), true, true)
            .await
    }

    /// Rebind `dst`'s memory to `src`'s memory (shared reference
    /// semantics): `dst` is rebuilt around the same `Arc<Mutex<Memory>>`
    /// that `src` uses, so subsequent turns on either agent see one
    /// shared history. The swap is atomic with respect to other manager
    /// operations.
    pub async fn transfer_memory(&self, src: &str, dst: &str) -> Result<(), ConfigError> {
        let mut state = self.state.write().await;
        let src_memory = state
            .agents
            .get(src)
            .map(|inst| Arc::clone(&inst.memory))
            .ok_or_else(|| ConfigError::UnknownAgent(src.to_string()))?;
        let old = state
            .agents
            .get(dst)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownAgent(dst.to_string()))?;

        let agent = Arc::new(self.factory.build(
            &old.config,
            Arc::clone(&old.registry),
            Some(Arc::clone(&src_memory)),
        )?);

        let mut metadata = old.metadata;
        metadata.insert(
            "memory_transferred_from".to_string(),
            serde_json::Value::String(src.to_string()),
        );

        state.agents.insert(
            dst.to_string(),
            AgentInstance {
                id: dst.to_string(),
                agent,
                memory: src_memory,
                config: old.config,
                registry: old.registry,
                metadata,
            },
        );
        log::info!("transferred memory from '{}' to '{}'", src, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maestro::types::Message;

    fn manager() -> AgentManager {
        let providers = Arc::new(ProviderRegistry::with_defaults());
        let bus = Arc::new(EventBus::new());
        AgentManager::new(Arc::new(DefaultAgentFactory::new(providers, bus)))
    }

    fn registry() -> Arc<RwLock<ToolRegistry>> {
        Arc::new(RwLock::new(ToolRegistry::new()))
    }

    #[tokio::test]
    async fn test_first_registration_becomes_current() {
        let manager = manager();
        manager
            .create_and_register("a", AgentConfig::new("echo", "echo-1"), registry(), None)
            .await
            .unwrap();
        manager
            .create_and_register("b", AgentConfig::new("echo", "echo-2"), registry(), None)
            .await
            .unwrap();

        assert_eq!(manager.current_id().await.as_deref(), Some("a"));
        assert!(manager.get(None).await.is_some());
        assert!(manager.set_current("b").await);
        assert_eq!(manager.current_id().await.as_deref(), Some("b"));
        assert!(!manager.set_current("missing").await);
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_creation_only() {
        let manager = manager();
        let err = manager
            .create_and_register(
                "bad",
                AgentConfig::new("no-such-provider", "m"),
                registry(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(_)));
        assert!(manager.get(Some("bad")).await.is_none());
    }

    #[tokio::test]
    async fn test_update_preserves_memory_and_records_audit() {
        let manager = manager();
        manager
            .create_and_register("a", AgentConfig::new("echo", "echo-1"), registry(), None)
            .await
            .unwrap();

        // Put something in memory so preservation is observable.
        let before = manager.get_instance(Some("a")).await.unwrap();
        before
            .memory
            .lock()
            .await
            .add(Message::user("remember me"));

        manager
            .update(Some("a"), AgentConfigPatch::model("echo-9"), true, true)
            .await
            .unwrap();

        let after = manager.get_instance(Some("a")).await.unwrap();
        assert_eq!(after.config.model, "echo-9");
        assert!(Arc::ptr_eq(&before.memory, &after.memory));
        assert_eq!(
            after.metadata["previous_config"]["model"],
            serde_json::json!("echo-1")
        );
        assert!(after.metadata.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn test_update_can_drop_memory() {
        let manager = manager();
        manager
            .create_and_register("a", AgentConfig::new("echo", "echo-1"), registry(), None)
            .await
            .unwrap();
        let before = manager.get_instance(Some("a")).await.unwrap();

        manager
            .update(Some("a"), AgentConfigPatch::default(), false, true)
            .await
            .unwrap();

        let after = manager.get_instance(Some("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&before.memory, &after.memory));
    }

    #[tokio::test]
    async fn test_transfer_memory_shares_one_history() {
        let manager = manager();
        manager
            .create_and_register("src", AgentConfig::new("echo", "echo-1"), registry(), None)
            .await
            .unwrap();
        manager
            .create_and_register("dst", AgentConfig::new("echo", "echo-1"), registry(), None)
            .await
            .unwrap();

        let src = manager.get_instance(Some("src")).await.unwrap();
        src.memory.lock().await.add(Message::user("shared note"));

        manager.transfer_memory("src", "dst").await.unwrap();

        let dst = manager.get_instance(Some("dst")).await.unwrap();
        assert!(Arc::ptr_eq(&src.memory, &dst.memory));
        assert_eq!(dst.memory.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_reassigns_current() {
        let manager = manager();
        manager
            .create_and_register("a", AgentConfig::new("echo", "echo-1"), registry(), None)
            .await
            .unwrap();
        assert!(manager.remove("a").await);
        assert_eq!(manager.current_id().await, None);
        assert!(!manager.remove("a").await);
    }
}
