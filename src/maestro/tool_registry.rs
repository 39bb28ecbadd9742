//! Tool contract and registry.
//!
//! A [`Tool`] is a named, JSON-schema-described operation the model may
//! invoke. The [`ToolRegistry`] maps names to tools and exports a
//! vendor-neutral definition list any provider adapter can translate.
//!
//! Both async and blocking tool bodies are supported: implement [`Tool`]
//! directly for async work, or wrap a synchronous closure in
//! [`BlockingFnTool`] and the body runs on the blocking worker pool so it
//! never stalls the scheduler.
//!
//! # Example
//!
//! ```rust
//! use maestro::tool_registry::{FnTool, ToolRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let mut registry = ToolRegistry::new();
//! registry
//!     .register(Arc::new(FnTool::new(
//!         "add",
//!         "Add two numbers",
//!         json!({"type": "object", "properties": {
//!             "a": {"type": "number"}, "b": {"type": "number"}
//!         }, "required": ["a", "b"]}),
//!         |args| async move {
//!             let a = args["a"].as_f64().unwrap_or(0.0);
//!             let b = args["b"].as_f64().unwrap_or(0.0);
//!             Ok(json!({"result": a + b}))
//!         },
//!     )))
//!     .unwrap();
//!
//! assert_eq!(registry.export().len(), 1);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use crate::maestro::types::ToolError;

/// Result of a tool body: a free-form JSON value or an error message that
/// will be surfaced to the model on the next turn.
pub type ToolOutput = Result<Value, Box<dyn Error + Send + Sync>>;

/// A named operation the model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used for routing and in provider schemas.
    fn name(&self) -> &str;

    /// Description surfaced to the model to aid tool selection.
    fn description(&self) -> &str;

    /// JSON Schema of the accepted arguments (`type`/`properties`/`required`).
    fn schema(&self) -> Value;

    /// Run the tool. Implementations must not block the async scheduler;
    /// wrap CPU-bound or blocking-I/O bodies in `spawn_blocking` (or use
    /// [`BlockingFnTool`]).
    async fn execute(&self, arguments: Value) -> ToolOutput;
}

/// Tool built from an async closure.
pub struct FnTool<F> {
    name: String,
    description: String,
    schema: Value,
    f: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolOutput> + Send,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        f: F,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolOutput> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        (self.f)(arguments).await
    }
}

/// Tool built from a synchronous closure; the body runs under
/// `tokio::task::spawn_blocking` so blocking work is offloaded to the
/// worker pool.
pub struct BlockingFnTool {
    name: String,
    description: String,
    schema: Value,
    f: Arc<dyn Fn(Value) -> ToolOutput + Send + Sync>,
}

impl BlockingFnTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        f: impl Fn(Value) -> ToolOutput + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl Tool for BlockingFnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, arguments: Value) -> ToolOutput {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(arguments)).await {
            Ok(output) => output,
            Err(join_err) => Err(format!("blocking tool panicked: {}", join_err).into()),
        }
    }
}

/// Provider-neutral tool definition exported to adapters.
///
/// `parameters` is a JSON Schema object with the annotation keys (`title`,
/// `$schema`, `$defs`, `definitions`, `additionalProperties`) already
/// stripped, as several provider APIs reject them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Remove schema annotation keys that providers reject, recursively.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (key, value) in map {
                if matches!(
                    key.as_str(),
                    "title" | "$schema" | "$defs" | "definitions" | "additionalProperties"
                ) {
                    continue;
                }
                cleaned.insert(key.clone(), sanitize_schema(value));
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// Registry mapping tool names to implementations.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool by name, returning it if present.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All registered tools (map iteration order).
    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }

    /// Registered tool names.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Export vendor-neutral definitions for provider adapters.
    pub fn export(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: sanitize_schema(&tool.schema()),
            })
            .collect();
        // Stable order keeps provider prompts deterministic.
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}
