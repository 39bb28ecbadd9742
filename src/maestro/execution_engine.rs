//! Concurrent, timeout-bounded tool execution.
//!
//! The [`ExecutionEngine`] is the single dispatch point for tool calls: it
//! resolves each call in the registry, awaits it under a per-call timeout,
//! publishes `tool_execution_*` lifecycle events, and captures every
//! failure mode into the returned [`ToolResult`]. Results are never
//! dropped: a batch of N calls always produces exactly N results, in input
//! order, regardless of completion order.
//!
//! An optional [`Guardrails`] hook enforces a tool allow-list before
//! dispatch and truncates oversized string results afterwards.

use futures_util::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::maestro::event::{Event, EventBus, EventType};
use crate::maestro::tool_registry::ToolRegistry;
use crate::maestro::types::{ToolCall, ToolError, ToolResult};

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Result payloads are truncated to this many characters in published
/// events to keep logs and observers safe.
const EVENT_RESULT_PREVIEW: usize = 1000;

/// Pre/post execution policy applied by the engine.
#[derive(Debug, Clone, Default)]
pub struct Guardrails {
    /// When set, only these tool names may execute.
    pub allowed_tools: Option<HashSet<String>>,
    /// When set, string results longer than this are truncated.
    pub max_result_length: Option<usize>,
}

impl Guardrails {
    /// Permissive policy: everything allowed, nothing truncated.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn with_allowed_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_result_length(mut self, max: usize) -> Self {
        self.max_result_length = Some(max);
        self
    }

    /// Allow-list check before dispatch.
    fn validate_pre_execution(&self, call: &ToolCall) -> Result<(), String> {
        if let Some(allowed) = &self.allowed_tools {
            if !allowed.contains(&call.name) {
                return Err(format!(
                    "security alert: tool '{}' is not allowed by current policy",
                    call.name
                ));
            }
        }
        Ok(())
    }

    /// Truncate oversized string results in place.
    fn validate_post_execution(&self, result: &mut ToolResult) {
        if let (Some(max), serde_json::Value::String(text)) =
            (self.max_result_length, &mut result.result)
        {
            if text.chars().count() > max {
                let truncated: String = text.chars().take(max).collect();
                *text = format!("{}\n... (truncated to {} chars)", truncated, max);
            }
        }
    }
}

/// Dispatches tool calls concurrently with lifecycle events.
///
/// Cheap to clone; every clone shares the same registry, bus, and policy.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<RwLock<ToolRegistry>>,
    event_bus: Arc<EventBus>,
    guardrails: Guardrails,
    timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<RwLock<ToolRegistry>>, event_bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            event_bus,
            guardrails: Guardrails::permissive(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The registry this engine resolves against.
    pub fn registry(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.registry
    }

    /// Execute a batch concurrently, preserving input index order in the
    /// returned vector. Every call yields exactly one result.
    pub async fn execute_calls(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| self.execute_single(call))).await
    }

    /// Execute one call, capturing all failure modes into the result.
    pub async fn execute_single(&self, call: &ToolCall) -> ToolResult {
        if let Err(denied) = self.guardrails.validate_pre_execution(call) {
            log::warn!("tool '{}' blocked: {}", call.name, denied);
            self.publish_failed(call, &denied);
            return ToolResult::failure(call, denied);
        }

        self.event_bus.publish(Event::from_source(
            EventType::ToolExecutionStarted,
            json!({
                "tool_call_id": call.id,
                "tool_name": call.name,
                "arguments": call.arguments,
            }),
            "execution_engine",
        ));

        let tool = {
            let registry = self.registry.read().await;
            registry.get(&call.name)
        };
        let Some(tool) = tool else {
            let error = ToolError::NotFound(call.name.clone()).to_string();
            log::error!("{}", error);
            self.publish_failed(call, &error);
            return ToolResult::failure(call, error);
        };

        let outcome = tokio::time::timeout(self.timeout, tool.execute(call.arguments.clone())).await;
        match outcome {
            Ok(Ok(value)) => {
                let mut result = ToolResult::success(call, value);
                self.guardrails.validate_post_execution(&mut result);
                self.publish_completed(call, &result);
                result
            }
            Ok(Err(err)) => {
                let error = format!("error executing tool {}: {}", call.name, err);
                log::error!("{}", error);
                self.publish_failed(call, &error);
                ToolResult::failure(call, error)
            }
            Err(_elapsed) => {
                let error = format!(
                    "tool {} timed out after {}s",
                    call.name,
                    self.timeout.as_secs_f64()
                );
                log::error!("{}", error);
                self.publish_failed(call, &error);
                ToolResult::failure(call, error)
            }
        }
    }

    fn publish_completed(&self, call: &ToolCall, result: &ToolResult) {
        let preview = match serde_json::to_string(&result.result) {
            Ok(raw) if raw.chars().count() > EVENT_RESULT_PREVIEW => {
                raw.chars().take(EVENT_RESULT_PREVIEW).collect::<String>()
            }
            Ok(raw) => raw,
            Err(_) => String::from("<unserializable>"),
        };
        self.event_bus.publish(Event::from_source(
            EventType::ToolExecutionCompleted,
            json!({
                "tool_call_id": call.id,
                "tool_name": call.name,
                "result": preview,
            }),
            "execution_engine",
        ));
    }

    fn publish_failed(&self, call: &ToolCall, error: &str) {
        self.event_bus.publish(Event::from_source(
            EventType::ToolExecutionFailed,
            json!({
                "tool_call_id": call.id,
                "tool_name": call.name,
                "error": error,
            }),
            "execution_engine",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maestro::tool_registry::FnTool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine_with(tools: Vec<Arc<dyn crate::maestro::tool_registry::Tool>>) -> ExecutionEngine {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        ExecutionEngine::new(Arc::new(RwLock::new(registry)), Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        // Tools finish in reverse order; results must still line up.
        let slow = Arc::new(FnTool::new(
            "slow",
            "sleeps then answers",
            json!({"type": "object"}),
            |_args| async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(json!("slow"))
            },
        ));
        let fast = Arc::new(FnTool::new(
            "fast",
            "answers immediately",
            json!({"type": "object"}),
            |_args| async move { Ok(json!("fast")) },
        ));
        let engine = engine_with(vec![slow, fast]);

        let calls = vec![
            ToolCall::new("slow", json!({})),
            ToolCall::new("fast", json!({})),
        ];
        let results = engine.execute_calls(&calls).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "slow");
        assert_eq!(results[0].tool_call_id, calls[0].id);
        assert_eq!(results[1].name, "fast");
        assert_eq!(results[1].tool_call_id, calls[1].id);
    }

    #[tokio::test]
    async fn test_unknown_tool_yields_error_result() {
        let engine = engine_with(vec![]);
        let call = ToolCall::new("missing", json!({}));
        let result = engine.execute_single(&call).await;
        assert!(!result.is_success());
        assert!(result.error.as_deref().unwrap().contains("tool not found"));
    }

    #[tokio::test]
    async fn test_timeout_produces_error_result() {
        let hang = Arc::new(FnTool::new(
            "hang",
            "never returns",
            json!({"type": "object"}),
            |_args| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!(null))
            },
        ));
        let engine = engine_with(vec![hang]).with_timeout(Duration::from_millis(20));
        let call = ToolCall::new("hang", json!({}));
        let result = engine.execute_single(&call).await;
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_tool_error_is_captured_not_raised() {
        let boom = Arc::new(FnTool::new(
            "boom",
            "always fails",
            json!({"type": "object"}),
            |_args| async move { Err("kaput".into()) },
        ));
        let engine = engine_with(vec![boom]);
        let call = ToolCall::new("boom", json!({}));
        let result = engine.execute_single(&call).await;
        assert!(result.error.as_deref().unwrap().contains("kaput"));
    }

    #[tokio::test]
    async fn test_guardrails_allow_list_blocks() {
        let echo = Arc::new(FnTool::new(
            "echo",
            "echoes",
            json!({"type": "object"}),
            |args| async move { Ok(args) },
        ));
        let engine = engine_with(vec![echo])
            .with_guardrails(Guardrails::default().with_allowed_tools(["other"]));
        let result = engine.execute_single(&ToolCall::new("echo", json!({}))).await;
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("not allowed by current policy"));
    }

    #[tokio::test]
    async fn test_guardrails_truncate_long_string_results() {
        let talky = Arc::new(FnTool::new(
            "talky",
            "returns a long string",
            json!({"type": "object"}),
            |_args| async move { Ok(json!("x".repeat(500))) },
        ));
        let engine = engine_with(vec![talky])
            .with_guardrails(Guardrails::default().with_max_result_length(100));
        let result = engine.execute_single(&ToolCall::new("talky", json!({}))).await;
        let text = result.result.as_str().unwrap();
        assert!(text.contains("truncated to 100 chars"));
        assert!(text.len() < 200);
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let bus = Arc::new(EventBus::new());
        let started = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        {
            let started = started.clone();
            bus.subscribe_fn(EventType::ToolExecutionStarted, move |_e| {
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        {
            let completed = completed.clone();
            bus.subscribe_fn(EventType::ToolExecutionCompleted, move |_e| {
                let completed = completed.clone();
                async move {
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FnTool::new(
                "ok",
                "succeeds",
                json!({"type": "object"}),
                |_args| async move { Ok(json!("fine")) },
            )))
            .unwrap();
        let engine = ExecutionEngine::new(Arc::new(RwLock::new(registry)), bus);

        engine.execute_single(&ToolCall::new("ok", json!({}))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
