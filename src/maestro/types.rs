//! Core data model shared by every maestro component.
//!
//! The unified history model defined here is the source of truth for all
//! provider adapters: [`Message`]s carry an ordered mix of text content,
//! native tool calls, and tool results, and [`StreamChunk`] is the single
//! streaming currency between providers, agents, schedulers, and gateways.
//!
//! # Message pairing invariants
//!
//! - `system` messages appear only at the head of a history and survive
//!   retention trimming.
//! - An `assistant` message may carry `tool_calls` and/or `content`.
//! - A `tool` message carries only `tool_results` and immediately follows
//!   the `assistant` message whose `tool_calls` it satisfies, with results
//!   in the same order as the calls they answer.
//!
//! # Example
//!
//! ```rust
//! use maestro::types::{Message, Role, ToolCall};
//! use serde_json::json;
//!
//! let call = ToolCall::new("list_directory", json!({"path": "."}));
//! let msg = Message::assistant(None, vec![call]);
//! assert_eq!(msg.role, Role::Assistant);
//! assert_eq!(msg.tool_calls.len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Priming/context message; only valid at the head of a history.
    System,
    /// End-user input.
    User,
    /// Model output (text and/or tool calls).
    Assistant,
    /// Tool results answering a prior assistant turn.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A single tool invocation requested by the model.
///
/// `id` is unique within one assistant turn. Providers that omit ids get
/// one synthesized via [`ToolCall::ensure_id`] before dispatch, so the
/// correlating `tool` message always refers to a stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id, e.g. `"call_ab12cd34"`.
    #[serde(default)]
    pub id: String,
    /// Tool name; must resolve in the registry at execution time.
    pub name: String,
    /// Raw JSON arguments supplied by the model.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Create a call with a freshly generated id.
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: generate_call_id(),
            name: name.into(),
            arguments,
        }
    }

    /// Create a call with an explicit id (typically provider-assigned).
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Fill in a generated id when the provider omitted one.
    ///
    /// Returns `true` if an id was synthesized.
    pub fn ensure_id(&mut self) -> bool {
        if self.id.is_empty() {
            self.id = generate_call_id();
            true
        } else {
            false
        }
    }
}

/// Generate a short stable call identifier (`call_` + 8 hex chars).
pub fn generate_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..8])
}

/// Outcome of exactly one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the call this result answers.
    pub tool_call_id: String,
    /// Name of the tool that ran.
    pub name: String,
    /// Free-form JSON result payload (null on failure).
    #[serde(default)]
    pub result: serde_json::Value,
    /// Error message when the invocation failed or timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful result for the given call.
    pub fn success(call: &ToolCall, result: serde_json::Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            result,
            error: None,
        }
    }

    /// Failed result for the given call; the error message doubles as the
    /// payload so the model sees it on the next turn.
    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            result: serde_json::Value::String(error.clone()),
            error: Some(error),
        }
    }

    /// Whether the invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One entry of a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl Message {
    /// System priming message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    /// User input message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    /// Assistant turn with optional text and the tool calls it requested.
    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_results: Vec::new(),
        }
    }

    /// Tool message answering a prior assistant turn.
    pub fn tool(tool_results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::Tool,
            content: None,
            tool_calls: Vec::new(),
            tool_results,
        }
    }
}

/// Token accounting reported by a provider, when available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Non-streaming provider response, used by the legacy `run` loop.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageMetadata>,
}

/// One unit of streamed agent output.
///
/// Exactly one variant is active per chunk. A single agent turn produces
/// chunks in causal order: `Content` deltas, then the turn's `ToolCall`s,
/// then `ToolResult`s (in input order of the calls they answer), then the
/// next turn's `Content`. Every successful stream ends with [`Done`].
///
/// [`Done`]: StreamChunk::Done
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunk {
    /// Incremental text delta.
    Content(String),
    /// A tool call requested by the model.
    ToolCall(ToolCall),
    /// A completed tool invocation.
    ToolResult(ToolResult),
    /// The agent is suspended awaiting approval for these sensitive calls.
    PermissionRequest(Vec<ToolCall>),
    /// Usage-only chunk, typically emitted once near the end of a turn.
    Usage(UsageMetadata),
    /// Stream terminator.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

impl StreamChunk {
    /// Terminator with no finish reason.
    pub fn done() -> Self {
        StreamChunk::Done {
            finish_reason: None,
        }
    }

    /// Borrow the text delta if this is a content chunk.
    pub fn as_content(&self) -> Option<&str> {
        match self {
            StreamChunk::Content(text) => Some(text.as_str()),
            _ => None,
        }
    }
}

/// Errors surfaced by the agent reasoning loop.
#[derive(Debug)]
pub enum AgentError {
    /// The step budget was exhausted without a final answer.
    MaxStepsExceeded(String),
    /// The underlying provider failed mid-turn.
    Provider(ProviderError),
    /// Any other failure inside the loop body.
    Internal(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::MaxStepsExceeded(msg) => write!(f, "max steps exceeded: {}", msg),
            AgentError::Provider(err) => write!(f, "provider error: {}", err),
            AgentError::Internal(msg) => write!(f, "agent error: {}", msg),
        }
    }
}

impl Error for AgentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AgentError::Provider(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        AgentError::Provider(err)
    }
}

/// Errors raised by provider adapters.
#[derive(Debug)]
pub enum ProviderError {
    /// The remote service rejected or failed the request.
    Request(String),
    /// The response could not be mapped into the unified model.
    Malformed(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Request(msg) => write!(f, "provider request failed: {}", msg),
            ProviderError::Malformed(msg) => write!(f, "malformed provider response: {}", msg),
        }
    }
}

impl Error for ProviderError {}

/// Errors raised by tool lookup and registration.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not registered.
    NotFound(String),
    /// A tool with this name is already registered.
    DuplicateName(String),
    /// Tool body failed.
    ExecutionFailed(String),
    /// Invocation exceeded the engine timeout.
    Timeout(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::DuplicateName(name) => write!(f, "tool already registered: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
            ToolError::Timeout(msg) => write!(f, "tool timed out: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Errors raised while constructing components from configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required environment variable is absent.
    MissingApiKey(String),
    /// The named provider is not registered.
    UnknownProvider(String),
    /// The named agent is not registered.
    UnknownAgent(String),
    /// Anything else wrong with the supplied configuration.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingApiKey(var) => write!(f, "missing API key: {}", var),
            ConfigError::UnknownProvider(name) => write!(f, "unknown provider: {}", name),
            ConfigError::UnknownAgent(id) => write!(f, "unknown agent: {}", id),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl Error for ConfigError {}
