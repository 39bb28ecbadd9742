//! Provider-agnostic LLM contract.
//!
//! A [`Provider`] translates the unified history model into a vendor wire
//! format and returns responses in a uniform shape: [`generate`] for full
//! request/response callers and [`stream`] for the agent loop. The stream
//! is finite and non-restartable; within one turn, content chunks appear
//! in textual order and every tool-call chunk arrives before the stream
//! ends. Adapters must tolerate provider-side omissions (notably missing
//! tool-call ids, which the agent synthesizes).
//!
//! Concrete HTTP/SDK bindings live outside this crate; [`EchoProvider`]
//! is the in-tree reference implementation used by the binary and the
//! test suites.
//!
//! [`generate`]: Provider::generate
//! [`stream`]: Provider::stream

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::maestro::tool_registry::ToolDefinition;
use crate::maestro::types::{AgentResponse, ConfigError, Message, ProviderError, Role, StreamChunk};

/// Boxed chunk stream returned by [`Provider::stream`].
pub type ProviderStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name())
            .field("model", &self.model())
            .finish()
    }
}

/// Interface to one LLM service.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier used to select this provider (e.g. `"echo"`).
    fn name(&self) -> &str;

    /// Model identifier forwarded upstream.
    fn model(&self) -> &str;

    /// Full request/response generation.
    async fn generate(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<AgentResponse, ProviderError>;

    /// Streaming generation. The default folds [`generate`] into a
    /// two-chunk stream (content, usage-free) for providers without a
    /// native streaming path.
    ///
    /// [`generate`]: Provider::generate
    async fn stream(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError> {
        let response = self.generate(history, tools).await?;
        let mut chunks: Vec<Result<StreamChunk, ProviderError>> = Vec::new();
        if let Some(content) = response.content {
            chunks.push(Ok(StreamChunk::Content(content)));
        }
        for call in response.tool_calls {
            chunks.push(Ok(StreamChunk::ToolCall(call)));
        }
        if let Some(usage) = response.usage {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

/// Builds a [`Provider`] for a given model, typically reading its API key
/// from the environment. A missing key fails this factory only.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, model: &str) -> Result<Arc<dyn Provider>, ConfigError>;
}

/// Name-keyed collection of provider factories.
///
/// Construction failures are per-provider: registering a factory whose
/// key is absent is fine, and only resolving it fails.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the in-tree providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoProviderFactory));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Resolve `name` and build a provider for `model`.
    pub fn create(&self, name: &str, model: &str) -> Result<Arc<dyn Provider>, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProvider(name.to_string()))?;
        factory.build(model)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Read a required environment variable, mapping absence to
/// [`ConfigError::MissingApiKey`].
pub fn require_env(var: &str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingApiKey(var.to_string()))
}

/// Deterministic offline provider: replies by echoing the last user
/// message. Requires no API key.
pub struct EchoProvider {
    model: String,
}

impl EchoProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    fn reply(&self, history: &[Message]) -> String {
        let last_user = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.as_deref())
            .unwrap_or("(silence)");
        format!("You said: {}", last_user)
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<AgentResponse, ProviderError> {
        Ok(AgentResponse {
            content: Some(self.reply(history)),
            tool_calls: Vec::new(),
            usage: None,
        })
    }

    async fn stream(
        &self,
        history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError> {
        // Split the reply into word-ish deltas to exercise chunked paths.
        let reply = self.reply(history);
        let chunks: Vec<Result<StreamChunk, ProviderError>> = reply
            .split_inclusive(' ')
            .map(|piece| Ok(StreamChunk::Content(piece.to_string())))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

struct EchoProviderFactory;

impl ProviderFactory for EchoProviderFactory {
    fn build(&self, model: &str) -> Result<Arc<dyn Provider>, ConfigError> {
        Ok(Arc::new(EchoProvider::new(model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_echo_provider_round_trip() {
        let provider = EchoProvider::new("echo-1");
        let history = vec![Message::system("be brief"), Message::user("hello there")];
        let response = provider.generate(&history, &[]).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("You said: hello there"));
    }

    #[tokio::test]
    async fn test_echo_stream_concatenates_to_reply() {
        let provider = EchoProvider::new("echo-1");
        let history = vec![Message::user("one two three")];
        let mut stream = provider.stream(&history, &[]).await.unwrap();
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let StreamChunk::Content(delta) = chunk.unwrap() {
                text.push_str(&delta);
            }
        }
        assert_eq!(text, "You said: one two three");
    }

    #[test]
    fn test_registry_unknown_provider() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.create("echo", "echo-1").is_ok());
        let err = registry.create("nope", "x").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(name) if name == "nope"));
    }

    #[test]
    fn test_require_env_missing() {
        let err = require_env("MAESTRO_TEST_KEY_THAT_DOES_NOT_EXIST").unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey(_)));
    }
}
