//! The agent reasoning loop.
//!
//! An [`Agent`] alternates between asking its [`Provider`] for the next
//! step and dispatching the requested tool calls through the
//! [`ExecutionEngine`], bounded by `max_steps` LLM turns per call. The
//! streaming entry point yields [`StreamChunk`]s in causal order and
//! suspends for human approval when a turn requests any tool listed in
//! `sensitive_tool_names`.
//!
//! # Suspension and resumption
//!
//! When a sensitive call appears, the whole turn's call batch is parked in
//! `pending_tool_calls`, a single `PermissionRequest` chunk is emitted,
//! and the stream ends. The *next* call to [`stream`](Agent::stream)
//! interprets its raw input as the approval token: `yes`, `y`, `approve`
//! or `confirm` (trimmed, case-insensitive) approves; anything else
//! denies, synthesizing an error result per pending call. The approval
//! text itself is never appended to the conversation.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use maestro::agent::Agent;
//! use maestro::event::EventBus;
//! use maestro::execution_engine::ExecutionEngine;
//! use maestro::provider::EchoProvider;
//! use maestro::tool_registry::ToolRegistry;
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! # async fn example() {
//! let registry = Arc::new(RwLock::new(ToolRegistry::new()));
//! let engine = ExecutionEngine::new(registry, Arc::new(EventBus::new()));
//! let agent = Agent::new(Arc::new(EchoProvider::new("echo-1")), engine)
//!     .with_system_prompt("You are helpful.");
//!
//! let mut stream = agent.stream("hello");
//! while let Some(chunk) = stream.next().await {
//!     println!("{:?}", chunk);
//! }
//! # }
//! ```

use futures_util::stream::{FuturesUnordered, Stream};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::maestro::execution_engine::ExecutionEngine;
use crate::maestro::memory::Memory;
use crate::maestro::provider::Provider;
use crate::maestro::tool_registry::{ToolDefinition, ToolRegistry};
use crate::maestro::types::{
    AgentError, Message, StreamChunk, ToolCall, ToolResult,
};

/// Default bound on LLM turns per `stream`/`run` call.
pub const DEFAULT_MAX_STEPS: usize = 10;

/// Boxed chunk stream returned by [`Agent::stream`].
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AgentError>> + Send>>;

/// Tokens accepted as approval on HITL resumption.
fn is_approval(input: &str) -> bool {
    matches!(
        input.trim().to_lowercase().as_str(),
        "yes" | "y" | "approve" | "confirm"
    )
}

/// A streaming, tool-calling conversation bound to one provider, one tool
/// registry, and one memory.
///
/// The loop is not safe to invoke concurrently on the same instance; the
/// instance's single streaming caller owns that responsibility. All inner
/// state is `Arc`-shared so the loop body can run as a detached task while
/// the caller consumes the chunk stream.
pub struct Agent {
    provider: Arc<dyn Provider>,
    engine: ExecutionEngine,
    memory: Arc<Mutex<Memory>>,
    system_prompt: Option<String>,
    max_steps: usize,
    sensitive_tool_names: HashSet<String>,
    pending_tool_calls: Arc<Mutex<Option<Vec<ToolCall>>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("provider", &self.provider)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>, engine: ExecutionEngine) -> Self {
        Self {
            provider,
            engine,
            memory: Arc::new(Mutex::new(Memory::new())),
            system_prompt: None,
            max_steps: DEFAULT_MAX_STEPS,
            sensitive_tool_names: HashSet::new(),
            pending_tool_calls: Arc::new(Mutex::new(None)),
        }
    }

    /// System prompt seeded into an empty memory on the first turn.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Attach an existing (possibly shared) memory.
    pub fn with_memory(mut self, memory: Arc<Mutex<Memory>>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Tool names that require human approval before execution.
    pub fn with_sensitive_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive_tool_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Shared handle to this agent's conversation memory.
    pub fn memory(&self) -> Arc<Mutex<Memory>> {
        Arc::clone(&self.memory)
    }

    /// The tool registry this agent executes against.
    pub fn registry(&self) -> Arc<RwLock<ToolRegistry>> {
        Arc::clone(self.engine.registry())
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Whether the last stream ended in a permission request that has not
    /// been resolved yet.
    pub async fn has_pending_permissions(&self) -> bool {
        self.pending_tool_calls.lock().await.is_some()
    }

    /// Seed the system prompt into an empty memory. Also re-seeds after an
    /// explicit `Memory::clear`, which is what sub-agent isolation relies
    /// on.
    async fn seed_system_prompt(&self) {
        if let Some(prompt) = &self.system_prompt {
            let mut memory = self.memory.lock().await;
            if memory.is_empty() {
                memory.add(Message::system(prompt.clone()));
            }
        }
    }

    /// Run one streaming call of the reasoning loop.
    ///
    /// The returned stream yields chunks in causal order and ends with
    /// either a [`StreamChunk::Done`] terminator, a
    /// [`StreamChunk::PermissionRequest`] suspension, or an error item
    /// preceded by a `❌`-marked content chunk.
    pub fn stream(&self, input: &str) -> AgentStream {
        let (tx, rx) = mpsc::channel::<Result<StreamChunk, AgentError>>(64);
        let worker = LoopWorker {
            provider: Arc::clone(&self.provider),
            engine: self.engine.clone(),
            memory: Arc::clone(&self.memory),
            system_prompt: self.system_prompt.clone(),
            max_steps: self.max_steps,
            sensitive_tool_names: self.sensitive_tool_names.clone(),
            pending_tool_calls: Arc::clone(&self.pending_tool_calls),
        };
        let input = input.to_string();

        tokio::spawn(async move {
            if let Err(err) = worker.run(&input, &tx).await {
                log::error!("agent loop failed: {}", err);
                let _ = tx
                    .send(Ok(StreamChunk::Content(format!("\n\n❌ {}", err))))
                    .await;
                let _ = tx.send(Err(err)).await;
            }
        });

        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    /// Legacy non-streaming loop over [`Provider::generate`]; returns the
    /// final assistant content. Does not implement HITL suspension (the
    /// streaming path owns that), so sensitive tools execute directly.
    ///
    /// Used by sub-agent delegation, where the parent agent needs a single
    /// final answer.
    pub async fn run(&self, input: &str) -> Result<String, AgentError> {
        self.seed_system_prompt().await;
        self.memory.lock().await.add_user_message(input);

        let mut step_count = 0;
        while step_count < self.max_steps {
            step_count += 1;

            let (history, tools) = self.snapshot().await;
            let mut response = self.provider.generate(&history, &tools).await?;
            for call in &mut response.tool_calls {
                call.ensure_id();
            }

            self.memory.lock().await.add(Message::assistant(
                response.content.clone().filter(|c| !c.is_empty()),
                response.tool_calls.clone(),
            ));

            if response.tool_calls.is_empty() {
                return Ok(response.content.unwrap_or_default());
            }

            let results = self.engine.execute_calls(&response.tool_calls).await;
            self.memory.lock().await.add(Message::tool(results));
        }

        Err(AgentError::MaxStepsExceeded(format!(
            "max steps ({}) reached without a final answer",
            self.max_steps
        )))
    }

    async fn snapshot(&self) -> (Vec<Message>, Vec<ToolDefinition>) {
        let history = self.memory.lock().await.history().to_vec();
        let tools = self.engine.registry().read().await.export();
        (history, tools)
    }
}

/// Everything the detached loop task needs, cloned out of the agent so the
/// caller keeps ownership while the stream is consumed.
struct LoopWorker {
    provider: Arc<dyn Provider>,
    engine: ExecutionEngine,
    memory: Arc<Mutex<Memory>>,
    system_prompt: Option<String>,
    max_steps: usize,
    sensitive_tool_names: HashSet<String>,
    pending_tool_calls: Arc<Mutex<Option<Vec<ToolCall>>>>,
}

type ChunkSender = mpsc::Sender<Result<StreamChunk, AgentError>>;

impl LoopWorker {
    /// Forward a chunk to the consumer. Returns `false` when the consumer
    /// dropped the stream, which the loop treats as cancellation.
    async fn emit(&self, tx: &ChunkSender, chunk: StreamChunk) -> bool {
        tx.send(Ok(chunk)).await.is_ok()
    }

    async fn run(&self, input: &str, tx: &ChunkSender) -> Result<(), AgentError> {
        // Resolve a pending permission request before anything else.
        let pending = self.pending_tool_calls.lock().await.take();
        if let Some(calls) = pending {
            if is_approval(input) {
                if !self
                    .emit(
                        tx,
                        StreamChunk::Content(
                            "✅ Permission granted. Resuming execution...\n".into(),
                        ),
                    )
                    .await
                {
                    return Ok(());
                }
                if !self.execute_and_stream(&calls, tx).await {
                    return Ok(());
                }
            } else {
                if !self
                    .emit(
                        tx,
                        StreamChunk::Content(
                            "❌ Permission denied. Cancelling tool execution.\n".into(),
                        ),
                    )
                    .await
                {
                    return Ok(());
                }
                let results: Vec<ToolResult> = calls
                    .iter()
                    .map(|call| {
                        ToolResult::failure(
                            call,
                            format!("user denied permission; input: {}", input),
                        )
                    })
                    .collect();
                self.memory.lock().await.add(Message::tool(results));
            }
            // The approval text is not conversation; fall through to the
            // step loop without appending a user message.
        } else {
            self.seed_system_prompt().await;
            self.memory.lock().await.add_user_message(input);
        }

        let mut step_count = 0;
        while step_count < self.max_steps {
            step_count += 1;

            let history = self.memory.lock().await.history().to_vec();
            let tools = self.engine.registry().read().await.export();

            let mut provider_stream = self.provider.stream(&history, &tools).await?;
            let mut content = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();

            while let Some(chunk) = provider_stream.next().await {
                match chunk? {
                    StreamChunk::Content(delta) => {
                        content.push_str(&delta);
                        if !self.emit(tx, StreamChunk::Content(delta)).await {
                            return Ok(());
                        }
                    }
                    StreamChunk::ToolCall(mut call) => {
                        call.ensure_id();
                        tool_calls.push(call.clone());
                        if !self.emit(tx, StreamChunk::ToolCall(call)).await {
                            return Ok(());
                        }
                    }
                    other => {
                        if !self.emit(tx, other).await {
                            return Ok(());
                        }
                    }
                }
            }

            self.memory.lock().await.add(Message::assistant(
                if content.is_empty() {
                    None
                } else {
                    Some(content)
                },
                tool_calls.clone(),
            ));

            if tool_calls.is_empty() {
                let _ = self.emit(tx, StreamChunk::done()).await;
                return Ok(());
            }

            let sensitive: Vec<ToolCall> = tool_calls
                .iter()
                .filter(|call| self.sensitive_tool_names.contains(&call.name))
                .cloned()
                .collect();
            if !sensitive.is_empty() {
                *self.pending_tool_calls.lock().await = Some(tool_calls);
                let _ = self.emit(tx, StreamChunk::PermissionRequest(sensitive)).await;
                return Ok(());
            }

            if !self.execute_and_stream(&tool_calls, tx).await {
                return Ok(());
            }
        }

        let _ = self
            .emit(
                tx,
                StreamChunk::Content("\n\nMax steps reached without final answer.".into()),
            )
            .await;
        Err(AgentError::MaxStepsExceeded(format!(
            "max steps ({}) reached without a final answer",
            self.max_steps
        )))
    }

    async fn seed_system_prompt(&self) {
        if let Some(prompt) = &self.system_prompt {
            let mut memory = self.memory.lock().await;
            if memory.is_empty() {
                memory.add(Message::system(prompt.clone()));
            }
        }
    }

    /// Dispatch one batch concurrently, emitting a result chunk as each
    /// call completes, then append one tool message whose results sit in
    /// input index order (pre-sized slot vector). Returns `false` on
    /// consumer cancellation.
    async fn execute_and_stream(&self, calls: &[ToolCall], tx: &ChunkSender) -> bool {
        let mut in_flight = FuturesUnordered::new();
        for (index, call) in calls.iter().enumerate() {
            let engine = self.engine.clone();
            let call = call.clone();
            in_flight.push(async move { (index, engine.execute_single(&call).await) });
        }

        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut cancelled = false;
        while let Some((index, result)) = in_flight.next().await {
            if !cancelled && !self.emit(tx, StreamChunk::ToolResult(result.clone())).await {
                // Keep draining so every slot fills and memory stays
                // consistent even when the consumer walked away.
                cancelled = true;
            }
            slots[index] = Some(result);
        }

        let results: Vec<ToolResult> = slots.into_iter().flatten().collect();
        self.memory.lock().await.add(Message::tool(results));
        !cancelled
    }
}
