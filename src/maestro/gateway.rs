//! Gateway adapter contract.
//!
//! Gateways sit between external transports (chat bots, websockets, a
//! terminal) and the runtime. Inbound, they translate external input into
//! `user_message` / `user_approval` events on the Command Bus (see
//! [`Event::user_message`](crate::event::Event::user_message)). Outbound,
//! they consume [`StreamChunk`]s and render them, throttling UI edits and
//! presenting approve/deny affordances for permission requests.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::maestro::types::StreamChunk;

/// Errors surfaced by outbound delivery.
#[derive(Debug)]
pub struct GatewayError(pub String);

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gateway error: {}", self.0)
    }
}

impl Error for GatewayError {}

/// Outbound half of a gateway: renders agent output for one chat.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Render one chunk for `chat_id`. Implementations decide how chunks
    /// map to their UI (append, edit-in-place, buttons for permission
    /// requests).
    async fn deliver(&self, chat_id: &str, chunk: &StreamChunk) -> Result<(), GatewayError>;
}

/// Coalesces UI edits to at most one per interval (default one second),
/// so streaming deltas do not hammer rate-limited chat APIs.
pub struct UiThrottle {
    min_interval: Duration,
    last_edit: Mutex<Option<Instant>>,
}

impl Default for UiThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl UiThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_edit: Mutex::new(None),
        }
    }

    /// Whether an edit may go out now. Recording happens on `true`.
    pub fn should_edit(&self) -> bool {
        let mut last = self
            .last_edit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Forget the last edit, forcing the next [`should_edit`] to pass.
    /// Call at message boundaries so finals are never dropped.
    ///
    /// [`should_edit`]: UiThrottle::should_edit
    pub fn reset(&self) {
        *self
            .last_edit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

/// Terminal gateway: renders chunks to stdout. Content deltas print
/// inline, tool activity prints as bracketed status lines, and permission
/// requests print an approve/deny prompt (answered on the next input
/// line).
#[derive(Default)]
pub struct ConsoleGateway;

impl ConsoleGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Gateway for ConsoleGateway {
    async fn deliver(&self, _chat_id: &str, chunk: &StreamChunk) -> Result<(), GatewayError> {
        let mut stdout = std::io::stdout();
        let rendered = match chunk {
            StreamChunk::Content(text) => text.clone(),
            StreamChunk::ToolCall(call) => format!("\n[tool call] {} {}\n", call.name, call.arguments),
            StreamChunk::ToolResult(result) => {
                if let Some(error) = &result.error {
                    format!("[tool error] {}: {}\n", result.name, error)
                } else {
                    format!("[tool done] {}\n", result.name)
                }
            }
            StreamChunk::PermissionRequest(calls) => {
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                format!(
                    "\n⚠️  Approval required for: {}. Reply 'yes' to approve or anything else to deny.\n",
                    names.join(", ")
                )
            }
            StreamChunk::Usage(_) => String::new(),
            StreamChunk::Done { .. } => "\n".to_string(),
        };
        stdout
            .write_all(rendered.as_bytes())
            .and_then(|_| stdout.flush())
            .map_err(|err| GatewayError(err.to_string()))
    }
}
