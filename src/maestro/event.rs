//! Events and the two buses that carry them.
//!
//! Two delivery disciplines coexist in the runtime:
//!
//! - [`EventBus`] is topic-keyed pub/sub fan-out. Every handler runs as its
//!   own tokio task, failures are logged and isolated, and delivery is
//!   best-effort at-most-once with no replay and no ordering guarantee
//!   across subscribers.
//! - [`CommandBus`] is a strict FIFO queue with exactly one consumer, used
//!   for inputs the top-level orchestrator must process sequentially (user
//!   messages and approvals).
//!
//! # Example
//!
//! ```rust,no_run
//! use maestro::event::{Event, EventBus, EventType};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let bus = Arc::new(EventBus::new());
//! bus.subscribe_fn(EventType::Heartbeat, |event: Event| async move {
//!     println!("beat from {}", event.source);
//!     Ok(())
//! });
//! bus.publish(Event::new(EventType::Heartbeat, serde_json::json!({"job": "pulse"})));
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Topics recognized by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    TaskCompleted,
    TaskFailed,
    TaskDeleted,
    PlanUpdated,
    SystemStartup,
    SystemShutdown,
    UserMessage,
    UserApproval,
    Heartbeat,
    ToolExecutionStarted,
    ToolExecutionCompleted,
    ToolExecutionFailed,
}

/// An envelope carried on both buses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event from the default `"system"` source.
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self::from_source(event_type, payload, "system")
    }

    /// Build an event tagged with an explicit source component.
    pub fn from_source(
        event_type: EventType,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    /// Inbound chat text from a gateway.
    pub fn user_message(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::from_source(
            EventType::UserMessage,
            serde_json::json!({"chat_id": chat_id.into(), "text": text.into()}),
            "gateway",
        )
    }

    /// Approval verdict from a gateway for a pending permission request.
    pub fn user_approval(chat_id: impl Into<String>, approved: bool) -> Self {
        Self::from_source(
            EventType::UserApproval,
            serde_json::json!({"chat_id": chat_id.into(), "approved": approved}),
            "gateway",
        )
    }

    /// Convenience accessor for a string payload field.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Result type for event handlers; errors are logged by the bus.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Receives events for one subscribed topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> HandlerResult;
}

/// Adapter turning an async closure into an [`EventHandler`].
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, event: Event) -> HandlerResult {
        (self.f)(event).await
    }
}

/// Topic-keyed pub/sub with isolated concurrent handlers.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic. Handlers accumulate; there is no
    /// unsubscribe (subscriptions live as long as the bus).
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.entry(event_type).or_default().push(handler);
    }

    /// Register an async closure for a topic.
    pub fn subscribe_fn<F, Fut>(&self, event_type: EventType, f: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe(event_type, Arc::new(FnHandler { f }));
    }

    /// Dispatch `event` to every subscriber of its topic.
    ///
    /// Non-blocking: each handler runs as an independent tokio task, and a
    /// failing handler affects neither its peers nor the publisher.
    pub fn publish(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subs = self
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match subs.get(&event.event_type) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                let event_type = event.event_type;
                if let Err(err) = handler.handle(event).await {
                    log::error!("event handler failed for {:?}: {}", event_type, err);
                }
            });
        }
    }

    /// Number of handlers currently subscribed to a topic.
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event_type)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

/// Unbounded FIFO queue feeding the single orchestrator loop.
///
/// Producers call [`send`](CommandBus::send) from anywhere; exactly one
/// consumer loop calls [`receive`](CommandBus::receive). Delivery order is
/// strict FIFO.
pub struct CommandBus {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl CommandBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue an event. Never blocks; a closed bus (consumer dropped) is
    /// logged and the event discarded.
    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            log::warn!("command bus closed; event dropped");
        }
    }

    /// Await the next event. Returns `None` only if every sender handle is
    /// gone, which does not happen while the bus itself is alive.
    pub async fn receive(&self) -> Option<Event> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Drain whatever is immediately available without waiting.
    pub async fn drain(&self) -> Vec<Event> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(event) = rx.try_recv() {
            drained.push(event);
        }
        drained
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}
