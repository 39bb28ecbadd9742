//! Ordered conversation memory with bounded retention.
//!
//! [`Memory`] is an append-only message log owned by a single agent. When a
//! `max_messages` limit is configured, trimming keeps every `system`
//! message plus the most recent non-system messages, so the priming prefix
//! is never lost. A separate [`compact`](Memory::compact) operation folds
//! the older part of the conversation into one synthetic system checkpoint
//! while preserving the recent tail verbatim.

use crate::maestro::types::{Message, Role};

/// Number of trailing non-system messages always preserved by `compact`.
pub const DEFAULT_COMPACTION_TAIL: usize = 10;

/// Append-only ordered message log.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    history: Vec<Message>,
    max_messages: Option<usize>,
}

impl Memory {
    /// Unbounded memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory that retains at most `max_messages` entries, counting the
    /// system prefix against the limit.
    pub fn with_limit(max_messages: usize) -> Self {
        Self {
            history: Vec::new(),
            max_messages: Some(max_messages),
        }
    }

    /// Append a message, then apply the retention rule.
    pub fn add(&mut self, message: Message) {
        self.history.push(message);

        if let Some(limit) = self.max_messages {
            if self.history.len() > limit {
                let system: Vec<Message> = self
                    .history
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .cloned()
                    .collect();
                let other: Vec<Message> = self
                    .history
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .cloned()
                    .collect();

                let keep = limit.saturating_sub(system.len());
                let tail_start = other.len().saturating_sub(keep);

                let mut trimmed = system;
                trimmed.extend_from_slice(&other[tail_start..]);
                self.history = trimmed;
            }
        }
    }

    /// Shortcut for appending a user message.
    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.add(Message::user(content));
    }

    /// Full history in original order.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Drop everything, including system messages.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Replace the leading window of non-system messages with a single
    /// synthetic system checkpoint carrying `summary`.
    ///
    /// The most recent [`DEFAULT_COMPACTION_TAIL`] non-system messages are
    /// kept verbatim. Returns the number of messages folded into the
    /// checkpoint (zero when there is nothing to fold, in which case the
    /// history is left untouched).
    pub fn compact(&mut self, summary: impl Into<String>) -> usize {
        self.compact_with_tail(summary, DEFAULT_COMPACTION_TAIL)
    }

    /// [`compact`](Memory::compact) with an explicit tail window size.
    pub fn compact_with_tail(&mut self, summary: impl Into<String>, tail: usize) -> usize {
        let system: Vec<Message> = self
            .history
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let other: Vec<Message> = self
            .history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        if other.len() <= tail {
            return 0;
        }

        let folded = other.len() - tail;
        let checkpoint = Message::system(format!(
            "[Conversation checkpoint] Earlier exchange summarized: {}",
            summary.into()
        ));

        let mut compacted = system;
        compacted.push(checkpoint);
        compacted.extend_from_slice(&other[folded..]);
        self.history = compacted;
        folded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: usize) -> Message {
        Message::user(format!("msg-{}", n))
    }

    #[test]
    fn test_retention_preserves_system_prefix() {
        let mut memory = Memory::with_limit(4);
        memory.add(Message::system("prompt"));
        for n in 0..6 {
            memory.add(user(n));
        }

        let history = memory.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::System);
        // Limit 4 minus one system message leaves the 3 most recent users.
        assert_eq!(history[1].content.as_deref(), Some("msg-3"));
        assert_eq!(history[2].content.as_deref(), Some("msg-4"));
        assert_eq!(history[3].content.as_deref(), Some("msg-5"));
    }

    #[test]
    fn test_unbounded_memory_never_trims() {
        let mut memory = Memory::new();
        for n in 0..100 {
            memory.add(user(n));
        }
        assert_eq!(memory.len(), 100);
    }

    #[test]
    fn test_compact_keeps_tail_verbatim() {
        let mut memory = Memory::new();
        memory.add(Message::system("prompt"));
        for n in 0..15 {
            memory.add(user(n));
        }

        let folded = memory.compact("they discussed fifteen things");
        assert_eq!(folded, 5);

        let history = memory.history();
        // system prompt + checkpoint + 10 tail messages
        assert_eq!(history.len(), 12);
        assert_eq!(history[0].content.as_deref(), Some("prompt"));
        assert_eq!(history[1].role, Role::System);
        assert!(history[1]
            .content
            .as_deref()
            .unwrap()
            .contains("Conversation checkpoint"));
        assert_eq!(history[2].content.as_deref(), Some("msg-5"));
        assert_eq!(history[11].content.as_deref(), Some("msg-14"));
    }

    #[test]
    fn test_compact_noop_when_under_tail() {
        let mut memory = Memory::new();
        memory.add(Message::system("prompt"));
        for n in 0..5 {
            memory.add(user(n));
        }
        assert_eq!(memory.compact("nothing to fold"), 0);
        assert_eq!(memory.len(), 6);
    }
}
