use tracing::debug;

use crate::model::ChatMessage;

/// Conversation transcript owned by one [`crate::runner::ConversationLoop`].
///
/// Append-only. Empty messages and exact repeats of the last entry are
/// silently skipped so a retried turn cannot land twice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHistory {
    messages: Vec<ChatMessage>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: &str) -> Self {
        let mut history = Self::new();
        history.append(ChatMessage::system(prompt));
        history
    }

    /// Append `message` unless it is empty or identical to the last entry.
    /// Returns whether it was appended.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if message.is_empty() {
            debug!("skipping empty message");
            return false;
        }
        if self.messages.last() == Some(&message) {
            debug!("skipping duplicate message");
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Snapshot for a provider request.
    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }
}
