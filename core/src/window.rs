/// Conversation window: the ordered, de-duplicated slice of a conversation held in memory
use crate::message_types::Message;
use std::collections::BTreeMap;

/// Union `window` and `batch` keyed by message id, sorted by `(timestamp, id)`.
///
/// Pure: the result depends only on the two inputs, so merges commute and
/// repeat safely. On a duplicate id the batch entry wins.
pub fn merge_incoming(window: &[Message], batch: &[Message]) -> Vec<Message> {
    let mut by_id: BTreeMap<i64, &Message> = BTreeMap::new();
    for message in window.iter().chain(batch.iter()) {
        by_id.insert(message.id, message);
    }

    let mut merged: Vec<Message> = by_id.into_values().cloned().collect();
    merged.sort_by_key(Message::sort_key);
    merged
}

/// In-memory ordered sequence of messages for one conversation
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    conversation_id: i64,
    messages: Vec<Message>,
}

impl ConversationWindow {
    /// Empty window, as at selection time
    pub fn new(conversation_id: i64) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Id of the oldest message held; the cursor for "older than" queries
    pub fn oldest_id(&self) -> Option<i64> {
        self.messages.first().map(|m| m.id)
    }

    pub fn newest_id(&self) -> Option<i64> {
        self.messages.last().map(|m| m.id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Merge a batch in and return how many previously unseen ids it added.
    ///
    /// Messages addressed to another conversation are dropped before merging.
    pub fn merge(&mut self, batch: &[Message]) -> usize {
        self.merge_new_ids(batch).len()
    }

    /// Like `merge`, but returns the ids that were not in the window before
    pub fn merge_new_ids(&mut self, batch: &[Message]) -> Vec<i64> {
        let relevant: Vec<Message> = batch
            .iter()
            .filter(|m| m.conversation_id == self.conversation_id)
            .cloned()
            .collect();
        if relevant.is_empty() {
            return Vec::new();
        }

        let mut new_ids: Vec<i64> = relevant
            .iter()
            .map(|m| m.id)
            .filter(|id| !self.contains(*id))
            .collect();
        new_ids.sort_unstable();
        new_ids.dedup();

        self.messages = merge_incoming(&self.messages, &relevant);
        new_ids
    }
}
