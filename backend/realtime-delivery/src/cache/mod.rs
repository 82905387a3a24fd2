//! Per-conversation message cache.
//!
//! Capacity is counted in conversations. Inserting a conversation beyond
//! capacity evicts the one written least recently; reads do not refresh
//! recency. Entries older than `max_age` (since their last write) are
//! dropped lazily when read.

use crate::config::CacheConfig;
use crate::models::{Message, MessagePatch, MessageStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub per_conversation: BTreeMap<String, usize>,
}

#[derive(Debug)]
struct ConversationEntry {
    messages: Vec<Message>,
    last_write_at: Instant,
}

impl ConversationEntry {
    fn is_stale(&self, now: Instant, max_age: std::time::Duration) -> bool {
        now.duration_since(self.last_write_at) > max_age
    }

    /// Insert keeping ascending `created_at`; equal timestamps keep arrival order.
    /// A message whose id is already present replaces the old copy.
    fn insert(&mut self, message: Message) {
        if let Some(pos) = self.messages.iter().position(|m| m.id == message.id) {
            self.messages.remove(pos);
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
    }

    fn trim_to(&mut self, max_messages: usize) {
        if self.messages.len() > max_messages {
            let excess = self.messages.len() - max_messages;
            self.messages.drain(..excess);
        }
    }
}

#[derive(Debug)]
pub struct MessageCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, ConversationEntry>>,
}

impl MessageCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Replace a conversation wholesale, typically after a full fetch
    pub fn set(&self, conversation_id: &str, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.created_at);
        let mut entry = ConversationEntry {
            messages,
            last_write_at: Instant::now(),
        };
        entry.trim_to(self.config.max_messages_per_conversation);

        let mut entries = self.entries.lock();
        if !entries.contains_key(conversation_id) {
            self.make_room(&mut entries);
        }
        entries.insert(conversation_id.to_string(), entry);
    }

    /// Merge messages into a conversation, creating it when absent
    pub fn add_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if !entries.contains_key(conversation_id) {
            self.make_room(&mut entries);
        }
        let entry = entries
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationEntry {
                messages: Vec::new(),
                last_write_at: now,
            });

        // Appending to a stale entry starts it over
        if entry.is_stale(now, self.config.max_age) {
            entry.messages.clear();
        }
        for message in messages {
            entry.insert(message);
        }
        entry.trim_to(self.config.max_messages_per_conversation);
        entry.last_write_at = now;
    }

    /// Apply `patch` to the message with `message_id`; false when not cached
    pub fn update_message(&self, conversation_id: &str, message_id: &str, patch: &MessagePatch) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(conversation_id) else {
            return false;
        };
        match entry.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                patch.apply(message);
                true
            }
            None => false,
        }
    }

    /// Move a message's status forward; stale or backward updates are ignored
    pub fn advance_status(&self, conversation_id: &str, message_id: &str, status: MessageStatus) -> bool {
        let mut entries = self.entries.lock();
        let Some(message) = entries
            .get_mut(conversation_id)
            .and_then(|entry| entry.messages.iter_mut().find(|m| m.id == message_id))
        else {
            return false;
        };
        if !message.status.advances_to(status) {
            return false;
        }
        message.status = status;
        true
    }

    /// Ordered copy of a conversation; `None` when absent or expired
    pub fn get(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.get(conversation_id)?;

        if entry.is_stale(now, self.config.max_age) {
            entries.remove(conversation_id);
            debug!(conversation_id = %conversation_id, "evicted stale conversation on read");
            return None;
        }
        Some(entry.messages.clone())
    }

    pub fn get_message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.get(conversation_id)?
            .into_iter()
            .find(|m| m.id == message_id)
    }

    pub fn contains_message(&self, conversation_id: &str, message_id: &str) -> bool {
        self.entries
            .lock()
            .get(conversation_id)
            .is_some_and(|entry| entry.messages.iter().any(|m| m.id == message_id))
    }

    /// Case-insensitive substring search over message content, in conversation order.
    /// A blank query matches nothing.
    pub fn search_messages(&self, conversation_id: &str, query: &str) -> Vec<Message> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.get(conversation_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect()
    }

    /// Drop one message; a conversation left empty is dropped with it
    pub fn remove_message(&self, conversation_id: &str, message_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(conversation_id) else {
            return false;
        };
        let Some(pos) = entry.messages.iter().position(|m| m.id == message_id) else {
            return false;
        };
        entry.messages.remove(pos);
        if entry.messages.is_empty() {
            entries.remove(conversation_id);
        }
        true
    }

    pub fn remove(&self, conversation_id: &str) -> bool {
        self.entries.lock().remove(conversation_id).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every expired entry now instead of waiting for a read
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_age;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_stale(now, max_age));
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, "pruned expired conversations");
        }
        pruned
    }

    pub fn get_stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let per_conversation: BTreeMap<String, usize> = entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.messages.len()))
            .collect();
        CacheStats {
            total_conversations: entries.len(),
            total_messages: per_conversation.values().sum(),
            per_conversation,
        }
    }

    /// Evict least-recently-written conversations until one more fits
    fn make_room(&self, entries: &mut HashMap<String, ConversationEntry>) {
        while entries.len() >= self.config.max_conversations {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_write_at)
                .map(|(id, _)| id.clone())
            else {
                return;
            };
            entries.remove(&oldest);
            debug!(conversation_id = %oldest, "evicted conversation at capacity");
        }
    }
}
