//! Retained message store
//!
//! One entry per topic name. An empty retained payload deletes the entry.
//! Entries are only consulted at subscribe time; later publishes never
//! re-trigger retained delivery to existing subscriptions.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::protocol::{Properties, Publish, QoS};
use crate::topic::topic_matches_filter;

/// A retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    /// Forwardable properties of the original publish
    pub properties: Properties,
    pub stored_at: Instant,
}

impl RetainedMessage {
    /// Seconds of message expiry left, `None` when the message never expires.
    ///
    /// Returns `Some(0)` once the message has expired.
    pub fn remaining_expiry(&self, now: Instant) -> Option<u32> {
        let interval = self.properties.message_expiry_interval?;
        let waited = now.saturating_duration_since(self.stored_at).as_secs();
        Some(u64::from(interval).saturating_sub(waited) as u32)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining_expiry(now) == Some(0)
    }

    /// PUBLISH carrying this message, retain flag set, expiry reduced by the time stored
    pub fn to_publish(&self, now: Instant) -> Publish {
        let mut properties = self.properties.clone();
        if let Some(remaining) = self.remaining_expiry(now) {
            properties.message_expiry_interval = Some(remaining);
        }
        Publish {
            dup: false,
            qos: self.qos,
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties,
        }
    }
}

/// Result of storing a retained publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainOutcome {
    Stored,
    Replaced,
    Deleted,
    /// Empty payload for a topic with nothing retained
    Ignored,
}

/// Thread-safe retained message store
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
        }
    }

    /// Store, replace or delete the retained message for `publish.topic`
    pub fn put(&self, publish: &Publish) -> RetainOutcome {
        if publish.payload.is_empty() {
            return match self.messages.remove(publish.topic.as_ref()) {
                Some(_) => RetainOutcome::Deleted,
                None => RetainOutcome::Ignored,
            };
        }

        let message = RetainedMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            properties: publish.properties.forwardable(),
            stored_at: Instant::now(),
        };
        match self.messages.insert(publish.topic.clone(), message) {
            Some(_) => RetainOutcome::Replaced,
            None => RetainOutcome::Stored,
        }
    }

    /// Insert a message restored from persistence
    pub fn restore(&self, message: RetainedMessage) {
        self.messages.insert(message.topic.clone(), message);
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.get(topic).map(|m| m.clone())
    }

    /// Snapshot of unexpired messages whose topic matches `filter`
    pub fn match_all(&self, filter: &str) -> Vec<RetainedMessage> {
        let now = Instant::now();
        self.messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drop expired messages, returning their topics
    pub fn purge_expired(&self) -> Vec<Arc<str>> {
        let now = Instant::now();
        let mut purged = Vec::new();
        self.messages.retain(|topic, message| {
            if message.is_expired(now) {
                purged.push(topic.clone());
                false
            } else {
                true
            }
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}
