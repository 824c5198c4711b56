//! Topic alias tables
//!
//! Both tables live on the connection, not the session: they start empty on
//! every CONNECT and are dropped with the connection.

use std::sync::Arc;

use ahash::AHashMap;

use crate::protocol::{ProtocolError, Publish};

/// Client to server aliases, bounded by the server's Topic Alias Maximum
#[derive(Debug, Default)]
pub struct InboundAliases {
    maximum: u16,
    topics: AHashMap<u16, Arc<str>>,
}

impl InboundAliases {
    pub fn new(maximum: u16) -> Self {
        Self {
            maximum,
            topics: AHashMap::new(),
        }
    }

    /// Replace an aliased topic in `publish` with the full topic name.
    ///
    /// A PUBLISH with both a topic and an alias (re)binds the alias. Alias 0,
    /// an alias above the maximum, or an alias never bound on this connection
    /// is a protocol error.
    pub fn resolve(&mut self, publish: &mut Publish) -> Result<(), ProtocolError> {
        let Some(alias) = publish.properties.topic_alias.take() else {
            if publish.topic.is_empty() {
                return Err(ProtocolError::Violation("empty topic without topic alias"));
            }
            return Ok(());
        };

        if alias == 0 || alias > self.maximum {
            return Err(ProtocolError::TopicAliasInvalid(alias));
        }

        if publish.topic.is_empty() {
            publish.topic = self
                .topics
                .get(&alias)
                .cloned()
                .ok_or(ProtocolError::TopicAliasInvalid(alias))?;
        } else {
            self.topics.insert(alias, publish.topic.clone());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Server to client aliases, bounded by the client's Topic Alias Maximum
#[derive(Debug, Default)]
pub struct OutboundAliases {
    maximum: u16,
    by_topic: AHashMap<Arc<str>, u16>,
    next: u16,
}

/// How a topic travels in an outbound PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasAssignment {
    /// Full topic, no alias
    None,
    /// Full topic plus a newly bound alias
    New(u16),
    /// Empty topic, alias only
    Existing(u16),
}

impl OutboundAliases {
    pub fn new(maximum: u16) -> Self {
        Self {
            maximum,
            by_topic: AHashMap::new(),
            next: 1,
        }
    }

    /// Alias form `topic` would travel in, without binding anything
    pub fn peek(&self, topic: &Arc<str>) -> AliasAssignment {
        if let Some(&alias) = self.by_topic.get(topic) {
            return AliasAssignment::Existing(alias);
        }
        if self.maximum == 0 || self.next > self.maximum {
            return AliasAssignment::None;
        }
        AliasAssignment::New(self.next)
    }

    /// Rewrite `publish` to use an alias where one is available.
    ///
    /// An alias that would push the packet past `max_packet_size` is not used
    /// and a new one is not bound, so the packet goes out with its full topic.
    pub fn apply(&mut self, publish: &mut Publish, max_packet_size: u32) -> AliasAssignment {
        let assignment = self.peek(&publish.topic);
        let topic = match assignment {
            AliasAssignment::None => return assignment,
            AliasAssignment::New(alias) => {
                publish.properties.topic_alias = Some(alias);
                None
            }
            AliasAssignment::Existing(alias) => {
                publish.properties.topic_alias = Some(alias);
                Some(std::mem::replace(&mut publish.topic, Arc::from("")))
            }
        };

        if publish.encoded_len() > max_packet_size as usize {
            publish.properties.topic_alias = None;
            if let Some(topic) = topic {
                publish.topic = topic;
            }
            return AliasAssignment::None;
        }

        if let AliasAssignment::New(alias) = assignment {
            self.next += 1;
            self.by_topic.insert(publish.topic.clone(), alias);
        }
        assignment
    }
}
