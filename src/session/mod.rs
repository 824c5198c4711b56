//! MQTT Session Management
//!
//! A session outlives its connections: subscriptions, in-flight exchanges and
//! queued messages survive a reconnect with clean start = false until the
//! session expiry interval runs out after the last disconnect.

pub mod alias;
pub mod inflight;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::protocol::{Properties, Publish, QoS, SubscriptionOptions, Will, MAX_VARIABLE_INT};

pub use alias::{AliasAssignment, InboundAliases, OutboundAliases};
pub use inflight::{InboundWindow, InflightMessage, InflightState, OutboundWindow};

/// Session expiry interval meaning "never expires"
pub const SESSION_NEVER_EXPIRES: u32 = u32::MAX;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Connection closed, session kept until it expires
    Disconnected,
}

/// Subscription entry in session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubscription {
    /// Topic filter as subscribed, `$share/` prefix included
    pub filter: String,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

/// Will message armed at CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
    /// Will delay interval in seconds
    pub delay_interval: u32,
}

impl WillMessage {
    pub fn from_will(will: &Will) -> Self {
        Self {
            topic: will.topic.as_str().into(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
            properties: will.properties.forwardable(),
            delay_interval: will.properties.will_delay_interval.unwrap_or(0),
        }
    }

    pub fn to_publish(&self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// A message waiting in the session queue
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Ready to send apart from packet id and topic alias
    pub publish: Publish,
    pub queued_at: Instant,
}

impl PendingMessage {
    pub fn new(publish: Publish) -> Self {
        Self {
            publish,
            queued_at: Instant::now(),
        }
    }

    /// Message expiry left at `now`; `None` when the message never expires
    pub fn remaining_expiry(&self, now: Instant) -> Option<u32> {
        let interval = self.publish.properties.message_expiry_interval?;
        let waited = now.saturating_duration_since(self.queued_at).as_secs();
        Some(u64::from(interval).saturating_sub(waited) as u32)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining_expiry(now) == Some(0)
    }

    /// The PUBLISH to send, with the expiry reduced by the time spent queued
    pub fn into_publish(self, now: Instant) -> Publish {
        let remaining = self.remaining_expiry(now);
        let mut publish = self.publish;
        if remaining.is_some() {
            publish.properties.message_expiry_interval = remaining;
        }
        publish
    }
}

/// Client session
#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    pub state: SessionState,
    /// Clean start flag of the CONNECT that created or last resumed the session
    pub clean_start: bool,
    /// Effective session expiry interval in seconds (0 = delete on disconnect)
    pub session_expiry_interval: u32,
    /// CONNECT carried a zero session expiry; DISCONNECT may not raise it
    pub connect_expiry_was_zero: bool,
    pub keep_alive: u16,
    /// Subscriptions keyed by filter (with any `$share/` prefix)
    pub subscriptions: HashMap<String, SessionSubscription>,
    /// Server to client in-flight exchanges
    pub outbound: OutboundWindow,
    /// Client to server QoS 2 exchanges awaiting PUBREL
    pub inbound: InboundWindow,
    /// Messages not yet sent, in arrival order
    pub pending: VecDeque<PendingMessage>,
    pub max_pending: usize,
    /// Client maximum packet size
    pub max_packet_size: u32,
    pub will: Option<WillMessage>,
    pub disconnected_at: Option<Instant>,
    /// Identifies the connection currently owning the session
    pub connection_id: u64,
}

impl Session {
    pub fn new(client_id: Arc<str>) -> Self {
        Self {
            client_id,
            state: SessionState::Connected,
            clean_start: true,
            session_expiry_interval: 0,
            connect_expiry_was_zero: true,
            keep_alive: 60,
            subscriptions: HashMap::new(),
            outbound: OutboundWindow::new(u16::MAX),
            inbound: InboundWindow::new(u16::MAX),
            pending: VecDeque::new(),
            max_pending: 1000,
            max_packet_size: MAX_VARIABLE_INT,
            will: None,
            disconnected_at: None,
            connection_id: 0,
        }
    }

    /// Time after the last disconnect at which the session ends
    pub fn expiry_duration(&self) -> Option<Duration> {
        match self.session_expiry_interval {
            SESSION_NEVER_EXPIRES => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    /// Check if session has expired
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        let (Some(expiry), Some(disconnected_at)) = (self.expiry_duration(), self.disconnected_at)
        else {
            return false;
        };
        now.saturating_duration_since(disconnected_at) >= expiry
    }

    pub fn mark_connected(&mut self, connection_id: u64) {
        self.state = SessionState::Connected;
        self.disconnected_at = None;
        self.connection_id = connection_id;
    }

    pub fn mark_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.disconnected_at = Some(Instant::now());
    }

    /// Queue a message for delivery; drops the oldest when full.
    ///
    /// Returns false when a message had to be dropped.
    pub fn queue_message(&mut self, publish: Publish) -> bool {
        let mut dropped = false;
        if self.max_pending > 0 && self.pending.len() >= self.max_pending {
            self.pending.pop_front();
            dropped = true;
        }
        self.pending.push_back(PendingMessage::new(publish));
        !dropped
    }

    /// Drop queued messages whose expiry has elapsed, returning how many
    pub fn purge_expired_pending(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|m| !m.is_expired(now));
        before - self.pending.len()
    }

    /// Add or replace a subscription; returns true when the filter was already subscribed
    pub fn add_subscription(
        &mut self,
        filter: String,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> bool {
        self.subscriptions
            .insert(
                filter.clone(),
                SessionSubscription {
                    filter,
                    options,
                    subscription_id,
                },
            )
            .is_some()
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// Thread-safe session store
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Resume the session of `client_id` or start a new one.
    ///
    /// Returns the session and whether an existing one was resumed. Clean
    /// start always discards the existing session; an expired session is
    /// never resumed.
    pub fn get_or_create(&self, client_id: &str, clean_start: bool) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_start {
            if let Some(session) = self.sessions.get(&client_id) {
                if !session.read().is_expired(Instant::now()) {
                    return (session.clone(), true);
                }
            }
        }

        let session = Arc::new(RwLock::new(Session::new(client_id.clone())));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    /// Insert a session restored from persistence
    pub fn insert(&self, session: Session) -> Arc<RwLock<Session>> {
        let client_id = session.client_id.clone();
        let session = Arc::new(RwLock::new(session));
        self.sessions.insert(client_id, session.clone());
        session
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// First id from `candidate` that names no existing session
    pub fn unused_client_id(&self, mut candidate: impl FnMut() -> String) -> Arc<str> {
        loop {
            let client_id = candidate();
            if !self.sessions.contains_key(client_id.as_str()) {
                return client_id.into();
            }
        }
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    /// Mark the session disconnected if `connection_id` still owns it.
    ///
    /// Returns `None` when another connection owns the session (takeover),
    /// `Some(true)` when the session was removed (expiry 0), `Some(false)`
    /// when it was kept. `on_removed` runs before the entry is released, so a
    /// CONNECT for the same client id cannot create its session in between.
    pub fn disconnect(
        &self,
        client_id: &str,
        connection_id: u64,
        on_removed: impl FnOnce(&Arc<str>),
    ) -> Option<bool> {
        let session = self.get(client_id)?;
        let should_remove = {
            let mut s = session.write();
            if s.connection_id != connection_id {
                return None;
            }
            s.mark_disconnected();
            s.session_expiry_interval == 0
        };

        // Remove after releasing the session lock
        if should_remove {
            if let Entry::Occupied(entry) = self.sessions.entry(Arc::from(client_id)) {
                if Arc::ptr_eq(entry.get(), &session) {
                    on_removed(entry.key());
                    entry.remove();
                }
            }
        }
        Some(should_remove)
    }

    /// Remove expired sessions, returning their client ids.
    ///
    /// `on_expired` runs for each one while its map shard is still locked.
    /// It must not touch the session store.
    pub fn cleanup_expired(&self, mut on_expired: impl FnMut(&Arc<str>)) -> Vec<Arc<str>> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.sessions.retain(|client_id, session| {
            if session.read().is_expired(now) {
                on_expired(client_id);
                expired.push(client_id.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Snapshot of every session handle
    pub fn all(&self) -> Vec<Arc<RwLock<Session>>> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
