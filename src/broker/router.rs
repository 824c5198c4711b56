//! Message Router
//!
//! Turns one PUBLISH into at most one queued delivery per subscribed session.
//! Overlapping subscriptions of a session are merged: highest granted QoS,
//! union of subscription identifiers, retain-as-published if any asks for it.
//! Deliveries go into the session queue; the live connection, if any, is only
//! notified and pumps the queue through its own in-flight window.

use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use smallvec::SmallVec;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{BrokerConfig, BrokerEvent, ConnectionHandle};
use crate::persistence::{PersistenceManager, PersistenceOp, StoredRetainedMessage};
use crate::protocol::{Publish, QoS};
use crate::retained::{RetainOutcome, RetainedStore};
use crate::session::{SessionStore, WillMessage};
use crate::topic::SubscriptionStore;
use crate::will::WillPublisher;

/// Aggregated subscription info for a single client during message routing
struct ClientSub {
    qos: QoS,
    retain_as_published: bool,
    subscription_ids: SmallVec<[u32; 4]>,
}

pub struct MessageRouter {
    config: Arc<BrokerConfig>,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<RetainedStore>,
    connections: Arc<DashMap<Arc<str>, Arc<ConnectionHandle>>>,
    events: broadcast::Sender<BrokerEvent>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl MessageRouter {
    pub(crate) fn new(
        config: Arc<BrokerConfig>,
        sessions: Arc<SessionStore>,
        subscriptions: Arc<SubscriptionStore>,
        retained: Arc<RetainedStore>,
        connections: Arc<DashMap<Arc<str>, Arc<ConnectionHandle>>>,
        events: broadcast::Sender<BrokerEvent>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        Self {
            config,
            sessions,
            subscriptions,
            retained,
            connections,
            events,
            persistence,
        }
    }

    /// Route `publish` to every matching subscription.
    ///
    /// `sender` is the publishing client, `None` for server-originated
    /// messages. A retained publish updates the retained store first. Returns
    /// the number of sessions the message was queued to.
    pub fn publish(&self, sender: Option<&str>, publish: Publish) -> usize {
        if publish.retain && self.config.retain_available {
            self.update_retained(&publish);
        }

        let matches = self.subscriptions.matches(&publish.topic);

        let mut client_subs: AHashMap<Arc<str>, ClientSub> =
            AHashMap::with_capacity(matches.len());
        for sub in &matches {
            if sub.no_local && sender == Some(sub.client_id.as_ref()) {
                continue;
            }

            match client_subs.get_mut(&sub.client_id) {
                Some(entry) => {
                    if sub.qos > entry.qos {
                        entry.qos = sub.qos;
                    }
                    if sub.retain_as_published {
                        entry.retain_as_published = true;
                    }
                    if let Some(id) = sub.subscription_id {
                        if !entry.subscription_ids.contains(&id) {
                            entry.subscription_ids.push(id);
                        }
                    }
                }
                None => {
                    let mut subscription_ids = SmallVec::new();
                    if let Some(id) = sub.subscription_id {
                        subscription_ids.push(id);
                    }
                    client_subs.insert(
                        sub.client_id.clone(),
                        ClientSub {
                            qos: sub.qos,
                            retain_as_published: sub.retain_as_published,
                            subscription_ids,
                        },
                    );
                }
            }
        }

        // Inbound topic alias and subscription identifiers never travel on
        let properties = publish.properties.forwardable();
        let now = Instant::now();
        let mut delivered = 0;

        for (client_id, sub_info) in client_subs.drain() {
            let Some(session) = self.sessions.get(&client_id) else {
                continue;
            };

            let mut outgoing = Publish {
                dup: false,
                qos: publish.qos.min(sub_info.qos),
                retain: sub_info.retain_as_published && publish.retain,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
                properties: properties.clone(),
            };
            outgoing
                .properties
                .subscription_identifiers
                .extend(sub_info.subscription_ids);

            {
                let mut s = session.write();
                if s.is_expired(now) {
                    continue;
                }
                if !s.queue_message(outgoing) {
                    debug!(client_id = %client_id, "session queue full, dropped oldest message");
                }
            }
            delivered += 1;

            if let Some(handle) = self.connections.get(&client_id) {
                handle.notify();
            }
        }

        trace!(
            topic = %publish.topic,
            qos = ?publish.qos,
            sessions = delivered,
            "routed"
        );
        let _ = self.events.send(BrokerEvent::MessagePublished {
            topic: publish.topic,
            qos: publish.qos,
        });
        delivered
    }

    fn update_retained(&self, publish: &Publish) {
        match self.retained.put(publish) {
            RetainOutcome::Stored | RetainOutcome::Replaced => {
                if let (Some(persistence), Some(message)) =
                    (&self.persistence, self.retained.get(&publish.topic))
                {
                    persistence.write(PersistenceOp::SetRetained {
                        topic: publish.topic.to_string(),
                        message: StoredRetainedMessage::from(&message),
                    });
                }
            }
            RetainOutcome::Deleted => {
                if let Some(ref persistence) = self.persistence {
                    persistence.write(PersistenceOp::DeleteRetained {
                        topic: publish.topic.to_string(),
                    });
                }
            }
            RetainOutcome::Ignored => {}
        }
    }
}

impl WillPublisher for MessageRouter {
    fn publish_will(&self, client_id: &Arc<str>, will: WillMessage) {
        debug!(client_id = %client_id, topic = %will.topic, "publishing will");
        let _ = self.events.send(BrokerEvent::WillPublished {
            client_id: client_id.clone(),
            topic: will.topic.clone(),
        });
        // Injected as if the client had published it
        self.publish(Some(client_id), will.to_publish());
    }
}
