//! Session Engine Core
//!
//! The [`Broker`] owns every shared store and hands each new connection a
//! task that speaks typed [`Packet`]s over a pair of channels. It never reads
//! or writes bytes; a codec/transport layer sits on the other end of the link.

mod connection;
mod handle;
mod router;

pub use connection::ConnectionError;
pub use handle::ConnectionHandle;
pub use router::MessageRouter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{PersistenceManager, PersistenceOp};
use crate::protocol::{Packet, Properties, Publish, QoS, MAX_VARIABLE_INT};
use crate::retained::RetainedStore;
use crate::session::{SessionState, SessionStore};
use crate::topic::{Subscription, SubscriptionStore};
use crate::will::WillScheduler;

use connection::Connection;

/// What to do with an outbound PUBLISH larger than the client's Maximum Packet Size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizedDelivery {
    /// Send DISCONNECT "packet too large" and close the connection
    #[default]
    Disconnect,
    /// Drop the message and keep the connection
    Discard,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Largest keep alive granted; longer requests are clamped and reported
    pub max_keep_alive: u16,
    /// Session expiry reaper period
    pub expiry_check_interval: Duration,
    /// Cap on the session expiry interval (0 = no cap)
    pub max_session_expiry: u32,
    /// Time allowed between link creation and CONNECT
    pub connect_timeout: Duration,
    /// Receive maximum (client to server flow control)
    pub receive_maximum: u16,
    /// Maximum inbound packet size
    pub max_packet_size: u32,
    /// Maximum topic alias accepted from clients
    pub max_topic_alias: u16,
    /// Maximum messages queued per session
    pub max_queued_messages: usize,
    /// Retransmission interval for unacknowledged messages (zero = on reconnect only)
    pub retry_interval: Duration,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscription_available: bool,
    /// Subscription identifiers available
    pub subscription_identifiers_available: bool,
    /// Shared subscriptions available
    pub shared_subscriptions_available: bool,
    /// Filters answered with "unspecified error" on SUBSCRIBE
    pub disallowed_filters: Vec<String>,
    pub oversized_delivery: OversizedDelivery,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_keep_alive: 60,
            expiry_check_interval: Duration::from_secs(1),
            max_session_expiry: 0,
            connect_timeout: Duration::from_secs(30),
            receive_maximum: 65535,
            max_packet_size: MAX_VARIABLE_INT,
            max_topic_alias: 65535,
            max_queued_messages: 1000,
            retry_interval: Duration::ZERO,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            disallowed_filters: Vec::new(),
            oversized_delivery: OversizedDelivery::Disconnect,
        }
    }
}

/// Broker events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// CONNACK sent
    ClientConnected {
        client_id: Arc<str>,
        session_present: bool,
    },
    /// Connection ended; `graceful` when the client sent DISCONNECT
    ClientDisconnected { client_id: Arc<str>, graceful: bool },
    /// Message routed to subscribers
    MessagePublished { topic: Arc<str>, qos: QoS },
    /// Will message injected into the publish pipeline
    WillPublished { client_id: Arc<str>, topic: Arc<str> },
    /// Session removed by the reaper
    SessionExpired { client_id: Arc<str> },
}

/// Shared state handed to every connection task
#[derive(Clone)]
pub(crate) struct Context {
    pub config: Arc<BrokerConfig>,
    pub sessions: Arc<SessionStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub retained: Arc<RetainedStore>,
    /// Live connections by client id
    pub connections: Arc<DashMap<Arc<str>, Arc<ConnectionHandle>>>,
    pub router: Arc<MessageRouter>,
    pub wills: Arc<WillScheduler>,
    pub events: broadcast::Sender<BrokerEvent>,
    pub shutdown: broadcast::Sender<()>,
    pub hooks: Arc<dyn Hooks>,
    pub persistence: Option<Arc<PersistenceManager>>,
    next_connection_id: Arc<AtomicU64>,
}

impl Context {
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn persist(&self, op: PersistenceOp) {
        if let Some(ref persistence) = self.persistence {
            persistence.write(op);
        }
    }
}

/// Channel ends of one client link, as seen by the client side
pub struct ClientLink {
    /// Packets from the client to the engine; dropping it is a network loss
    pub tx: mpsc::Sender<Packet>,
    /// Packets from the engine to the client
    pub rx: mpsc::Receiver<Packet>,
    /// The connection task
    pub task: JoinHandle<Result<(), ConnectionError>>,
}

/// The session engine
#[derive(Clone)]
pub struct Broker {
    ctx: Context,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        Self::build(config, hooks, None)
    }

    /// Create a new broker that writes retained messages and sessions through `persistence`
    pub fn with_persistence(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        persistence: Arc<PersistenceManager>,
    ) -> Self {
        Self::build(config, hooks, Some(persistence))
    }

    fn build(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);
        let config = Arc::new(config);
        let sessions = Arc::new(SessionStore::new());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let retained = Arc::new(RetainedStore::new());
        let connections = Arc::new(DashMap::new());

        let router = Arc::new(MessageRouter::new(
            config.clone(),
            sessions.clone(),
            subscriptions.clone(),
            retained.clone(),
            connections.clone(),
            events.clone(),
            persistence.clone(),
        ));
        let wills = Arc::new(WillScheduler::new(router.clone()));

        Self {
            ctx: Context {
                config,
                sessions,
                subscriptions,
                retained,
                connections,
                router,
                wills,
                events,
                shutdown,
                hooks,
                persistence,
                next_connection_id: Arc::new(AtomicU64::new(1)),
            },
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// Start a connection task on an existing link.
    ///
    /// The task reads client packets from `inbound` and writes server packets
    /// to `outbound`. It ends when the client disconnects, the link closes, or
    /// the engine shuts down.
    pub fn accept(
        &self,
        inbound: mpsc::Receiver<Packet>,
        outbound: mpsc::Sender<Packet>,
    ) -> JoinHandle<Result<(), ConnectionError>> {
        let ctx = self.ctx.clone();
        let shutdown_rx = ctx.shutdown.subscribe();
        let connection_id = ctx.next_connection_id();
        tokio::spawn(async move {
            let conn = Connection::new(ctx, connection_id, inbound, outbound, shutdown_rx);
            let result = conn.run().await;
            if let Err(ref e) = result {
                debug!(connection_id, "connection ended: {}", e);
            }
            result
        })
    }

    /// Create a link with channels of `capacity` and start its connection task
    pub fn link(&self, capacity: usize) -> ClientLink {
        let (client_tx, inbound) = mpsc::channel(capacity);
        let (outbound, client_rx) = mpsc::channel(capacity);
        let task = self.accept(inbound, outbound);
        ClientLink {
            tx: client_tx,
            rx: client_rx,
            task,
        }
    }

    /// Run the session expiry reaper until [`shutdown`](Self::shutdown).
    ///
    /// Pending persistence writes are flushed before it returns.
    pub async fn run(&self) {
        let mut shutdown_rx = self.ctx.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.ctx.config.expiry_check_interval);
        info!(
            "session engine running (expiry check every {:?})",
            self.ctx.config.expiry_check_interval
        );

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {
                    self.reap();
                }
            }
        }

        if let Some(ref persistence) = self.ctx.persistence {
            if let Err(e) = persistence.shutdown().await {
                warn!("persistence shutdown failed: {}", e);
            }
        }
        info!("session engine stopped");
    }

    /// One reaper pass: expired sessions, expired queued and retained messages
    pub fn reap(&self) {
        let ctx = &self.ctx;
        // Index and storage cleanup happen before a new incarnation can be created
        let expired = ctx.sessions.cleanup_expired(|client_id| {
            ctx.subscriptions.unsubscribe_all(client_id);
            ctx.persist(PersistenceOp::DeleteSession {
                client_id: client_id.to_string(),
            });
        });
        for client_id in expired {
            // A CONNECT that already replaced the session fired the will itself
            if ctx.sessions.get(&client_id).is_none() {
                ctx.wills.fire_now(&client_id);
            }
            debug!(client_id = %client_id, "session expired");
            let _ = ctx.events.send(BrokerEvent::SessionExpired { client_id });
        }

        let now = tokio::time::Instant::now();
        for session in ctx.sessions.all() {
            let mut s = session.write();
            if s.state == SessionState::Disconnected {
                let dropped = s.purge_expired_pending(now);
                if dropped > 0 {
                    debug!(client_id = %s.client_id, dropped, "expired queued messages");
                }
            }
        }

        for topic in ctx.retained.purge_expired() {
            ctx.persist(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            });
        }
    }

    /// Shutdown the engine: stops the reaper and closes every connection
    /// with DISCONNECT "server shutting down"
    pub fn shutdown(&self) {
        info!(
            connections = self.ctx.connections.len(),
            "shutting down session engine"
        );
        let _ = self.ctx.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.ctx.events.subscribe()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.ctx.connections.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.ctx.retained.len()
    }

    /// Number of wills waiting for their delay to elapse
    pub fn pending_will_count(&self) -> usize {
        self.ctx.wills.pending_count()
    }

    /// Publish a message from the server.
    ///
    /// Returns the number of sessions the message was queued to.
    pub fn publish(
        &self,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> usize {
        let publish = Publish {
            qos,
            retain,
            topic: topic.into(),
            payload: payload.into(),
            properties: Properties::default(),
            ..Publish::default()
        };
        self.ctx.router.publish(None, publish)
    }

    /// Load retained messages and sessions saved by the persistence layer.
    ///
    /// Restored sessions are disconnected; their expiry runs from now.
    pub async fn restore(&self) -> crate::persistence::Result<()> {
        let Some(ref persistence) = self.ctx.persistence else {
            return Ok(());
        };
        let loaded = persistence.load_all().await?;

        let retained_count = loaded.retained.len();
        for (_, stored) in loaded.retained {
            self.ctx.retained.restore(stored.into_retained());
        }

        let session_count = loaded.sessions.len();
        for (_, stored) in loaded.sessions {
            let session = match stored.into_session() {
                Ok(session) => session,
                Err(e) => {
                    warn!("skipping stored session: {}", e);
                    continue;
                }
            };
            // The index fills in the share group and actual filter
            for sub in session.subscriptions.values() {
                self.ctx.subscriptions.subscribe(
                    &sub.filter,
                    Subscription {
                        client_id: session.client_id.clone(),
                        filter: Arc::from(""),
                        qos: sub.options.qos,
                        no_local: sub.options.no_local,
                        retain_as_published: sub.options.retain_as_published,
                        subscription_id: sub.subscription_id,
                        share_group: None,
                    },
                );
            }
            self.ctx.sessions.insert(session);
        }

        info!(
            retained = retained_count,
            sessions = session_count,
            "restored persisted state"
        );
        Ok(())
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
