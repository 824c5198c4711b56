//! Connection Handler
//!
//! One task per client link. It negotiates CONNECT, dispatches packets to the
//! session, alias tables and in-flight windows, pumps the session queue when
//! the router signals new messages, and tears the session down on exit.

mod connect;
mod deliver;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{ConnectionHandle, Context};
use crate::protocol::{Disconnect, Packet, ProtocolError, ReasonCode};
use crate::session::{InboundAliases, OutboundAliases, Session};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Protocol(ProtocolError),
    /// CONNACK refused with this reason code
    Refused(ReasonCode),
    /// The link closed without DISCONNECT
    Closed,
    /// No CONNECT within the connect timeout
    ConnectTimeout,
    KeepAliveTimeout,
    SessionTakenOver,
    Shutdown,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Refused(rc) => write!(f, "Connection refused: {}", rc),
            ConnectionError::Closed => write!(f, "Connection closed"),
            ConnectionError::ConnectTimeout => write!(f, "Connect timeout"),
            ConnectionError::KeepAliveTimeout => write!(f, "Keep alive timeout"),
            ConnectionError::SessionTakenOver => write!(f, "Session taken over"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// How the connected phase ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// Client sent DISCONNECT; `publish_will` for reason 0x04
    Disconnect { publish_will: bool },
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT packet
    Connecting,
    /// Connected and running
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
        handle: Arc<ConnectionHandle>,
    },
}

pub(crate) struct Connection {
    pub(crate) ctx: Context,
    pub(crate) connection_id: u64,
    pub(crate) inbound: mpsc::Receiver<Packet>,
    pub(crate) outbound: mpsc::Sender<Packet>,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
    pub(crate) state: State,
    /// Negotiated keep alive in seconds (0 = disabled)
    pub(crate) keep_alive: u16,
    pub(crate) inbound_aliases: InboundAliases,
    pub(crate) outbound_aliases: OutboundAliases,
}

impl Connection {
    pub(crate) fn new(
        ctx: Context,
        connection_id: u64,
        inbound: mpsc::Receiver<Packet>,
        outbound: mpsc::Sender<Packet>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            ctx,
            connection_id,
            inbound,
            outbound,
            shutdown_rx,
            state: State::Connecting,
            keep_alive: 0,
            inbound_aliases: InboundAliases::default(),
            outbound_aliases: OutboundAliases::default(),
        }
    }

    /// Run the connection handler
    pub(crate) async fn run(mut self) -> Result<(), ConnectionError> {
        let first = match timeout(self.ctx.config.connect_timeout, self.inbound.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => return Err(ConnectionError::Closed),
            Err(_) => {
                debug!(connection_id = self.connection_id, "connect timeout");
                return Err(ConnectionError::ConnectTimeout);
            }
        };

        let connect = match first {
            Packet::Connect(connect) => connect,
            other => {
                debug!(
                    connection_id = self.connection_id,
                    "first packet is {}, closing",
                    other.name()
                );
                return Err(ProtocolError::FirstPacketNotConnect.into());
            }
        };

        let connected = self.handle_connect(*connect).await;

        let (client_id, session, handle) = match &self.state {
            State::Connected {
                client_id,
                session,
                handle,
            } => (client_id.clone(), session.clone(), handle.clone()),
            State::Connecting => return connected,
        };

        let result = match connected {
            Ok(()) => self.run_connected(&client_id, &session, &handle).await,
            Err(e) => Err(e),
        };

        // Server-side causes are reported to the client before closing
        if let Err(ref e) = result {
            if let Some(reason_code) = disconnect_reason(e) {
                if self
                    .send(Packet::Disconnect(Disconnect::new(reason_code)))
                    .await
                    .is_err()
                {
                    debug!(client_id = %client_id, "link gone before DISCONNECT {}", reason_code);
                }
            }
        }
        if let Err(ConnectionError::Protocol(ref e)) = result {
            warn!(client_id = %client_id, "protocol error: {}", e);
        }

        self.handle_disconnect(&client_id, &session, &result).await;

        result.map(|_| ())
    }

    /// Run the main connection loop
    async fn run_connected(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        handle: &Arc<ConnectionHandle>,
    ) -> Result<Exit, ConnectionError> {
        // 1.5x keep alive; 0 disables the check
        let keep_alive = (self.keep_alive > 0)
            .then(|| Duration::from_millis(u64::from(self.keep_alive) * 1500));
        debug!(
            client_id = %client_id,
            "keep alive {}s -> timeout {:?}",
            self.keep_alive,
            keep_alive
        );
        let mut keep_alive_deadline = keep_alive.map(|k| Instant::now() + k);

        let retry_interval = self.ctx.config.retry_interval;
        let mut retry_ticker = (!retry_interval.is_zero()).then(|| {
            tokio::time::interval_at(Instant::now() + retry_interval, retry_interval)
        });

        loop {
            let deadline = keep_alive_deadline;
            tokio::select! {
                biased;

                result = self.shutdown_rx.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            info!(client_id = %client_id, "closing connection for shutdown");
                            return Err(ConnectionError::Shutdown);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }

                reason = handle.closed() => {
                    debug!(client_id = %client_id, "connection closed by engine ({})", reason);
                    return Err(ConnectionError::SessionTakenOver);
                }

                _ = handle.notified() => {
                    self.pump_pending(client_id, session).await?;
                }

                packet = self.inbound.recv() => {
                    let Some(packet) = packet else {
                        debug!(client_id = %client_id, "link closed");
                        return Err(ConnectionError::Closed);
                    };
                    if let Some(k) = keep_alive {
                        keep_alive_deadline = Some(Instant::now() + k);
                    }
                    if let Some(exit) = self.handle_packet(client_id, session, packet).await? {
                        return Ok(exit);
                    }
                }

                _ = async {
                    match retry_ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.retry_unacked_messages(session).await?;
                }

                _ = async move {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!(client_id = %client_id, "keep alive timeout - disconnecting");
                    return Err(ConnectionError::KeepAliveTimeout);
                }
            }
        }
    }

    /// Handle an incoming packet; `Some` ends the connection
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<Option<Exit>, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::DuplicateConnect.into()),
            Packet::Publish(publish) => {
                self.handle_publish(client_id, session, publish).await?;
                Ok(None)
            }
            Packet::PubAck(puback) => {
                self.handle_puback(client_id, session, puback).await?;
                Ok(None)
            }
            Packet::PubRec(pubrec) => {
                self.handle_pubrec(client_id, session, pubrec).await?;
                Ok(None)
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(client_id, session, pubrel).await?;
                Ok(None)
            }
            Packet::PubComp(pubcomp) => {
                self.handle_pubcomp(client_id, session, pubcomp).await?;
                Ok(None)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await?;
                Ok(None)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe)
                    .await?;
                Ok(None)
            }
            Packet::PingReq => {
                self.send(Packet::PingResp).await?;
                Ok(None)
            }
            Packet::Disconnect(disconnect) => {
                self.handle_client_disconnect(client_id, session, disconnect)
                    .map(Some)
            }
            other => {
                warn!(client_id = %client_id, "unexpected {} from client", other.name());
                Err(ProtocolError::UnexpectedPacket(other.name()).into())
            }
        }
    }

    /// Hand a packet to the link
    pub(crate) async fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

/// Reason code of the server-initiated DISCONNECT for `error`, if one is sent
fn disconnect_reason(error: &ConnectionError) -> Option<ReasonCode> {
    match error {
        ConnectionError::Protocol(e) => Some(e.reason_code()),
        ConnectionError::KeepAliveTimeout => Some(ReasonCode::KeepAliveTimeout),
        ConnectionError::SessionTakenOver => Some(ReasonCode::SessionTakenOver),
        ConnectionError::Shutdown => Some(ReasonCode::ServerShuttingDown),
        ConnectionError::Refused(_) | ConnectionError::Closed | ConnectionError::ConnectTimeout => {
            None
        }
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
