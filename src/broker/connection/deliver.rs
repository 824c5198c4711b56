//! Outbound delivery: session queue -> in-flight window -> link

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::broker::OversizedDelivery;
use crate::protocol::{Packet, ProtocolError, Publish};
use crate::session::Session;

/// Output of one pass over the session queue
#[derive(Default)]
struct Sendable {
    /// Held exchanges released by window room, sent ahead of new messages
    resumed: Vec<Packet>,
    /// New publishes in wire form, aliases applied
    batch: Vec<Publish>,
    /// Oversized message that ends the connection once the batch is out
    violation: Option<ProtocolError>,
}

impl Connection {
    /// Send every queued message the in-flight window allows.
    ///
    /// QoS 0 messages never wait. QoS 1/2 messages wait in the queue, in
    /// order, while the client's receive maximum is reached.
    pub(crate) async fn pump_pending(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let Sendable {
            resumed,
            batch,
            violation,
        } = self.take_sendable(client_id, session);

        self.send_resumed(client_id, session, resumed).await?;

        for publish in batch {
            let packet_id = publish.packet_id;
            self.send(Packet::Publish(publish)).await?;
            if let Some(packet_id) = packet_id {
                session.write().outbound.mark_sent(packet_id);
            }
        }

        match violation {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Send packets resuming in-flight exchanges.
    ///
    /// A stored PUBLISH larger than this connection's maximum packet size
    /// gets the same treatment as a new one: its exchange is abandoned or the
    /// connection ends.
    pub(crate) async fn send_resumed(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packets: Vec<Packet>,
    ) -> Result<(), ConnectionError> {
        for packet in packets {
            if let Packet::Publish(publish) = &packet {
                let size = publish.encoded_len();
                let limit = session.read().max_packet_size;
                if size > limit as usize {
                    match self.ctx.config.oversized_delivery {
                        OversizedDelivery::Discard => {
                            warn!(
                                client_id = %client_id,
                                size,
                                limit,
                                "abandoning in-flight message larger than client maximum packet size"
                            );
                            if let Some(packet_id) = publish.packet_id {
                                session.write().outbound.abandon(packet_id);
                            }
                            continue;
                        }
                        OversizedDelivery::Disconnect => {
                            return Err(ProtocolError::OutboundTooLarge { size, limit }.into());
                        }
                    }
                }
            }
            self.send(packet).await?;
        }
        Ok(())
    }

    /// Move sendable messages out of the session queue.
    ///
    /// QoS 1/2 messages get a packet id and enter the window here. The size
    /// limit applies to the wire form, after the topic alias is chosen.
    fn take_sendable(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Sendable {
        let now = Instant::now();
        let mut s = session.write();
        if s.connection_id != self.connection_id {
            // Taken over; the new connection delivers from here on
            return Sendable::default();
        }
        let limit = s.max_packet_size;
        let mut out = Sendable {
            resumed: s.outbound.release_held(),
            ..Sendable::default()
        };
        let mut held = VecDeque::new();

        while let Some(message) = s.pending.pop_front() {
            if message.is_expired(now) {
                trace!(client_id = %client_id, topic = %message.publish.topic, "dropping expired message");
                continue;
            }

            let qos = message.publish.qos;
            if qos.is_acknowledged() && !s.outbound.has_capacity() {
                held.push_back(message);
                continue;
            }

            let publish = message.into_publish(now);
            // The window keeps the full topic; only the wire copy is aliased
            let mut wire = publish.clone();
            self.outbound_aliases.apply(&mut wire, limit);
            let size = wire.encoded_len();
            if size > limit as usize {
                match self.ctx.config.oversized_delivery {
                    OversizedDelivery::Discard => {
                        warn!(
                            client_id = %client_id,
                            size,
                            limit,
                            "discarding message larger than client maximum packet size"
                        );
                        continue;
                    }
                    OversizedDelivery::Disconnect => {
                        out.violation = Some(ProtocolError::OutboundTooLarge { size, limit });
                        break;
                    }
                }
            }

            if qos.is_acknowledged() {
                wire.packet_id = Some(s.outbound.insert(publish));
            }
            out.batch.push(wire);
        }

        if !held.is_empty() {
            debug!(
                client_id = %client_id,
                held = held.len(),
                inflight = s.outbound.len(),
                "receive maximum reached, deferring messages"
            );
        }
        // Deferred messages go back in front of anything not yet examined
        while let Some(message) = held.pop_back() {
            s.pending.push_front(message);
        }

        out
    }

    /// Re-send exchanges unacknowledged for longer than the retry interval
    pub(crate) async fn retry_unacked_messages(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let packets = session
            .write()
            .outbound
            .resend_due(self.ctx.config.retry_interval);
        for packet in packets {
            self.send(packet).await?;
        }
        Ok(())
    }
}
