//! Inbound PUBLISH handling

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS, ReasonCode};
use crate::session::Session;
use crate::topic::validate_topic_name;

impl Connection {
    /// Handle PUBLISH packet
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        let config = self.ctx.config.clone();

        let size = publish.encoded_len();
        if size > config.max_packet_size as usize {
            return Err(ProtocolError::PacketTooLarge {
                size,
                limit: config.max_packet_size,
            }
            .into());
        }
        if publish.qos.is_acknowledged() && publish.packet_id.is_none() {
            return Err(ProtocolError::MissingPacketId.into());
        }
        if publish.qos > config.max_qos {
            return Err(ProtocolError::Violation("PUBLISH QoS above maximum QoS").into());
        }
        if publish.retain && !config.retain_available {
            return Err(ProtocolError::Violation("retained PUBLISH while retain unavailable").into());
        }

        // Aliases are resolved before anything looks at the topic
        if let Err(e) = self.inbound_aliases.resolve(&mut publish) {
            warn!(client_id = %client_id, "topic alias violation: {}", e);
            return Err(e.into());
        }

        if let Err(e) = validate_topic_name(&publish.topic) {
            warn!(client_id = %client_id, topic = %publish.topic, "invalid topic name: {}", e);
            return self.reject_publish(&publish, ReasonCode::TopicNameInvalid).await;
        }

        trace!(
            client_id = %client_id,
            topic = %publish.topic,
            qos = ?publish.qos,
            "PUBLISH"
        );

        // A re-sent QoS 2 PUBLISH still awaiting PUBREL is acknowledged again, not routed
        if let (QoS::ExactlyOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
            if session.read().inbound.contains(packet_id) {
                debug!(client_id = %client_id, packet_id, "duplicate QoS 2 PUBLISH");
                return self.send(Packet::PubRec(PubRec::new(packet_id))).await;
            }
        }

        match self
            .ctx
            .hooks
            .on_publish_check(client_id, &publish.topic, publish.qos, publish.retain)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(client_id = %client_id, topic = %publish.topic, "PUBLISH denied");
                return self.reject_publish(&publish, ReasonCode::NotAuthorized).await;
            }
            Err(e) => {
                error!(client_id = %client_id, "publish check failed: {}", e);
                return self
                    .reject_publish(&publish, ReasonCode::UnspecifiedError)
                    .await;
            }
        }

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                let delivered = self.route(client_id, publish).await;
                let puback = if delivered == 0 {
                    PubAck::with_reason(packet_id, ReasonCode::NoMatchingSubscribers)
                } else {
                    PubAck::new(packet_id)
                };
                self.send(Packet::PubAck(puback)).await
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                // Routed once PUBREL arrives
                session.write().inbound.store(packet_id, publish)?;
                self.send(Packet::PubRec(PubRec::new(packet_id))).await
            }
            _ => {
                self.route(client_id, publish).await;
                Ok(())
            }
        }
    }

    /// Acknowledge a rejected PUBLISH with an error reason code (QoS 0 is dropped silently)
    async fn reject_publish(
        &self,
        publish: &Publish,
        reason_code: ReasonCode,
    ) -> Result<(), ConnectionError> {
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.send(Packet::PubAck(PubAck::with_reason(packet_id, reason_code)))
                    .await
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.send(Packet::PubRec(PubRec::with_reason(packet_id, reason_code)))
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Hand an accepted client PUBLISH to the router
    pub(crate) async fn route(&self, client_id: &Arc<str>, publish: Publish) -> usize {
        let topic = publish.topic.clone();
        let payload = publish.payload.clone();
        let qos = publish.qos;

        let delivered = self.ctx.router.publish(Some(client_id), publish);
        self.ctx
            .hooks
            .on_message_published(&topic, &payload, qos)
            .await;
        delivered
    }
}
