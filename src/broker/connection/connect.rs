//! CONNECT handling and session negotiation

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{Connection, ConnectionError, State};
use crate::broker::{BrokerEvent, ConnectionHandle};
use crate::protocol::{
    ConnAck, Connect, Packet, Properties, ProtocolError, QoS, ReasonCode, MAX_VARIABLE_INT,
    PROTOCOL_LEVEL_V5, PROTOCOL_NAME,
};
use crate::session::{InboundAliases, OutboundAliases, Session, SessionState, WillMessage};
use crate::topic::validate_topic_name;
use crate::will::WillPublisher;

impl Connection {
    pub(crate) async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        if connect.protocol_name != PROTOCOL_NAME || connect.protocol_version != PROTOCOL_LEVEL_V5 {
            let err = ProtocolError::UnsupportedProtocol {
                name: connect.protocol_name.clone(),
                version: connect.protocol_version,
            };
            debug!(connection_id = self.connection_id, "rejecting CONNECT: {}", err);
            self.send(Packet::ConnAck(ConnAck::refused(err.reason_code())))
                .await?;
            return Err(err.into());
        }

        if let Some(reason_code) = self.check_connect(&connect) {
            debug!(
                connection_id = self.connection_id,
                "rejecting CONNECT from {:?}: {}", connect.client_id, reason_code
            );
            self.send(Packet::ConnAck(ConnAck::refused(reason_code)))
                .await?;
            return Err(ConnectionError::Refused(reason_code));
        }

        let config = self.ctx.config.clone();
        let props = &connect.properties;

        // Empty client ids are accepted with either clean start value
        let assigned = connect.client_id.is_empty();
        let client_id: Arc<str> = if assigned {
            self.ctx
                .sessions
                .unused_client_id(|| format!("vibemq-{:x}", super::rand_id()))
        } else {
            connect.client_id.as_str().into()
        };

        debug!(
            client_id = %client_id,
            clean_start = connect.clean_start,
            "CONNECT"
        );

        let requested_expiry = props.session_expiry_interval.unwrap_or(0);
        let session_expiry = if config.max_session_expiry > 0 {
            requested_expiry.min(config.max_session_expiry)
        } else {
            requested_expiry
        };

        let keep_alive = if config.max_keep_alive > 0 && connect.keep_alive > config.max_keep_alive
        {
            config.max_keep_alive
        } else {
            connect.keep_alive
        };

        // Take over a live connection. The previous owner's will is decided
        // here so its teardown cannot race this CONNECT.
        if let Some((_, existing)) = self.ctx.connections.remove(&client_id) {
            info!(client_id = %client_id, "session taken over");
            existing.close(ReasonCode::SessionTakenOver);
        }
        let previous_will = self.ctx.sessions.get(&client_id).and_then(|previous| {
            let mut s = previous.write();
            if s.state != SessionState::Connected {
                return None;
            }
            s.connection_id = self.connection_id;
            s.will.take()
        });

        let (session, session_present) = self
            .ctx
            .sessions
            .get_or_create(&client_id, connect.clean_start);

        if session_present {
            // Resumed before any delayed will elapsed
            self.ctx.wills.cancel(&client_id);
            if let Some(will) = previous_will {
                if will.delay_interval == 0 {
                    self.ctx.router.publish_will(&client_id, will);
                }
            }
        } else {
            // The previous incarnation ends here
            self.ctx.wills.fire_now(&client_id);
            if let Some(will) = previous_will {
                self.ctx.router.publish_will(&client_id, will);
            }
            self.ctx.subscriptions.unsubscribe_all(&client_id);
        }

        {
            let mut s = session.write();
            s.mark_connected(self.connection_id);
            s.clean_start = connect.clean_start;
            s.session_expiry_interval = session_expiry;
            s.connect_expiry_was_zero = session_expiry == 0;
            s.keep_alive = keep_alive;
            s.outbound
                .set_receive_maximum(props.receive_maximum.unwrap_or(u16::MAX));
            s.inbound.set_receive_maximum(config.receive_maximum);
            s.max_pending = config.max_queued_messages;
            s.max_packet_size = props.maximum_packet_size.unwrap_or(MAX_VARIABLE_INT);
            s.will = connect.will.as_ref().map(WillMessage::from_will);
        }

        self.keep_alive = keep_alive;
        self.inbound_aliases = InboundAliases::new(config.max_topic_alias);
        self.outbound_aliases = OutboundAliases::new(props.topic_alias_maximum.unwrap_or(0));

        let mut connack = ConnAck {
            session_present,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        connack.properties.receive_maximum = Some(config.receive_maximum);
        // Maximum QoS is only sent when it is below 2
        if config.max_qos != QoS::ExactlyOnce {
            connack.properties.maximum_qos = Some(config.max_qos as u8);
        }
        connack.properties.retain_available = Some(u8::from(config.retain_available));
        connack.properties.maximum_packet_size = Some(config.max_packet_size);
        connack.properties.topic_alias_maximum = Some(config.max_topic_alias);
        connack.properties.wildcard_subscription_available =
            Some(u8::from(config.wildcard_subscription_available));
        connack.properties.subscription_identifier_available =
            Some(u8::from(config.subscription_identifiers_available));
        connack.properties.shared_subscription_available =
            Some(u8::from(config.shared_subscriptions_available));
        if keep_alive != connect.keep_alive {
            connack.properties.server_keep_alive = Some(keep_alive);
        }
        if session_expiry != requested_expiry {
            connack.properties.session_expiry_interval = Some(session_expiry);
        }
        if assigned {
            connack.properties.assigned_client_identifier = Some(client_id.to_string());
        }

        // From here on the session is owned by this connection and torn down with it
        let handle = Arc::new(ConnectionHandle::new(self.connection_id));
        self.ctx
            .connections
            .insert(client_id.clone(), handle.clone());

        self.state = State::Connected {
            client_id: client_id.clone(),
            session: session.clone(),
            handle,
        };

        self.send(Packet::ConnAck(connack)).await?;
        debug!(client_id = %client_id, session_present, "CONNACK sent");

        self.ctx
            .hooks
            .on_client_connected(&client_id, session_present)
            .await;
        let _ = self.ctx.events.send(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
            session_present,
        });

        // In-flight exchanges resume first, in original order
        if session_present {
            self.resend_inflight_messages(&client_id, &session).await?;
        }
        self.pump_pending(&client_id, &session).await
    }

    /// CONNACK refusal reason for an otherwise well-formed CONNECT
    fn check_connect(&self, connect: &Connect) -> Option<ReasonCode> {
        let config = &self.ctx.config;
        let props = &connect.properties;

        if props.receive_maximum == Some(0) || props.maximum_packet_size == Some(0) {
            return Some(ReasonCode::ProtocolError);
        }

        if let Some(ref will) = connect.will {
            if validate_topic_name(&will.topic).is_err() {
                return Some(ReasonCode::TopicNameInvalid);
            }
            if will.qos > config.max_qos {
                return Some(ReasonCode::QoSNotSupported);
            }
            if will.retain && !config.retain_available {
                return Some(ReasonCode::RetainNotSupported);
            }
        }
        None
    }

    /// Resume the in-flight exchanges of a resumed session that fit its window
    async fn resend_inflight_messages(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let packets = session.write().outbound.resend_all();
        if !packets.is_empty() {
            debug!(
                client_id = %client_id,
                count = packets.len(),
                "resending in-flight messages"
            );
        }
        self.send_resumed(client_id, session, packets).await
    }
}
