//! Serializable data models for persistence.
//!
//! These are storage-friendly versions of runtime types. Timers are stored as
//! time left rather than instants: a restored session's expiry and a restored
//! message's expiry both run from the moment of loading.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::error::{PersistenceError, Result};
use crate::protocol::{Properties, Publish, QoS, RetainHandling, SubscriptionOptions};
use crate::retained::RetainedMessage;
use crate::session::{
    InflightMessage, InflightState, PendingMessage, Session, SessionSubscription, WillMessage,
};

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Message expiry is the time left when the snapshot was taken
    pub properties: StoredProperties,
}

/// Stored session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub client_id: String,
    pub session_expiry_interval: u32,
    pub connect_expiry_was_zero: bool,
    pub keep_alive: u16,
    pub subscriptions: Vec<StoredSubscription>,
    pub pending_messages: Vec<StoredPublish>,
    pub inflight_outgoing: Vec<StoredInflightMessage>,
    pub inflight_incoming: Vec<StoredInflightMessage>,
    pub will: Option<StoredWillMessage>,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
}

/// Stored in-flight exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInflightMessage {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// 0 = sent, 1 = awaiting ack, 2 = awaiting PUBREL, 3 = awaiting PUBCOMP
    pub state: u8,
}

/// Stored publish message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: StoredProperties,
}

/// Stored will message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub delay_interval: u32,
    pub properties: StoredProperties,
}

/// Stored MQTT v5 properties (the forwardable subset)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
    pub subscription_identifiers: Vec<u32>,
}

// ============================================================================
// Conversion implementations
// ============================================================================

fn decode_qos(v: u8) -> Result<QoS> {
    QoS::from_u8(v).ok_or(PersistenceError::Corruption {
        field: "QoS",
        value: v,
    })
}

fn decode_state(v: u8) -> Result<InflightState> {
    match v {
        0 => Ok(InflightState::Sent),
        1 => Ok(InflightState::AwaitAck),
        2 => Ok(InflightState::AwaitRel),
        3 => Ok(InflightState::AwaitComp),
        other => Err(PersistenceError::Corruption {
            field: "in-flight state",
            value: other,
        }),
    }
}

fn encode_state(state: InflightState) -> u8 {
    match state {
        InflightState::Sent => 0,
        InflightState::AwaitAck => 1,
        InflightState::AwaitRel => 2,
        InflightState::AwaitComp => 3,
    }
}

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: props.user_properties.clone(),
            subscription_identifiers: props.subscription_identifiers.clone(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(stored: StoredProperties) -> Self {
        Properties {
            payload_format_indicator: stored.payload_format_indicator,
            message_expiry_interval: stored.message_expiry_interval,
            content_type: stored.content_type,
            response_topic: stored.response_topic,
            correlation_data: stored.correlation_data.map(bytes::Bytes::from),
            user_properties: stored.user_properties,
            subscription_identifiers: stored.subscription_identifiers,
            ..Default::default()
        }
    }
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            properties: StoredProperties::from(&publish.properties),
        }
    }
}

impl StoredPublish {
    pub fn into_publish(self) -> Result<Publish> {
        Ok(Publish {
            topic: Arc::from(self.topic),
            payload: bytes::Bytes::from(self.payload),
            qos: decode_qos(self.qos)?,
            retain: self.retain,
            dup: self.dup,
            packet_id: self.packet_id,
            properties: Properties::from(self.properties),
        })
    }
}

impl From<&WillMessage> for StoredWillMessage {
    fn from(will: &WillMessage) -> Self {
        Self {
            topic: will.topic.to_string(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
            delay_interval: will.delay_interval,
            properties: StoredProperties::from(&will.properties),
        }
    }
}

impl StoredWillMessage {
    pub fn into_will(self) -> Result<WillMessage> {
        Ok(WillMessage {
            topic: Arc::from(self.topic),
            payload: bytes::Bytes::from(self.payload),
            qos: decode_qos(self.qos)?,
            retain: self.retain,
            properties: Properties::from(self.properties),
            delay_interval: self.delay_interval,
        })
    }
}

impl From<&SessionSubscription> for StoredSubscription {
    fn from(sub: &SessionSubscription) -> Self {
        Self {
            filter: sub.filter.clone(),
            qos: sub.options.qos as u8,
            no_local: sub.options.no_local,
            retain_as_published: sub.options.retain_as_published,
            retain_handling: sub.options.retain_handling as u8,
            subscription_id: sub.subscription_id,
        }
    }
}

impl StoredSubscription {
    pub fn into_subscription(self) -> Result<SessionSubscription> {
        let retain_handling = RetainHandling::from_u8(self.retain_handling).ok_or(
            PersistenceError::Corruption {
                field: "retain handling",
                value: self.retain_handling,
            },
        )?;
        Ok(SessionSubscription {
            filter: self.filter,
            options: SubscriptionOptions {
                qos: decode_qos(self.qos)?,
                no_local: self.no_local,
                retain_as_published: self.retain_as_published,
                retain_handling,
            },
            subscription_id: self.subscription_id,
        })
    }
}

impl From<&InflightMessage> for StoredInflightMessage {
    fn from(im: &InflightMessage) -> Self {
        Self {
            packet_id: im.packet_id,
            publish: StoredPublish::from(&im.publish),
            state: encode_state(im.state),
        }
    }
}

impl StoredInflightMessage {
    pub fn into_inflight(self) -> Result<InflightMessage> {
        Ok(InflightMessage {
            packet_id: self.packet_id,
            publish: self.publish.into_publish()?,
            state: decode_state(self.state)?,
            sent_at: Instant::now(),
            held: false,
        })
    }
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        let now = Instant::now();
        Self {
            client_id: session.client_id.to_string(),
            session_expiry_interval: session.session_expiry_interval,
            connect_expiry_was_zero: session.connect_expiry_was_zero,
            keep_alive: session.keep_alive,
            subscriptions: session
                .subscriptions
                .values()
                .map(StoredSubscription::from)
                .collect(),
            pending_messages: session
                .pending
                .iter()
                .filter(|m| !m.is_expired(now))
                .map(|m| StoredPublish::from(&m.clone().into_publish(now)))
                .collect(),
            inflight_outgoing: session
                .outbound
                .iter()
                .map(StoredInflightMessage::from)
                .collect(),
            inflight_incoming: session
                .inbound
                .iter()
                .map(|(packet_id, publish)| StoredInflightMessage {
                    packet_id,
                    publish: StoredPublish::from(publish),
                    state: encode_state(InflightState::AwaitRel),
                })
                .collect(),
            will: session.will.as_ref().map(StoredWillMessage::from),
        }
    }
}

impl StoredSession {
    /// Rebuild a disconnected session; its expiry runs from now
    pub fn into_session(self) -> Result<Session> {
        let mut session = Session::new(Arc::from(self.client_id));
        session.clean_start = false;
        session.session_expiry_interval = self.session_expiry_interval;
        session.connect_expiry_was_zero = self.connect_expiry_was_zero;
        session.keep_alive = self.keep_alive;

        for stored in self.subscriptions {
            let sub = stored.into_subscription()?;
            session.subscriptions.insert(sub.filter.clone(), sub);
        }
        for stored in self.pending_messages {
            session
                .pending
                .push_back(PendingMessage::new(stored.into_publish()?));
        }
        for stored in self.inflight_outgoing {
            session.outbound.restore(stored.into_inflight()?);
        }
        for stored in self.inflight_incoming {
            let packet_id = stored.packet_id;
            session
                .inbound
                .restore(packet_id, stored.publish.into_publish()?);
        }
        session.will = self.will.map(StoredWillMessage::into_will).transpose()?;
        session.mark_disconnected();
        Ok(session)
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(rm: &RetainedMessage) -> Self {
        let mut properties = StoredProperties::from(&rm.properties);
        properties.message_expiry_interval = rm.remaining_expiry(Instant::now());
        Self {
            topic: rm.topic.to_string(),
            payload: rm.payload.to_vec(),
            qos: rm.qos as u8,
            properties,
        }
    }
}

impl StoredRetainedMessage {
    pub fn into_retained(self) -> RetainedMessage {
        RetainedMessage {
            topic: Arc::from(self.topic),
            payload: bytes::Bytes::from(self.payload),
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            properties: Properties::from(self.properties),
            stored_at: Instant::now(),
        }
    }
}

/// Data loaded from persistence at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}
