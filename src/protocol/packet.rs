//! Typed MQTT v5.0 packets
//!
//! These are the values exchanged with the codec collaborator. Every packet
//! carries a closed `Properties` record so that an absent property and a zero
//! value stay distinguishable.

use std::sync::Arc;

use bytes::Bytes;

use super::{
    variable_int_len, Properties, QoS, ReasonCode, SubscriptionOptions, PROTOCOL_LEVEL_V5,
    PROTOCOL_NAME,
};

/// MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

impl Packet {
    /// Packet type name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name, "MQTT" for every supported version
    pub protocol_name: String,
    /// Protocol level (5 for MQTT v5.0)
    pub protocol_version: u8,
    /// Client identifier, may be empty
    pub client_id: String,
    /// Clean start flag
    pub clean_start: bool,
    /// Requested keep alive in seconds (0 = disabled)
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    pub properties: Properties,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_LEVEL_V5,
            client_id: String::new(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
        }
    }
}

/// Will message attached to a CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Will properties, including the will delay interval
    pub properties: Properties,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl ConnAck {
    /// A refusal carries no session and no properties
    pub fn refused(reason_code: ReasonCode) -> Self {
        Self {
            session_present: false,
            reason_code,
            properties: Properties::default(),
        }
    }
}

/// PUBLISH packet (bidirectional)
///
/// The topic is an `Arc<str>` so that fan-out to many sessions clones a pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// Topic name; empty when the topic is carried by a topic alias
    pub topic: Arc<str>,
    /// Present only for QoS > 0
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Properties,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
            properties: Properties::default(),
        }
    }
}

impl Publish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            qos,
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Size of this packet once encoded by a v5.0 codec, fixed header included
    pub fn encoded_len(&self) -> usize {
        let props_len = self.properties.encoded_size();
        let mut remaining = 2 + self.topic.len();
        if self.qos.is_acknowledged() {
            remaining += 2;
        }
        remaining += variable_int_len(props_len as u32) + props_len;
        remaining += self.payload.len();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

macro_rules! ack_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
            pub reason_code: ReasonCode,
            pub properties: Properties,
        }

        impl $name {
            pub fn new(packet_id: u16) -> Self {
                Self::with_reason(packet_id, ReasonCode::Success)
            }

            pub fn with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
                Self {
                    packet_id,
                    reason_code,
                    properties: Properties::default(),
                }
            }
        }
    };
}

ack_packet!(
    /// PUBACK packet (QoS 1 acknowledgement)
    PubAck
);
ack_packet!(
    /// PUBREC packet (QoS 2, step 1)
    PubRec
);
ack_packet!(
    /// PUBREL packet (QoS 2, step 2)
    PubRel
);
ack_packet!(
    /// PUBCOMP packet (QoS 2, step 3)
    PubComp
);

/// One topic filter of a SUBSCRIBE request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub options: SubscriptionOptions,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
    /// May carry one subscription identifier
    pub properties: Properties,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One reason code per requested filter, in request order
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

/// DISCONNECT packet (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Disconnect {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::default(),
        }
    }
}
