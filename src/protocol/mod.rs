//! MQTT protocol types consumed and produced by the session engine
//!
//! The engine never touches bytes on the wire. The codec collaborator turns
//! frames into the typed packets defined here and back again.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::ProtocolError;
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// Protocol name carried in every v5.0 CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level of MQTT v5.0
pub const PROTOCOL_LEVEL_V5: u8 = 5;

/// Largest value a variable byte integer can hold (also the default maximum packet size)
pub const MAX_VARIABLE_INT: u32 = 268_435_455;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Downgrade to the lower of two levels (publish QoS vs. granted QoS)
    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }

    /// Whether this level takes part in acknowledged delivery
    pub fn is_acknowledged(self) -> bool {
        self != QoS::AtMostOnce
    }
}

/// Retain handling subscription option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages on every subscribe
    #[default]
    SendAtSubscribe = 0,
    /// Send retained messages only if the subscription is new
    SendAtSubscribeIfNew = 1,
    /// Never send retained messages on subscribe
    DoNotSend = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RetainHandling::SendAtSubscribe),
            1 => Some(RetainHandling::SendAtSubscribeIfNew),
            2 => Some(RetainHandling::DoNotSend),
            _ => None,
        }
    }
}

/// Per-filter options of a SUBSCRIBE request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    /// Options with the given maximum QoS and everything else defaulted
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }
}

/// Number of bytes needed to encode `value` as a variable byte integer
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
