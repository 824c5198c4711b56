//! Protocol error types

use std::fmt;

use super::ReasonCode;

/// Protocol violations detected by the session engine.
///
/// Each one ends the connection; [`ProtocolError::reason_code`] gives the code
/// sent in the DISCONNECT (or CONNACK, for CONNECT-time failures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CONNECT carried a protocol name or level other than "MQTT"/5
    UnsupportedProtocol { name: String, version: u8 },
    /// A second CONNECT arrived on an established connection
    DuplicateConnect,
    /// The first packet on a connection was not CONNECT
    FirstPacketNotConnect,
    /// A packet the server never accepts from a client
    UnexpectedPacket(&'static str),
    /// QoS > 0 PUBLISH without a packet identifier
    MissingPacketId,
    /// Inbound packet exceeds the server maximum packet size
    PacketTooLarge { size: usize, limit: u32 },
    /// Outbound packet exceeds the client maximum packet size
    OutboundTooLarge { size: usize, limit: u32 },
    /// Client sent more unacknowledged QoS 2 publishes than the server receive maximum
    ReceiveMaximumExceeded(u16),
    /// Topic alias is 0, above the advertised maximum, or unknown
    TopicAliasInvalid(u16),
    /// DISCONNECT tried to raise a session expiry that was zero at CONNECT
    InvalidSessionExpiry,
    /// Any other protocol violation
    Violation(&'static str),
}

impl ProtocolError {
    /// Reason code reported to the peer for this error
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::UnsupportedProtocol { .. } => ReasonCode::UnsupportedProtocolVersion,
            Self::DuplicateConnect
            | Self::FirstPacketNotConnect
            | Self::UnexpectedPacket(_)
            | Self::InvalidSessionExpiry
            | Self::Violation(_) => ReasonCode::ProtocolError,
            Self::MissingPacketId => ReasonCode::MalformedPacket,
            Self::PacketTooLarge { .. } | Self::OutboundTooLarge { .. } => {
                ReasonCode::PacketTooLarge
            }
            Self::ReceiveMaximumExceeded(_) => ReasonCode::ReceiveMaxExceeded,
            Self::TopicAliasInvalid(_) => ReasonCode::TopicAliasInvalid,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedProtocol { name, version } => {
                write!(f, "unsupported protocol: {:?} level {}", name, version)
            }
            Self::DuplicateConnect => write!(f, "second CONNECT on established connection"),
            Self::FirstPacketNotConnect => write!(f, "first packet was not CONNECT"),
            Self::UnexpectedPacket(name) => write!(f, "unexpected {} from client", name),
            Self::MissingPacketId => write!(f, "QoS > 0 PUBLISH without packet identifier"),
            Self::PacketTooLarge { size, limit } => {
                write!(f, "packet of {} bytes exceeds server maximum {}", size, limit)
            }
            Self::OutboundTooLarge { size, limit } => {
                write!(f, "packet of {} bytes exceeds client maximum {}", size, limit)
            }
            Self::ReceiveMaximumExceeded(max) => {
                write!(f, "receive maximum {} exceeded", max)
            }
            Self::TopicAliasInvalid(alias) => write!(f, "invalid topic alias: {}", alias),
            Self::InvalidSessionExpiry => {
                write!(f, "session expiry cannot be set on DISCONNECT when it was zero")
            }
            Self::Violation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
