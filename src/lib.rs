//! VibeMQ Session - MQTT v5.0 session and QoS delivery engine
//!
//! Owns everything between a decoded packet and an encoded one: sessions and
//! their expiry, subscriptions and shared groups, retained messages, wills,
//! QoS 1/2 flow control and topic aliases. Transport and wire encoding live
//! outside; connections exchange typed packets with the engine over channels.

pub mod broker;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;
pub mod will;

pub use broker::{
    Broker, BrokerConfig, BrokerEvent, ClientLink, ConnectionError, OversizedDelivery,
};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{MemoryBackend, PersistenceManager, StorageBackend};
pub use protocol::{Packet, ProtocolError, QoS, ReasonCode};
