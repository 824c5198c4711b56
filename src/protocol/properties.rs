//! MQTT v5.0 Properties
//!
//! A closed record of every property the engine reads or writes. Absent and
//! zero are different values, so every scalar is an `Option`.

use bytes::Bytes;

use super::variable_int_len;

/// Collection of MQTT v5.0 properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.payload_format_indicator.is_none()
            && self.message_expiry_interval.is_none()
            && self.content_type.is_none()
            && self.response_topic.is_none()
            && self.correlation_data.is_none()
            && self.subscription_identifiers.is_empty()
            && self.session_expiry_interval.is_none()
            && self.assigned_client_identifier.is_none()
            && self.server_keep_alive.is_none()
            && self.request_problem_information.is_none()
            && self.will_delay_interval.is_none()
            && self.request_response_information.is_none()
            && self.reason_string.is_none()
            && self.receive_maximum.is_none()
            && self.topic_alias_maximum.is_none()
            && self.topic_alias.is_none()
            && self.maximum_qos.is_none()
            && self.retain_available.is_none()
            && self.user_properties.is_empty()
            && self.maximum_packet_size.is_none()
            && self.wildcard_subscription_available.is_none()
            && self.subscription_identifier_available.is_none()
            && self.shared_subscription_available.is_none()
    }

    /// Encoded size of the properties, excluding the length prefix
    pub fn encoded_size(&self) -> usize {
        let mut size = 0;

        if self.payload_format_indicator.is_some() {
            size += 2; // 1 byte id + 1 byte value
        }
        if self.message_expiry_interval.is_some() {
            size += 5; // 1 byte id + 4 bytes value
        }
        if let Some(ref s) = self.content_type {
            size += 1 + 2 + s.len();
        }
        if let Some(ref s) = self.response_topic {
            size += 1 + 2 + s.len();
        }
        if let Some(ref d) = self.correlation_data {
            size += 1 + 2 + d.len();
        }
        for id in &self.subscription_identifiers {
            size += 1 + variable_int_len(*id);
        }
        if self.session_expiry_interval.is_some() {
            size += 5;
        }
        if let Some(ref s) = self.assigned_client_identifier {
            size += 1 + 2 + s.len();
        }
        if self.server_keep_alive.is_some() {
            size += 3;
        }
        if self.request_problem_information.is_some() {
            size += 2;
        }
        if self.will_delay_interval.is_some() {
            size += 5;
        }
        if self.request_response_information.is_some() {
            size += 2;
        }
        if let Some(ref s) = self.reason_string {
            size += 1 + 2 + s.len();
        }
        if self.receive_maximum.is_some() {
            size += 3;
        }
        if self.topic_alias_maximum.is_some() {
            size += 3;
        }
        if self.topic_alias.is_some() {
            size += 3;
        }
        if self.maximum_qos.is_some() {
            size += 2;
        }
        if self.retain_available.is_some() {
            size += 2;
        }
        for (k, v) in &self.user_properties {
            size += 1 + 2 + k.len() + 2 + v.len();
        }
        if self.maximum_packet_size.is_some() {
            size += 5;
        }
        if self.wildcard_subscription_available.is_some() {
            size += 2;
        }
        if self.subscription_identifier_available.is_some() {
            size += 2;
        }
        if self.shared_subscription_available.is_some() {
            size += 2;
        }

        size
    }

    /// Application properties that travel with a message from publisher to subscriber.
    ///
    /// Transport-scoped properties (topic alias, subscription identifiers) are
    /// dropped; the router attaches the receiver's own values.
    pub fn forwardable(&self) -> Properties {
        Properties {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type.clone(),
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone(),
            user_properties: self.user_properties.clone(),
            ..Properties::default()
        }
    }
}
