//! In-flight tracking for QoS 1/2 exchanges
//!
//! Server to client: [`OutboundWindow`] holds every PUBLISH that has a packet
//! identifier, in send order, bounded by the client's Receive Maximum.
//! Client to server: [`InboundWindow`] holds QoS 2 publishes waiting for PUBREL,
//! bounded by the server's Receive Maximum.

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;
use tokio::time::Instant;

use crate::protocol::{Packet, ProtocolError, PubRel, Publish, QoS};

/// State of one in-flight exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightState {
    /// Packet id assigned, not yet handed to the link
    Sent,
    /// PUBLISH sent, waiting for PUBACK (QoS 1) or PUBREC (QoS 2)
    AwaitAck,
    /// Inbound QoS 2 PUBLISH acknowledged with PUBREC, waiting for PUBREL
    AwaitRel,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitComp,
}

#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    /// The PUBLISH as first sent, with its full topic name
    pub publish: Publish,
    pub state: InflightState,
    pub sent_at: Instant,
    /// Waiting for window room before it is resumed on the current connection
    pub held: bool,
}

impl InflightMessage {
    /// Packet that resumes this exchange after a reconnect or retry timeout
    pub fn resend_packet(&self) -> Packet {
        match self.state {
            InflightState::AwaitComp | InflightState::AwaitRel => {
                Packet::PubRel(PubRel::new(self.packet_id))
            }
            InflightState::Sent => Packet::Publish(self.publish.clone()),
            InflightState::AwaitAck => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
        }
    }

    fn resume(&mut self, now: Instant) -> Packet {
        let packet = self.resend_packet();
        if self.state == InflightState::Sent {
            self.state = InflightState::AwaitAck;
        }
        self.sent_at = now;
        self.held = false;
        packet
    }
}

/// Server to client window
#[derive(Debug)]
pub struct OutboundWindow {
    receive_maximum: u16,
    entries: VecDeque<InflightMessage>,
    next_packet_id: u16,
}

impl OutboundWindow {
    pub fn new(receive_maximum: u16) -> Self {
        Self {
            receive_maximum: receive_maximum.max(1),
            entries: VecDeque::new(),
            next_packet_id: 1,
        }
    }

    pub fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    /// Apply the Receive Maximum of a new connection
    pub fn set_receive_maximum(&mut self, receive_maximum: u16) {
        self.receive_maximum = receive_maximum.max(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether another QoS > 0 PUBLISH may be sent now
    pub fn has_capacity(&self) -> bool {
        self.entries.len() < usize::from(self.receive_maximum)
    }

    fn contains(&self, packet_id: u16) -> bool {
        self.entries.iter().any(|m| m.packet_id == packet_id)
    }

    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
            if !self.contains(id) {
                return id;
            }
        }
    }

    /// Assign a packet id to `publish` and track it in state `Sent`.
    ///
    /// The caller checks [`has_capacity`](Self::has_capacity) first.
    pub fn insert(&mut self, mut publish: Publish) -> u16 {
        let packet_id = self.allocate_packet_id();
        publish.packet_id = Some(packet_id);
        self.entries.push_back(InflightMessage {
            packet_id,
            publish,
            state: InflightState::Sent,
            sent_at: Instant::now(),
            held: false,
        });
        packet_id
    }

    fn get(&self, packet_id: u16) -> Option<&InflightMessage> {
        self.entries.iter().find(|m| m.packet_id == packet_id)
    }

    fn get_mut(&mut self, packet_id: u16) -> Option<&mut InflightMessage> {
        self.entries.iter_mut().find(|m| m.packet_id == packet_id)
    }

    fn remove(&mut self, packet_id: u16) -> Option<InflightMessage> {
        let idx = self.entries.iter().position(|m| m.packet_id == packet_id)?;
        self.entries.remove(idx)
    }

    /// The PUBLISH was handed to the link
    pub fn mark_sent(&mut self, packet_id: u16) {
        if let Some(m) = self.get_mut(packet_id) {
            if m.state == InflightState::Sent {
                m.state = InflightState::AwaitAck;
            }
            m.sent_at = Instant::now();
        }
    }

    /// PUBACK for a QoS 1 message; releases the slot
    pub fn puback(&mut self, packet_id: u16) -> Option<InflightMessage> {
        let is_qos1 = self
            .get(packet_id)
            .is_some_and(|m| m.publish.qos == QoS::AtLeastOnce);
        if !is_qos1 {
            return None;
        }
        self.remove(packet_id)
    }

    /// PUBREC for a QoS 2 message.
    ///
    /// Returns true when a PUBREL should be sent. An error reason code ends the
    /// exchange and releases the slot.
    pub fn pubrec(&mut self, packet_id: u16, accepted: bool) -> bool {
        let is_qos2 = self
            .get(packet_id)
            .is_some_and(|m| m.publish.qos == QoS::ExactlyOnce);
        if !is_qos2 {
            return false;
        }
        if !accepted {
            self.remove(packet_id);
            return false;
        }
        if let Some(m) = self.get_mut(packet_id) {
            m.state = InflightState::AwaitComp;
            m.sent_at = Instant::now();
        }
        true
    }

    /// PUBCOMP ends a QoS 2 exchange and releases the slot
    pub fn pubcomp(&mut self, packet_id: u16) -> Option<InflightMessage> {
        let awaiting = self
            .get(packet_id)
            .is_some_and(|m| m.state == InflightState::AwaitComp);
        if !awaiting {
            return None;
        }
        self.remove(packet_id)
    }

    /// Packets resuming exchanges after a reconnect, in original send order.
    ///
    /// Only the first Receive Maximum exchanges are resumed. The rest are held
    /// and go out through [`release_held`](Self::release_held) as earlier
    /// exchanges complete.
    pub fn resend_all(&mut self) -> Vec<Packet> {
        let limit = usize::from(self.receive_maximum);
        let now = Instant::now();
        let mut packets = Vec::new();
        for (i, m) in self.entries.iter_mut().enumerate() {
            if i < limit {
                packets.push(m.resume(now));
            } else {
                m.held = true;
            }
        }
        packets
    }

    /// Held exchanges that fit in the window again, in order
    pub fn release_held(&mut self) -> Vec<Packet> {
        let limit = usize::from(self.receive_maximum);
        let mut active = self.entries.iter().filter(|m| !m.held).count();
        let now = Instant::now();
        let mut packets = Vec::new();
        for m in self.entries.iter_mut().filter(|m| m.held) {
            if active >= limit {
                break;
            }
            active += 1;
            packets.push(m.resume(now));
        }
        packets
    }

    /// Packets for exchanges unacknowledged for longer than `interval`
    pub fn resend_due(&mut self, interval: Duration) -> Vec<Packet> {
        let now = Instant::now();
        self.entries
            .iter_mut()
            .filter(|m| !m.held && now.saturating_duration_since(m.sent_at) >= interval)
            .map(|m| m.resume(now))
            .collect()
    }

    /// Drop an exchange that can never be delivered, freeing its slot
    pub fn abandon(&mut self, packet_id: u16) -> Option<InflightMessage> {
        self.remove(packet_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InflightMessage> {
        self.entries.iter()
    }

    /// Re-insert an exchange loaded from storage, keeping its packet id and state
    pub fn restore(&mut self, message: InflightMessage) {
        if self.contains(message.packet_id) {
            return;
        }
        self.next_packet_id = message.packet_id.wrapping_add(1).max(1);
        self.entries.push_back(message);
    }
}

/// Client to server QoS 2 window
#[derive(Debug)]
pub struct InboundWindow {
    receive_maximum: u16,
    awaiting_release: AHashMap<u16, Publish>,
}

impl InboundWindow {
    pub fn new(receive_maximum: u16) -> Self {
        Self {
            receive_maximum: receive_maximum.max(1),
            awaiting_release: AHashMap::new(),
        }
    }

    pub fn set_receive_maximum(&mut self, receive_maximum: u16) {
        self.receive_maximum = receive_maximum.max(1);
    }

    pub fn len(&self) -> usize {
        self.awaiting_release.len()
    }

    pub fn is_empty(&self) -> bool {
        self.awaiting_release.is_empty()
    }

    /// Whether a PUBLISH with this id is already waiting for PUBREL
    pub fn contains(&self, packet_id: u16) -> bool {
        self.awaiting_release.contains_key(&packet_id)
    }

    /// Hold a QoS 2 PUBLISH until its PUBREL arrives (state `AwaitRel`)
    pub fn store(&mut self, packet_id: u16, publish: Publish) -> Result<(), ProtocolError> {
        if self.awaiting_release.len() >= usize::from(self.receive_maximum) {
            return Err(ProtocolError::ReceiveMaximumExceeded(self.receive_maximum));
        }
        self.awaiting_release.insert(packet_id, publish);
        Ok(())
    }

    /// PUBREL received; the stored PUBLISH is ready for routing
    pub fn release(&mut self, packet_id: u16) -> Option<Publish> {
        self.awaiting_release.remove(&packet_id)
    }

    pub fn packet_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.awaiting_release.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Publish)> + '_ {
        self.awaiting_release.iter().map(|(id, p)| (*id, p))
    }

    /// Re-insert a PUBLISH loaded from storage; the window limit is not applied
    pub fn restore(&mut self, packet_id: u16, publish: Publish) {
        self.awaiting_release.insert(packet_id, publish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(qos: QoS) -> Publish {
        Publish::new("t", Bytes::from_static(b"x"), qos)
    }

    #[test]
    fn test_window_capacity() {
        let mut window = OutboundWindow::new(2);
        assert!(window.has_capacity());
        let a = window.insert(publish(QoS::AtLeastOnce));
        window.insert(publish(QoS::AtLeastOnce));
        assert!(!window.has_capacity());

        assert!(window.puback(a).is_some());
        assert!(window.has_capacity());
        assert!(window.puback(a).is_none());
    }

    #[test]
    fn test_packet_ids_skip_in_use_and_zero() {
        let mut window = OutboundWindow::new(10);
        window.next_packet_id = u16::MAX;
        let a = window.insert(publish(QoS::AtLeastOnce));
        let b = window.insert(publish(QoS::AtLeastOnce));
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 1);

        window.next_packet_id = u16::MAX;
        assert_eq!(window.insert(publish(QoS::AtLeastOnce)), 2);
    }

    #[test]
    fn test_qos2_exchange() {
        let mut window = OutboundWindow::new(1);
        let id = window.insert(publish(QoS::ExactlyOnce));
        window.mark_sent(id);

        // PUBACK does not end a QoS 2 exchange
        assert!(window.puback(id).is_none());
        assert!(window.pubcomp(id).is_none());
        assert!(window.pubrec(id, true));
        assert!(!window.has_capacity());
        assert!(window.pubcomp(id).is_some());
        assert!(window.is_empty());
    }

    #[test]
    fn test_rejected_pubrec_releases_slot() {
        let mut window = OutboundWindow::new(1);
        let id = window.insert(publish(QoS::ExactlyOnce));
        window.mark_sent(id);
        assert!(!window.pubrec(id, false));
        assert!(window.is_empty());
    }

    #[test]
    fn test_resend_all_keeps_order_and_sets_dup() {
        let mut window = OutboundWindow::new(10);
        let a = window.insert(publish(QoS::AtLeastOnce));
        let b = window.insert(publish(QoS::ExactlyOnce));
        let c = window.insert(publish(QoS::AtLeastOnce));
        window.mark_sent(a);
        window.mark_sent(b);
        window.pubrec(b, true);

        let packets = window.resend_all();
        assert_eq!(packets.len(), 3);
        match &packets[0] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(a));
                assert!(p.dup);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&packets[1], Packet::PubRel(r) if r.packet_id == b));
        match &packets[2] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(c));
                assert!(!p.dup, "never-sent entries go out without DUP");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(window.iter().all(|m| m.state != InflightState::Sent));
    }

    #[test]
    fn test_resend_all_holds_beyond_smaller_window() {
        let mut window = OutboundWindow::new(10);
        let ids: Vec<u16> = (0..3)
            .map(|_| window.insert(publish(QoS::AtLeastOnce)))
            .collect();
        ids.iter().for_each(|&id| window.mark_sent(id));

        // The reconnecting client only accepts one exchange at a time
        window.set_receive_maximum(1);
        let packets = window.resend_all();
        assert_eq!(packets.len(), 1);
        assert!(matches!(&packets[0], Packet::Publish(p) if p.packet_id == Some(ids[0])));
        assert!(window.release_held().is_empty());
        assert!(!window.has_capacity());

        window.puback(ids[0]);
        let packets = window.release_held();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(ids[1]));
                assert!(p.dup);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(window.release_held().is_empty());

        window.puback(ids[1]);
        assert_eq!(window.release_held().len(), 1);
        assert!(window.iter().all(|m| !m.held));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_exchanges_not_retried() {
        let mut window = OutboundWindow::new(10);
        let a = window.insert(publish(QoS::AtLeastOnce));
        let b = window.insert(publish(QoS::AtLeastOnce));
        window.mark_sent(a);
        window.mark_sent(b);
        window.set_receive_maximum(1);
        window.resend_all();

        tokio::time::advance(Duration::from_secs(5)).await;
        let packets = window.resend_due(Duration::from_secs(5));
        assert_eq!(packets.len(), 1);
        assert!(matches!(&packets[0], Packet::Publish(p) if p.packet_id == Some(a)));
    }

    #[test]
    fn test_abandon_frees_slot() {
        let mut window = OutboundWindow::new(1);
        let id = window.insert(publish(QoS::ExactlyOnce));
        assert!(!window.has_capacity());
        assert_eq!(window.abandon(id).map(|m| m.packet_id), Some(id));
        assert!(window.has_capacity());
        assert!(window.abandon(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_due() {
        let mut window = OutboundWindow::new(10);
        let id = window.insert(publish(QoS::AtLeastOnce));
        window.mark_sent(id);

        assert!(window.resend_due(Duration::from_secs(5)).is_empty());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(window.resend_due(Duration::from_secs(5)).len(), 1);
        assert!(window.resend_due(Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_inbound_window_limit() {
        let mut window = InboundWindow::new(2);
        window.store(1, publish(QoS::ExactlyOnce)).unwrap();
        window.store(2, publish(QoS::ExactlyOnce)).unwrap();
        assert!(window.contains(1));
        assert_eq!(
            window.store(3, publish(QoS::ExactlyOnce)),
            Err(ProtocolError::ReceiveMaximumExceeded(2))
        );

        assert!(window.release(1).is_some());
        assert!(window.release(1).is_none());
        window.store(3, publish(QoS::ExactlyOnce)).unwrap();
        assert_eq!(window.len(), 2);
    }
}
