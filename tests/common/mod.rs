//! Shared helpers for the engine tests
//!
//! A [`TestClient`] plays the codec side of a link: it pushes typed packets
//! into the engine and reads what the engine sends back.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use vibemq_session::protocol::{
    ConnAck, Connect, Disconnect, Packet, Properties, PubAck, PubRel, Publish, QoS, ReasonCode,
    RetainHandling, SubAck, Subscribe, Subscription, SubscriptionOptions, Will,
};
use vibemq_session::{Broker, ConnectionError};

/// Install a test subscriber once; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// CONNECT with keep alive disabled, so idle tests never time out
pub fn connect_packet(client_id: &str, clean_start: bool, session_expiry: u32) -> Connect {
    let mut connect = Connect {
        client_id: client_id.to_string(),
        clean_start,
        keep_alive: 0,
        ..Connect::default()
    };
    if session_expiry > 0 {
        connect.properties.session_expiry_interval = Some(session_expiry);
    }
    connect
}

/// Will on `topic` with the given delay interval
pub fn will(topic: &str, payload: &'static [u8], delay: u32) -> Will {
    let mut properties = Properties::default();
    if delay > 0 {
        properties.will_delay_interval = Some(delay);
    }
    Will {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload),
        qos: QoS::AtMostOnce,
        retain: false,
        properties,
    }
}

pub struct TestClient {
    tx: Option<mpsc::Sender<Packet>>,
    rx: mpsc::Receiver<Packet>,
    task: JoinHandle<Result<(), ConnectionError>>,
    next_packet_id: u16,
}

impl TestClient {
    /// Open a new link to `broker`
    pub fn new(broker: &Broker) -> Self {
        let link = broker.link(256);
        Self {
            tx: Some(link.tx),
            rx: link.rx,
            task: link.task,
            next_packet_id: 1,
        }
    }

    /// Open a link and connect with keep alive disabled
    pub async fn connected(
        broker: &Broker,
        client_id: &str,
        clean_start: bool,
        session_expiry: u32,
    ) -> (Self, ConnAck) {
        let mut client = Self::new(broker);
        let connack = client
            .connect(connect_packet(client_id, clean_start, session_expiry))
            .await;
        assert_eq!(connack.reason_code, ReasonCode::Success);
        (client, connack)
    }

    pub async fn send(&self, packet: Packet) {
        self.tx
            .as_ref()
            .expect("link already dropped")
            .send(packet)
            .await
            .expect("engine closed the link");
    }

    /// Next packet from the engine; `None` after five seconds or when the link closed
    pub async fn recv(&mut self) -> Option<Packet> {
        timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Assert that nothing arrives within `wait`
    pub async fn expect_nothing(&mut self, wait: Duration) {
        if let Ok(Some(packet)) = timeout(wait, self.rx.recv()).await {
            panic!("expected no packet, got {:?}", packet);
        }
    }

    pub async fn connect(&mut self, connect: Connect) -> ConnAck {
        self.send(Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    fn packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    pub async fn subscribe(&mut self, filter: &str, qos: QoS) -> SubAck {
        self.subscribe_with(filter, SubscriptionOptions::with_qos(qos), None)
            .await
    }

    pub async fn subscribe_with(
        &mut self,
        filter: &str,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> SubAck {
        let mut properties = Properties::default();
        properties.subscription_identifiers.extend(subscription_id);
        let packet_id = self.packet_id();
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                options,
            }],
            properties,
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => {
                assert_eq!(ack.packet_id, packet_id);
                ack
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    /// Subscribe without retained delivery
    pub async fn subscribe_no_retained(&mut self, filter: &str, qos: QoS) -> SubAck {
        let options = SubscriptionOptions {
            qos,
            retain_handling: RetainHandling::DoNotSend,
            ..SubscriptionOptions::default()
        };
        self.subscribe_with(filter, options, None).await
    }

    /// Send a PUBLISH, assigning a packet id for QoS > 0; returns the id used
    pub async fn publish(&mut self, mut publish: Publish) -> Option<u16> {
        if publish.qos.is_acknowledged() && publish.packet_id.is_none() {
            publish.packet_id = Some(self.packet_id());
        }
        let packet_id = publish.packet_id;
        self.send(Packet::Publish(publish)).await;
        packet_id
    }

    /// QoS 1 publish, waiting for its PUBACK
    pub async fn publish_qos1(&mut self, topic: &str, payload: &'static [u8]) -> PubAck {
        let packet_id = self
            .publish(Publish::new(topic, Bytes::from_static(payload), QoS::AtLeastOnce))
            .await;
        match self.recv().await {
            Some(Packet::PubAck(ack)) => {
                assert_eq!(Some(ack.packet_id), packet_id);
                ack
            }
            other => panic!("expected PUBACK, got {:?}", other),
        }
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    pub async fn expect_disconnect(&mut self) -> ReasonCode {
        match self.recv().await {
            Some(Packet::Disconnect(disconnect)) => disconnect.reason_code,
            other => panic!("expected DISCONNECT, got {:?}", other),
        }
    }

    pub async fn puback(&self, packet_id: u16) {
        self.send(Packet::PubAck(PubAck::new(packet_id))).await;
    }

    pub async fn pubrel(&self, packet_id: u16) {
        self.send(Packet::PubRel(PubRel::new(packet_id))).await;
    }

    pub async fn ping(&mut self) {
        self.send(Packet::PingReq).await;
        match self.recv().await {
            Some(Packet::PingResp) => {}
            other => panic!("expected PINGRESP, got {:?}", other),
        }
    }

    /// Send DISCONNECT with `reason` and wait for the connection task to finish
    pub async fn disconnect_with(self, disconnect: Disconnect) -> Result<(), ConnectionError> {
        self.send(Packet::Disconnect(disconnect)).await;
        self.finish().await
    }

    /// Normal disconnection
    pub async fn disconnect(self) {
        self.disconnect_with(Disconnect::new(ReasonCode::Success))
            .await
            .expect("graceful disconnect");
    }

    /// Drop the link without DISCONNECT (network loss)
    pub async fn drop_link(mut self) -> Result<(), ConnectionError> {
        self.tx.take();
        self.finish().await
    }

    /// Wait for the connection task to end
    pub async fn finish(self) -> Result<(), ConnectionError> {
        timeout(Duration::from_secs(30), self.task)
            .await
            .expect("connection task did not finish")
            .expect("connection task panicked")
    }
}
