//! Message delivery: QoS flows, flow control, retained messages, shared
//! subscriptions, topic aliases, size limits and offline queues.

mod common;

use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use common::{connect_packet, init_tracing, TestClient};
use vibemq_session::protocol::{
    Packet, ProtocolError, PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, RetainHandling,
    SubscriptionOptions, UnsubAck, Unsubscribe,
};
use vibemq_session::{Broker, BrokerConfig, ConnectionError, OversizedDelivery};

const SHORT: Duration = Duration::from_millis(200);

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_reaches_subscriber() {
    init_tracing();
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "sub", true, 0).await;
    let (mut publisher, _) = TestClient::connected(&broker, "pub", true, 0).await;

    let suback = sub.subscribe("sensors/+/temp", QoS::AtLeastOnce).await;
    assert_eq!(suback.reason_codes, vec![ReasonCode::GrantedQoS1]);

    let puback = publisher.publish_qos1("sensors/1/temp", b"21.5").await;
    assert_eq!(puback.reason_code, ReasonCode::Success);

    let publish = sub.expect_publish().await;
    assert_eq!(&*publish.topic, "sensors/1/temp");
    assert_eq!(publish.payload, Bytes::from_static(b"21.5"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);
    assert!(publish.packet_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_puback_reports_no_matching_subscribers() {
    let broker = Broker::default();
    let (mut publisher, _) = TestClient::connected(&broker, "lonely", true, 0).await;
    let puback = publisher.publish_qos1("nobody/listens", b"x").await;
    assert_eq!(puback.reason_code, ReasonCode::NoMatchingSubscribers);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_qos_is_downgraded() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "sub", true, 0).await;
    sub.subscribe("down", QoS::AtMostOnce).await;

    broker.publish("down", "x", QoS::ExactlyOnce, false);
    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_qos2_inbound_routed_on_pubrel() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "sub", true, 0).await;
    let (mut publisher, _) = TestClient::connected(&broker, "pub", true, 0).await;
    sub.subscribe("exact", QoS::ExactlyOnce).await;

    let packet_id = publisher
        .publish(Publish::new("exact", Bytes::from_static(b"once"), QoS::ExactlyOnce))
        .await
        .unwrap();
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec::new(packet_id)))
    );
    sub.expect_nothing(SHORT).await;

    // A re-sent PUBLISH while waiting for PUBREL is acknowledged, not routed
    let mut resent = Publish::new("exact", Bytes::from_static(b"once"), QoS::ExactlyOnce);
    resent.packet_id = Some(packet_id);
    resent.dup = true;
    publisher.publish(resent).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec::new(packet_id)))
    );

    publisher.pubrel(packet_id).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubComp(PubComp::new(packet_id)))
    );

    let delivered = sub.expect_publish().await;
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    sub.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_pubrel_gets_packet_id_not_found() {
    let broker = Broker::default();
    let (mut client, _) = TestClient::connected(&broker, "c", true, 0).await;
    client.pubrel(9).await;
    assert_eq!(
        client.recv().await,
        Some(Packet::PubComp(PubComp::with_reason(
            9,
            ReasonCode::PacketIdNotFound
        )))
    );
}

#[tokio::test(start_paused = true)]
async fn test_qos2_outbound_exchange() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "sub", true, 0).await;
    sub.subscribe("q2", QoS::ExactlyOnce).await;

    broker.publish("q2", "x", QoS::ExactlyOnce, false);
    let publish = sub.expect_publish().await;
    let packet_id = publish.packet_id.unwrap();

    sub.send(Packet::PubRec(PubRec::new(packet_id))).await;
    assert_eq!(sub.recv().await, Some(Packet::PubRel(PubRel::new(packet_id))));
    sub.send(Packet::PubComp(PubComp::new(packet_id))).await;
    sub.ping().await;

    // An unknown PUBREC is answered with PUBREL "packet identifier not found"
    sub.send(Packet::PubRec(PubRec::new(77))).await;
    assert_eq!(
        sub.recv().await,
        Some(Packet::PubRel(PubRel::with_reason(
            77,
            ReasonCode::PacketIdNotFound
        )))
    );
}

#[tokio::test(start_paused = true)]
async fn test_client_receive_maximum_holds_messages() {
    let broker = Broker::default();
    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("slow", true, 0);
    connect.properties.receive_maximum = Some(2);
    sub.connect(connect).await;
    sub.subscribe("flow", QoS::AtLeastOnce).await;

    for payload in ["1", "2", "3"] {
        broker.publish("flow", payload, QoS::AtLeastOnce, false);
    }

    let first = sub.expect_publish().await;
    let second = sub.expect_publish().await;
    assert_eq!(first.payload, Bytes::from_static(b"1"));
    assert_eq!(second.payload, Bytes::from_static(b"2"));
    sub.expect_nothing(SHORT).await;

    sub.puback(first.packet_id.unwrap()).await;
    let third = sub.expect_publish().await;
    assert_eq!(third.payload, Bytes::from_static(b"3"));
}

#[tokio::test(start_paused = true)]
async fn test_qos0_not_held_by_full_window() {
    let broker = Broker::default();
    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("mixed", true, 0);
    connect.properties.receive_maximum = Some(1);
    sub.connect(connect).await;
    sub.subscribe("mix", QoS::AtLeastOnce).await;

    broker.publish("mix", "a", QoS::AtLeastOnce, false);
    broker.publish("mix", "b", QoS::AtLeastOnce, false);
    broker.publish("mix", "c", QoS::AtMostOnce, false);

    let a = sub.expect_publish().await;
    assert_eq!(a.payload, Bytes::from_static(b"a"));
    let c = sub.expect_publish().await;
    assert_eq!(c.payload, Bytes::from_static(b"c"));
    sub.expect_nothing(SHORT).await;

    sub.puback(a.packet_id.unwrap()).await;
    let b = sub.expect_publish().await;
    assert_eq!(b.payload, Bytes::from_static(b"b"));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_receive_maximum_exceeded() {
    let broker = Broker::new(BrokerConfig {
        receive_maximum: 2,
        ..BrokerConfig::default()
    });
    let (mut client, connack) = TestClient::connected(&broker, "flood", true, 0).await;
    assert_eq!(connack.properties.receive_maximum, Some(2));

    for _ in 0..2 {
        let id = client
            .publish(Publish::new("q2", Bytes::from_static(b"x"), QoS::ExactlyOnce))
            .await
            .unwrap();
        assert_eq!(client.recv().await, Some(Packet::PubRec(PubRec::new(id))));
    }
    client
        .publish(Publish::new("q2", Bytes::from_static(b"x"), QoS::ExactlyOnce))
        .await;

    assert_eq!(
        client.expect_disconnect().await,
        ReasonCode::ReceiveMaxExceeded
    );
    assert!(matches!(
        client.finish().await,
        Err(ConnectionError::Protocol(
            ProtocolError::ReceiveMaximumExceeded(2)
        ))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_after_reconnect_sets_dup_in_order() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "redeliver", false, 300).await;
    sub.subscribe("again", QoS::AtLeastOnce).await;

    broker.publish("again", "1", QoS::AtLeastOnce, false);
    broker.publish("again", "2", QoS::AtLeastOnce, false);
    let first = sub.expect_publish().await;
    let second = sub.expect_publish().await;
    assert!(matches!(
        sub.drop_link().await,
        Err(ConnectionError::Closed)
    ));

    let (mut sub, connack) = TestClient::connected(&broker, "redeliver", false, 300).await;
    assert!(connack.session_present);

    let again_first = sub.expect_publish().await;
    let again_second = sub.expect_publish().await;
    assert!(again_first.dup && again_second.dup);
    assert_eq!(again_first.packet_id, first.packet_id);
    assert_eq!(again_second.packet_id, second.packet_id);
    assert_eq!(again_first.payload, first.payload);
    assert_eq!(again_second.payload, second.payload);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_respects_new_receive_maximum() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "narrowed", false, 300).await;
    sub.subscribe("again", QoS::AtLeastOnce).await;

    broker.publish("again", "1", QoS::AtLeastOnce, false);
    broker.publish("again", "2", QoS::AtLeastOnce, false);
    sub.expect_publish().await;
    sub.expect_publish().await;
    sub.drop_link().await.ok();

    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("narrowed", false, 300);
    connect.properties.receive_maximum = Some(1);
    assert!(sub.connect(connect).await.session_present);

    let first = sub.expect_publish().await;
    assert!(first.dup);
    assert_eq!(first.payload, Bytes::from_static(b"1"));
    sub.expect_nothing(SHORT).await;

    sub.puback(first.packet_id.unwrap()).await;
    let second = sub.expect_publish().await;
    assert!(second.dup);
    assert_eq!(second.payload, Bytes::from_static(b"2"));
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_larger_than_new_maximum_packet_size_disconnects() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "shrunk", false, 300).await;
    sub.subscribe("big", QoS::AtLeastOnce).await;
    broker.publish("big", vec![0u8; 200], QoS::AtLeastOnce, false);
    sub.expect_publish().await;
    sub.drop_link().await.ok();

    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("shrunk", false, 300);
    connect.properties.maximum_packet_size = Some(64);
    assert!(sub.connect(connect).await.session_present);

    assert_eq!(sub.expect_disconnect().await, ReasonCode::PacketTooLarge);
    assert!(matches!(
        sub.finish().await,
        Err(ConnectionError::Protocol(ProtocolError::OutboundTooLarge { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_larger_than_new_maximum_packet_size_abandoned() {
    let broker = Broker::new(BrokerConfig {
        oversized_delivery: OversizedDelivery::Discard,
        ..BrokerConfig::default()
    });
    let (mut sub, _) = TestClient::connected(&broker, "shrunk", false, 300).await;
    sub.subscribe("big", QoS::AtLeastOnce).await;
    broker.publish("big", vec![0u8; 200], QoS::AtLeastOnce, false);
    sub.expect_publish().await;
    sub.drop_link().await.ok();
    broker.publish("big", "fits", QoS::AtLeastOnce, false);

    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("shrunk", false, 300);
    connect.properties.maximum_packet_size = Some(64);
    connect.properties.receive_maximum = Some(1);
    assert!(sub.connect(connect).await.session_present);

    // The abandoned exchange frees its slot for the queued message
    let next = sub.expect_publish().await;
    assert_eq!(next.payload, Bytes::from_static(b"fits"));
    assert!(!next.dup);
    sub.ping().await;
}

#[tokio::test(start_paused = true)]
async fn test_pubrel_resent_after_reconnect() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "halfway", false, 300).await;
    sub.subscribe("q2", QoS::ExactlyOnce).await;

    broker.publish("q2", "x", QoS::ExactlyOnce, false);
    let packet_id = sub.expect_publish().await.packet_id.unwrap();
    sub.send(Packet::PubRec(PubRec::new(packet_id))).await;
    assert_eq!(sub.recv().await, Some(Packet::PubRel(PubRel::new(packet_id))));
    sub.drop_link().await.ok();

    let (mut sub, _) = TestClient::connected(&broker, "halfway", false, 300).await;
    assert_eq!(sub.recv().await, Some(Packet::PubRel(PubRel::new(packet_id))));
}

#[tokio::test(start_paused = true)]
async fn test_offline_messages_delivered_on_resume() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "offline", false, 300).await;
    sub.subscribe("queued", QoS::AtLeastOnce).await;
    sub.disconnect().await;

    assert_eq!(broker.publish("queued", "a", QoS::AtLeastOnce, false), 1);
    assert_eq!(broker.publish("queued", "b", QoS::AtMostOnce, false), 1);

    let (mut sub, connack) = TestClient::connected(&broker, "offline", false, 300).await;
    assert!(connack.session_present);
    let a = sub.expect_publish().await;
    let b = sub.expect_publish().await;
    assert_eq!(a.payload, Bytes::from_static(b"a"));
    assert_eq!(b.payload, Bytes::from_static(b"b"));
    assert_eq!(b.qos, QoS::AtMostOnce);
}

#[tokio::test(start_paused = true)]
async fn test_offline_queue_drops_oldest() {
    let broker = Broker::new(BrokerConfig {
        max_queued_messages: 2,
        ..BrokerConfig::default()
    });
    let (mut sub, _) = TestClient::connected(&broker, "bounded", false, 300).await;
    sub.subscribe("q", QoS::AtLeastOnce).await;
    sub.disconnect().await;

    for payload in ["1", "2", "3"] {
        broker.publish("q", payload, QoS::AtLeastOnce, false);
    }

    let (mut sub, _) = TestClient::connected(&broker, "bounded", false, 300).await;
    assert_eq!(sub.expect_publish().await.payload, Bytes::from_static(b"2"));
    assert_eq!(sub.expect_publish().await.payload, Bytes::from_static(b"3"));
    sub.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_message_expiry_while_queued() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "expiring", false, 300).await;
    sub.subscribe("exp", QoS::AtLeastOnce).await;
    sub.disconnect().await;

    let (mut publisher, _) = TestClient::connected(&broker, "pub", true, 0).await;
    let mut short = Publish::new("exp", Bytes::from_static(b"short"), QoS::AtMostOnce);
    short.properties.message_expiry_interval = Some(2);
    let mut long = Publish::new("exp", Bytes::from_static(b"long"), QoS::AtMostOnce);
    long.properties.message_expiry_interval = Some(10);
    publisher.publish(short).await;
    publisher.publish(long).await;
    publisher.ping().await;

    tokio::time::advance(Duration::from_secs(4)).await;

    let (mut sub, _) = TestClient::connected(&broker, "expiring", false, 300).await;
    let publish = sub.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from_static(b"long"));
    assert_eq!(publish.properties.message_expiry_interval, Some(6));
    sub.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_properties_forwarded() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "sub", true, 0).await;
    let (mut publisher, _) = TestClient::connected(&broker, "pub", true, 0).await;
    sub.subscribe("props", QoS::AtMostOnce).await;

    let mut publish = Publish::new("props", Bytes::from_static(b"{}"), QoS::AtMostOnce);
    publish.properties.content_type = Some("application/json".into());
    publish.properties.response_topic = Some("reply/here".into());
    publish.properties.correlation_data = Some(Bytes::from_static(b"corr"));
    publish.properties.payload_format_indicator = Some(1);
    publish.properties.user_properties = vec![("k".into(), "v".into())];
    publish.properties.topic_alias = Some(3);
    publisher.publish(publish).await;

    let delivered = sub.expect_publish().await;
    assert_eq!(
        delivered.properties.content_type.as_deref(),
        Some("application/json")
    );
    assert_eq!(
        delivered.properties.response_topic.as_deref(),
        Some("reply/here")
    );
    assert_eq!(
        delivered.properties.correlation_data,
        Some(Bytes::from_static(b"corr"))
    );
    assert_eq!(delivered.properties.payload_format_indicator, Some(1));
    assert_eq!(
        delivered.properties.user_properties,
        vec![("k".to_string(), "v".to_string())]
    );
    assert_eq!(delivered.properties.topic_alias, None);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_subscriptions_merged() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "overlap", true, 0).await;
    sub.subscribe_with("a/+", SubscriptionOptions::with_qos(QoS::AtMostOnce), Some(1))
        .await;
    sub.subscribe_with("a/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), Some(2))
        .await;

    broker.publish("a/b", "x", QoS::AtLeastOnce, false);
    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    let mut ids = publish.properties.subscription_identifiers.clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    sub.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_no_local_skips_own_messages() {
    let broker = Broker::default();
    let (mut client, _) = TestClient::connected(&broker, "self", true, 0).await;
    let options = SubscriptionOptions {
        qos: QoS::AtMostOnce,
        no_local: true,
        ..SubscriptionOptions::default()
    };
    client.subscribe_with("echo", options, None).await;

    client
        .publish(Publish::new("echo", Bytes::from_static(b"x"), QoS::AtMostOnce))
        .await;
    client.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_shared_subscription_single_recipient() {
    let broker = Broker::default();
    let (mut a, _) = TestClient::connected(&broker, "worker-a", true, 0).await;
    let (mut b, _) = TestClient::connected(&broker, "worker-b", true, 0).await;
    a.subscribe("$share/workers/jobs", QoS::AtLeastOnce).await;
    b.subscribe("$share/workers/jobs", QoS::AtLeastOnce).await;

    assert_eq!(broker.publish("jobs", "1", QoS::AtLeastOnce, false), 1);

    let received_a = tokio::time::timeout(SHORT, a.expect_publish()).await.ok();
    let received_b = tokio::time::timeout(SHORT, b.expect_publish()).await.ok();
    assert_eq!(
        usize::from(received_a.is_some()) + usize::from(received_b.is_some()),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_shared_subscription_gets_no_retained() {
    let broker = Broker::default();
    broker.publish("jobs", "old", QoS::AtMostOnce, true);

    let (mut a, _) = TestClient::connected(&broker, "worker", true, 0).await;
    a.subscribe("$share/g/jobs", QoS::AtMostOnce).await;
    a.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_shared_subscription_no_local_is_error() {
    let broker = Broker::default();
    let (mut client, _) = TestClient::connected(&broker, "c", true, 0).await;
    let options = SubscriptionOptions {
        no_local: true,
        ..SubscriptionOptions::default()
    };
    client
        .send(Packet::Subscribe(vibemq_session::protocol::Subscribe {
            packet_id: 1,
            subscriptions: vec![vibemq_session::protocol::Subscription {
                filter: "$share/g/t".into(),
                options,
            }],
            properties: Default::default(),
        }))
        .await;
    assert_eq!(client.expect_disconnect().await, ReasonCode::ProtocolError);
}

#[tokio::test(start_paused = true)]
async fn test_suback_reason_codes() {
    let broker = Broker::new(BrokerConfig {
        max_qos: QoS::AtLeastOnce,
        wildcard_subscription_available: false,
        disallowed_filters: vec!["secret".into()],
        ..BrokerConfig::default()
    });
    let (mut client, _) = TestClient::connected(&broker, "c", true, 0).await;

    let granted = client.subscribe("plain", QoS::ExactlyOnce).await;
    assert_eq!(granted.reason_codes, vec![ReasonCode::GrantedQoS1]);

    let wildcard = client.subscribe("any/+", QoS::AtMostOnce).await;
    assert_eq!(
        wildcard.reason_codes,
        vec![ReasonCode::WildcardSubsNotSupported]
    );

    let invalid = client.subscribe("bad/#/x", QoS::AtMostOnce).await;
    assert_eq!(invalid.reason_codes, vec![ReasonCode::TopicFilterInvalid]);

    let refused = client.subscribe("secret", QoS::AtMostOnce).await;
    assert_eq!(refused.reason_codes, vec![ReasonCode::UnspecifiedError]);
}

#[tokio::test(start_paused = true)]
async fn test_disallowed_wildcard_filter_refused() {
    let broker = Broker::new(BrokerConfig {
        disallowed_filters: vec!["secret/#".into()],
        ..BrokerConfig::default()
    });
    let (mut client, _) = TestClient::connected(&broker, "c", true, 0).await;

    let refused = client.subscribe("secret/#", QoS::AtLeastOnce).await;
    assert_eq!(refused.reason_codes, vec![ReasonCode::UnspecifiedError]);
    let allowed = client.subscribe("secret/+", QoS::AtLeastOnce).await;
    assert_eq!(allowed.reason_codes, vec![ReasonCode::GrantedQoS1]);

    // The refused filter never entered the index
    client
        .send(Packet::Unsubscribe(Unsubscribe {
            packet_id: 90,
            filters: vec!["secret/#".into()],
            properties: Default::default(),
        }))
        .await;
    assert_eq!(
        client.recv().await,
        Some(Packet::UnsubAck(UnsubAck {
            packet_id: 90,
            reason_codes: vec![ReasonCode::NoSubscriptionExisted],
            properties: Default::default(),
        }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_reason_codes() {
    let broker = Broker::default();
    let (mut client, _) = TestClient::connected(&broker, "c", true, 0).await;
    client.subscribe("t", QoS::AtMostOnce).await;

    client
        .send(Packet::Unsubscribe(Unsubscribe {
            packet_id: 42,
            filters: vec!["t".into(), "never".into()],
            properties: Default::default(),
        }))
        .await;
    assert_eq!(
        client.recv().await,
        Some(Packet::UnsubAck(UnsubAck {
            packet_id: 42,
            reason_codes: vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted],
            properties: Default::default(),
        }))
    );

    broker.publish("t", "x", QoS::AtMostOnce, false);
    client.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_retained_set_and_delete() {
    let broker = Broker::default();
    broker.publish("status/door", "open", QoS::AtLeastOnce, true);
    assert_eq!(broker.retained_count(), 1);

    let (mut sub, _) = TestClient::connected(&broker, "late", true, 0).await;
    sub.subscribe("status/#", QoS::AtLeastOnce).await;
    let retained = sub.expect_publish().await;
    assert!(retained.retain);
    assert_eq!(retained.payload, Bytes::from_static(b"open"));
    sub.puback(retained.packet_id.unwrap()).await;

    // Empty retained payload deletes the entry and is still forwarded
    broker.publish("status/door", Bytes::new(), QoS::AtMostOnce, true);
    assert_eq!(broker.retained_count(), 0);
    let forwarded = sub.expect_publish().await;
    assert!(forwarded.payload.is_empty());
    assert!(!forwarded.retain);

    let (mut other, _) = TestClient::connected(&broker, "later", true, 0).await;
    other.subscribe("status/#", QoS::AtLeastOnce).await;
    other.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_retain_handling() {
    let broker = Broker::default();
    broker.publish("cfg", "v1", QoS::AtMostOnce, true);
    let (mut client, _) = TestClient::connected(&broker, "c", true, 0).await;

    let if_new = SubscriptionOptions {
        retain_handling: RetainHandling::SendAtSubscribeIfNew,
        ..SubscriptionOptions::default()
    };
    client.subscribe_with("cfg", if_new, None).await;
    assert!(client.expect_publish().await.retain);
    client.subscribe_with("cfg", if_new, None).await;
    client.expect_nothing(SHORT).await;

    client.subscribe("cfg", QoS::AtMostOnce).await;
    assert!(client.expect_publish().await.retain);

    client.subscribe_no_retained("cfg", QoS::AtMostOnce).await;
    client.expect_nothing(SHORT).await;
}

#[tokio::test(start_paused = true)]
async fn test_retain_as_published() {
    let broker = Broker::default();
    let (mut client, _) = TestClient::connected(&broker, "c", true, 0).await;
    let options = SubscriptionOptions {
        retain_as_published: true,
        retain_handling: RetainHandling::DoNotSend,
        ..SubscriptionOptions::default()
    };
    client.subscribe_with("rap", options, None).await;

    broker.publish("rap", "x", QoS::AtMostOnce, true);
    assert!(client.expect_publish().await.retain);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_topic_alias() {
    let broker = Broker::default();
    let (mut sub, _) = TestClient::connected(&broker, "sub", true, 0).await;
    sub.subscribe("long/topic/name", QoS::AtMostOnce).await;
    let (mut publisher, _) = TestClient::connected(&broker, "aliaser", false, 300).await;

    let mut first = Publish::new("long/topic/name", Bytes::from_static(b"1"), QoS::AtMostOnce);
    first.properties.topic_alias = Some(1);
    publisher.publish(first).await;
    let mut second = Publish::new("", Bytes::from_static(b"2"), QoS::AtMostOnce);
    second.properties.topic_alias = Some(1);
    publisher.publish(second).await;

    assert_eq!(&*sub.expect_publish().await.topic, "long/topic/name");
    assert_eq!(&*sub.expect_publish().await.topic, "long/topic/name");

    // Aliases die with the connection even when the session survives
    publisher.disconnect().await;
    let (mut publisher, connack) = TestClient::connected(&broker, "aliaser", false, 300).await;
    assert!(connack.session_present);
    let mut stale = Publish::new("", Bytes::from_static(b"3"), QoS::AtMostOnce);
    stale.properties.topic_alias = Some(1);
    publisher.publish(stale).await;
    assert_eq!(
        publisher.expect_disconnect().await,
        ReasonCode::TopicAliasInvalid
    );
}

#[tokio::test(start_paused = true)]
async fn test_topic_alias_zero_disconnects() {
    let broker = Broker::default();
    let (mut client, _) = TestClient::connected(&broker, "zero", true, 0).await;
    let mut publish = Publish::new("t", Bytes::from_static(b"x"), QoS::AtMostOnce);
    publish.properties.topic_alias = Some(0);
    client.publish(publish).await;

    assert_eq!(client.expect_disconnect().await, ReasonCode::TopicAliasInvalid);
    assert!(matches!(
        client.finish().await,
        Err(ConnectionError::Protocol(ProtocolError::TopicAliasInvalid(0)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_outbound_topic_alias() {
    let broker = Broker::default();
    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("alias-rx", true, 0);
    connect.properties.topic_alias_maximum = Some(1);
    sub.connect(connect).await;
    sub.subscribe("#", QoS::AtMostOnce).await;

    broker.publish("first/topic", "1", QoS::AtMostOnce, false);
    broker.publish("first/topic", "2", QoS::AtMostOnce, false);
    broker.publish("second/topic", "3", QoS::AtMostOnce, false);

    let new = sub.expect_publish().await;
    assert_eq!(&*new.topic, "first/topic");
    assert_eq!(new.properties.topic_alias, Some(1));

    let reused = sub.expect_publish().await;
    assert_eq!(&*reused.topic, "");
    assert_eq!(reused.properties.topic_alias, Some(1));

    // Table full: full topic, no alias
    let full = sub.expect_publish().await;
    assert_eq!(&*full.topic, "second/topic");
    assert_eq!(full.properties.topic_alias, None);
}

#[tokio::test(start_paused = true)]
async fn test_new_alias_not_used_when_it_exceeds_maximum_packet_size() {
    let topic = "sensors/kitchen/temperature";
    let limit = Publish::new(topic, Bytes::from_static(b"21.5"), QoS::AtMostOnce).encoded_len();

    let broker = Broker::default();
    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("tight", true, 0);
    connect.properties.topic_alias_maximum = Some(5);
    connect.properties.maximum_packet_size = Some(limit as u32);
    sub.connect(connect).await;
    sub.subscribe(topic, QoS::AtMostOnce).await;

    broker.publish(topic, "21.5", QoS::AtMostOnce, false);
    broker.publish(topic, "21.6", QoS::AtMostOnce, false);

    for payload in [&b"21.5"[..], &b"21.6"[..]] {
        let publish = sub.expect_publish().await;
        assert_eq!(&*publish.topic, topic);
        assert_eq!(publish.properties.topic_alias, None);
        assert_eq!(publish.payload, Bytes::copy_from_slice(payload));
        assert!(publish.encoded_len() <= limit);
    }
    sub.ping().await;
}

#[tokio::test(start_paused = true)]
async fn test_oversized_delivery_disconnects() {
    let broker = Broker::default();
    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("small", true, 0);
    connect.properties.maximum_packet_size = Some(64);
    sub.connect(connect).await;
    sub.subscribe("big", QoS::AtMostOnce).await;

    broker.publish("big", vec![0u8; 200], QoS::AtMostOnce, false);
    assert_eq!(sub.expect_disconnect().await, ReasonCode::PacketTooLarge);
    assert!(matches!(
        sub.finish().await,
        Err(ConnectionError::Protocol(ProtocolError::OutboundTooLarge { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_delivery_discarded() {
    let broker = Broker::new(BrokerConfig {
        oversized_delivery: OversizedDelivery::Discard,
        ..BrokerConfig::default()
    });
    let mut sub = TestClient::new(&broker);
    let mut connect = connect_packet("small", true, 0);
    connect.properties.maximum_packet_size = Some(64);
    sub.connect(connect).await;
    sub.subscribe("big", QoS::AtMostOnce).await;

    broker.publish("big", vec![0u8; 200], QoS::AtMostOnce, false);
    broker.publish("big", "fits", QoS::AtMostOnce, false);
    assert_eq!(
        sub.expect_publish().await.payload,
        Bytes::from_static(b"fits")
    );
    sub.ping().await;
}

#[tokio::test(start_paused = true)]
async fn test_inbound_packet_too_large() {
    let broker = Broker::new(BrokerConfig {
        max_packet_size: 100,
        ..BrokerConfig::default()
    });
    let (mut client, _) = TestClient::connected(&broker, "big-sender", true, 0).await;
    client
        .publish(Publish::new("t", vec![0u8; 500], QoS::AtMostOnce))
        .await;
    assert_eq!(client.expect_disconnect().await, ReasonCode::PacketTooLarge);
}

#[tokio::test(start_paused = true)]
async fn test_retry_interval_resends_with_dup() {
    let broker = Broker::new(BrokerConfig {
        retry_interval: Duration::from_secs(10),
        ..BrokerConfig::default()
    });
    let (mut sub, _) = TestClient::connected(&broker, "retry", true, 0).await;
    sub.subscribe("r", QoS::AtLeastOnce).await;

    broker.publish("r", "x", QoS::AtLeastOnce, false);
    let first = sub.expect_publish().await;
    assert!(!first.dup);

    tokio::time::sleep(Duration::from_secs(8)).await;
    let resent = sub.expect_publish().await;
    assert!(resent.dup);
    assert_eq!(resent.packet_id, first.packet_id);
}
