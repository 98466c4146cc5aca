mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{config, eventually, init_tracing};
use mq_bridge::{
    //
    create_memory_transport_with_hub,
    Consumer,
    HandlerError,
    MemoryConnector,
    MemoryHub,
    MessageData,
    MessageProperties,
    MqClient,
    MqClientBuilder,
    MqError,
    Transport,
    TransportMode,
    GROUP_EXISTS_MESSAGE,
    START_DELIVER_TIME_PROPERTY,
};

fn memory_client(hub: &Arc<MemoryHub>) -> MqClient {
    // ---
    init_tracing();
    MqClient::new(config(), MemoryConnector::with_hub(hub.clone())).unwrap()
}

/// Collect delivered messages and acknowledge each through `consumer`.
async fn receive_into(consumer: &Arc<Consumer>) -> Arc<Mutex<Vec<MessageData>>> {
    // ---
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let acker = Arc::downgrade(consumer);

    consumer
        .on_message(move |msg: MessageData| {
            let sink = sink.clone();
            let acker = acker.clone();
            async move {
                if let Some(consumer) = acker.upgrade() {
                    consumer.ack_message(&msg.receipt_handle).await?;
                }
                sink.lock().unwrap().push(msg);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    consumer.start_receiving(None).await.unwrap();
    inbox
}

#[tokio::test]
async fn test_memory_send_receive_ack() {
    // ---
    // Arrange
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let consumer = Arc::new(client.get_consumer("I1", "orders", "billing", None).await.unwrap());
    let inbox = receive_into(&consumer).await;
    let producer = client.get_producer("I1", "orders").await.unwrap();

    // Act
    let sent = producer
        .publish(
            &serde_json::json!({"order": 42}),
            "created",
            MessageProperties::new().put_property("region", "eu"),
        )
        .await
        .unwrap();

    // Assert
    assert!(eventually(|| inbox.lock().unwrap().len() == 1).await);
    let message = inbox.lock().unwrap()[0].clone();
    assert_eq!(message.message_id, sent.message_id);
    assert_eq!(message.tag, "created");
    assert_eq!(message.properties["region"], "eu");
    assert_eq!(message.json::<serde_json::Value>().unwrap()["order"], 42);

    assert!(eventually(|| hub.pending_receipts() == 0).await);
}

#[tokio::test]
async fn test_memory_tag_expression_filters() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let consumer = Arc::new(
        client
            .get_consumer("I1", "orders", "audit", Some("paid||refunded"))
            .await
            .unwrap(),
    );
    let inbox = receive_into(&consumer).await;
    let producer = client.get_producer("I1", "orders").await.unwrap();

    for tag in ["created", "paid", "shipped", "refunded"] {
        producer.publish(tag, tag, MessageProperties::new()).await.unwrap();
    }

    assert!(eventually(|| inbox.lock().unwrap().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let bodies: Vec<String> = inbox.lock().unwrap().iter().map(|m| m.body.clone()).collect();
    assert_eq!(bodies, vec!["paid", "refunded"]);
    assert_eq!(hub.sent_messages().len(), 4);
}

#[tokio::test]
async fn test_memory_registry_shields_duplicate_group() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);

    let a = client.get_consumer("I1", "orders", "billing", None).await.unwrap();
    let b = client.get_consumer("I1", "orders", "billing", None).await.unwrap();
    assert_eq!(hub.consumer_count(), 1);
    assert_eq!(b.ref_count(), 2);

    // A second client has its own registry, so the hub sees the duplicate.
    let other = memory_client(&hub);
    let err = other
        .get_consumer("I1", "orders", "billing", None)
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::ResourceCreation { ref message, .. } if message == GROUP_EXISTS_MESSAGE));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    assert_eq!(hub.consumer_count(), 0);

    other
        .get_consumer("I1", "orders", "billing", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_memory_delay_and_transaction_pass_through() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let producer = client.get_producer("I1", "orders").await.unwrap();

    producer
        .publish(
            "later",
            "t",
            MessageProperties::new().with_start_deliver_time(1_700_000_000_000),
        )
        .await
        .unwrap();
    let txn = producer
        .publish_transactional("half", "t", MessageProperties::new(), 30)
        .await
        .unwrap();
    producer
        .publish_ordered("o", "t", MessageProperties::new(), "shard-1")
        .await
        .unwrap();

    let sent = hub.sent_messages();
    assert_eq!(sent[0].properties.deliver_at(), Some(1_700_000_000_000));
    assert_eq!(
        sent[0].properties.properties[START_DELIVER_TIME_PROPERTY],
        "1700000000000"
    );
    assert_eq!(sent[1].transaction_id.as_deref(), Some(txn.transaction_id.as_str()));
    assert_eq!(sent[1].properties.trans_check_immunity_time, 30);
    assert_eq!(sent[2].sharding_key.as_deref(), Some("shard-1"));
}

#[tokio::test]
async fn test_memory_ack_unknown_receipt_fails() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let consumer = client.get_consumer("I1", "orders", "billing", None).await.unwrap();
    consumer.start_receiving(None).await.unwrap();

    let err = consumer.ack_message("no-such-receipt").await.unwrap_err();
    assert!(matches!(err, MqError::Ack(ref m) if m.contains("unknown receipt handle")));
}

#[tokio::test]
async fn test_memory_malformed_injection_is_dropped() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let consumer = Arc::new(client.get_consumer("I1", "orders", "billing", None).await.unwrap());
    let inbox = receive_into(&consumer).await;

    assert_eq!(hub.inject_raw("orders", "<<garbage>>").await, 1);
    let producer = client.get_producer("I1", "orders").await.unwrap();
    producer.publish("fine", "t", MessageProperties::new()).await.unwrap();

    assert!(eventually(|| inbox.lock().unwrap().len() == 1).await);
    assert_eq!(inbox.lock().unwrap()[0].body, "fine");
}

#[tokio::test]
async fn test_memory_consumer_shutdown_stops_delivery() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let consumer = Arc::new(client.get_consumer("I1", "orders", "billing", None).await.unwrap());
    let inbox = receive_into(&consumer).await;
    let producer = client.get_producer("I1", "orders").await.unwrap();

    consumer.shutdown().await.unwrap();
    producer.publish("late", "t", MessageProperties::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(inbox.lock().unwrap().is_empty());
    assert_eq!(hub.consumer_count(), 0);
}

#[tokio::test]
async fn test_memory_health_and_client_shutdown() {
    // ---
    let hub = MemoryHub::new();
    let client = MqClientBuilder::new()
        .endpoint("mem://")
        .access_key_id("ak")
        .access_key_secret("sk")
        .instance_id("I1")
        .connector(MemoryConnector::with_hub(hub.clone()))
        .build()
        .unwrap();
    assert_eq!(client.mode(), TransportMode::Memory);

    let health = client.health_check().await.unwrap();
    assert!(health.is_healthy());
    assert_eq!(health.mode, TransportMode::Memory);

    hub.set_degraded("simulated outage");
    let health = client.health_check().await.unwrap();
    assert!(!health.is_healthy());
    assert_eq!(health.message, "simulated outage");
    hub.clear_degraded();

    client.get_producer("I1", "orders").await.unwrap();
    assert_eq!(hub.producer_count(), 1);

    client.shutdown().await.unwrap();
    assert_eq!(hub.producer_count(), 0);
}

#[tokio::test]
async fn test_memory_transports_share_hub() {
    // ---
    let hub = MemoryHub::new();
    let a = create_memory_transport_with_hub(&config(), hub.clone()).await.unwrap();
    let b = create_memory_transport_with_hub(&config(), hub.clone()).await.unwrap();

    a.create_producer(&config(), "orders").await.unwrap();
    b.create_consumer(&config(), "orders", "g", "*").await.unwrap();

    assert_eq!(hub.producer_count(), 1);
    assert_eq!(hub.consumer_count(), 1);
    assert_eq!(a.mode(), TransportMode::Memory);
}

#[tokio::test]
async fn test_memory_subscribe_after_client_shutdown_is_normalized() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let consumer = client.get_consumer("I1", "orders", "billing", None).await.unwrap();

    client.shutdown().await.unwrap();

    let err = consumer.start_receiving(None).await.unwrap_err();
    assert!(matches!(err, MqError::ResourceCreation { ref message, .. } if message.contains("transport is closed")));
}

#[tokio::test]
async fn test_memory_shared_consumer_shutdown_leaves_no_dead_receipts() {
    // ---
    // Arrange
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let first = client.get_consumer("I1", "orders", "billing", None).await.unwrap();
    let second = client.get_consumer("I1", "orders", "billing", None).await.unwrap();
    first.start_receiving(None).await.unwrap();
    second.start_receiving(None).await.unwrap();
    let producer = client.get_producer("I1", "orders").await.unwrap();

    // Act
    first.shutdown().await.unwrap();
    for n in 0..10 {
        producer.publish(&n, "t", MessageProperties::new()).await.unwrap();
    }

    // Assert
    assert_eq!(hub.consumer_count(), 1);
    assert_eq!(hub.pending_receipts(), 10);
}

#[tokio::test]
async fn test_memory_dropped_consumer_stops_delivery_but_keeps_reference() {
    // ---
    let hub = MemoryHub::new();
    let client = memory_client(&hub);
    let consumer = client.get_consumer("I1", "orders", "billing", None).await.unwrap();
    consumer.start_receiving(None).await.unwrap();
    let producer = client.get_producer("I1", "orders").await.unwrap();

    drop(consumer);
    tokio::time::sleep(Duration::from_millis(30)).await;
    producer.publish("late", "t", MessageProperties::new()).await.unwrap();

    // The delivery loop is gone, but only shutdown releases the broker consumer.
    assert_eq!(hub.pending_receipts(), 0);
    assert_eq!(hub.consumer_count(), 1);
    assert_eq!(client.active_consumers(), 1);
}
