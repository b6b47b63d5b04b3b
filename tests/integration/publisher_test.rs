use futures::future::join_all;
use resilient_rmq::rabbitmq::MemoryBroker;
use resilient_rmq::{
    BackpressureCause, ExchangeConfig, ExchangeKind, MessageEnvelope, Publisher, PublisherOptions,
    RabbitMQError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::support::{connected, eventually, publisher, settle, PRIMARY, SECONDARY};

fn backpressure(result: Result<(), RabbitMQError>) -> Option<BackpressureCause> {
    match result {
        Err(RabbitMQError::Backpressure(cause)) => Some(cause),
        _ => None,
    }
}

#[tokio::test]
async fn flow_sequence_ending_paused_refuses() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = publisher(&connection).await;

    broker.set_flow(true);
    broker.set_flow(false);
    broker.set_flow(true);
    settle().await;

    let result = publisher
        .publish("", "jobs", MessageEnvelope::new("payload"))
        .await;
    assert_eq!(backpressure(result), Some(BackpressureCause::Flow));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn flow_sequence_ending_resumed_publishes() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = publisher(&connection).await;

    broker.set_flow(true);
    broker.set_flow(false);
    settle().await;

    publisher
        .publish("", "jobs", MessageEnvelope::new("payload"))
        .await
        .unwrap();
    assert_eq!(broker.published_to("jobs").len(), 1);
}

#[tokio::test]
async fn blocked_gate_refuses_while_flow_is_clear() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = publisher(&connection).await;

    broker.set_flow(false);
    broker.set_blocked(true);
    settle().await;

    let result = publisher
        .publish("", "jobs", MessageEnvelope::new("payload"))
        .await;
    assert_eq!(backpressure(result), Some(BackpressureCause::Blocked));

    broker.set_blocked(false);
    settle().await;
    assert!(publisher
        .publish("", "jobs", MessageEnvelope::new("payload"))
        .await
        .is_ok());
}

#[tokio::test]
async fn publish_succeeds_after_reconnect() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = publisher(&connection).await;
    publisher
        .publish("", "jobs", MessageEnvelope::new("before"))
        .await
        .unwrap();

    broker.drop_connections("node restart");
    timeout(
        Duration::from_secs(2),
        publisher.publish("", "jobs", MessageEnvelope::new("after")),
    )
    .await
    .unwrap()
    .unwrap();

    let payloads: Vec<Vec<u8>> = broker
        .published()
        .into_iter()
        .map(|message| message.envelope.payload)
        .collect();
    assert_eq!(payloads, vec![b"before".to_vec(), b"after".to_vec()]);
}

#[tokio::test]
async fn reconnect_clears_both_gates() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = publisher(&connection).await;
    let flow = publisher.watch_flow();
    let blocked = publisher.watch_blocked();

    broker.set_flow(true);
    broker.set_blocked(true);
    eventually("both gates to close", || *flow.borrow() && *blocked.borrow()).await;

    broker.drop_connections("node restart");
    eventually("both gates to reopen", || !*flow.borrow() && !*blocked.borrow()).await;

    publisher
        .publish("", "jobs", MessageEnvelope::new("payload"))
        .await
        .unwrap();
}

#[tokio::test]
async fn exchanges_are_redeclared_on_a_fresh_channel() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = Publisher::new(
        connection.clone(),
        PublisherOptions {
            name: "events".to_string(),
            exchanges: vec![ExchangeConfig::new("events", ExchangeKind::Fanout)],
        },
    )
    .await
    .unwrap();

    broker.drop_connections("node restart");
    publisher
        .publish("events", "anything", MessageEnvelope::new("payload"))
        .await
        .unwrap();

    assert_eq!(broker.published()[0].exchange, "events");
}

#[tokio::test]
async fn concurrent_publishes_all_arrive() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = Arc::new(publisher(&connection).await);

    let sends = (0..20).map(|n| {
        let publisher = Arc::clone(&publisher);
        tokio::spawn(async move {
            publisher
                .publish("", "jobs", MessageEnvelope::new(format!("message {n}")))
                .await
        })
    });
    for sent in join_all(sends).await {
        sent.unwrap().unwrap();
    }

    let published = broker.published();
    assert_eq!(published.len(), 20);
    let mut ids: Vec<String> = published
        .iter()
        .filter_map(|message| message.envelope.message_id.clone())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn closed_publisher_refuses() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let publisher = publisher(&connection).await;

    publisher.close().await.unwrap();

    let err = publisher
        .publish("", "jobs", MessageEnvelope::new("payload"))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::Closed));
}

#[tokio::test]
async fn close_does_not_wait_for_a_publish_stuck_on_reconnect() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 0).await;
    let publisher = Arc::new(publisher(&connection).await);

    broker.refuse_uri(PRIMARY);
    broker.refuse_uri(SECONDARY);
    broker.drop_connections("node stopped");
    let pending = tokio::spawn({
        let publisher = Arc::clone(&publisher);
        async move {
            publisher
                .publish("", "jobs", MessageEnvelope::new("payload"))
                .await
        }
    });
    settle().await;
    assert!(!pending.is_finished());

    timeout(Duration::from_secs(3), publisher.close())
        .await
        .expect("close returns during the outage")
        .unwrap();

    let result = timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(RabbitMQError::Closed)));
    assert!(broker.published().is_empty());
}
