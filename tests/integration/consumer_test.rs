use resilient_rmq::message::{DEAD_LETTER_REASON_HEADER, RETRY_COUNT_HEADER};
use resilient_rmq::rabbitmq::{MemoryBroker, QosSettings};
use resilient_rmq::{
    Consumer, ConsumerConfig, ConsumerOptions, HeaderValue, MessageEnvelope, MessageRetryConfig,
    ProcessingOutcome, QueueConfig, RabbitMQError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::support::{connected, eventually, publisher, settle, PRIMARY, SECONDARY};

const QUEUE: &str = "jobs";
const DEAD_LETTER_QUEUE: &str = "jobs.dlq";

fn options(retry: MessageRetryConfig) -> ConsumerOptions {
    let consumer = ConsumerConfig {
        auto_ack: false,
        ..ConsumerConfig::new("worker")
    };
    ConsumerOptions::new(consumer, QueueConfig::new(QUEUE)).with_retry(retry)
}

fn retry(enabled: bool, handle_dead_message: bool, limit: u32) -> MessageRetryConfig {
    MessageRetryConfig {
        enabled,
        handle_dead_message,
        retry_count_limit: limit,
    }
}

/// A handler that always answers `outcome` and records the retry counter it saw.
fn recording(
    outcome: ProcessingOutcome,
) -> (
    Arc<Mutex<Vec<u32>>>,
    impl Fn(MessageEnvelope) -> std::future::Ready<ProcessingOutcome> + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let handler = move |envelope: MessageEnvelope| {
        log.lock().unwrap().push(envelope.retry_count());
        std::future::ready(outcome)
    };
    (seen, handler)
}

#[tokio::test]
async fn success_is_acknowledged() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let consumer = Consumer::new(connection.clone(), options(MessageRetryConfig::default())).unwrap();
    let (seen, handler) = recording(ProcessingOutcome::Success);
    consumer.start(handler).await.unwrap();

    publisher(&connection)
        .await
        .publish("", QUEUE, MessageEnvelope::new("work"))
        .await
        .unwrap();

    eventually("the ack", || broker.acked().len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![0]);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn retries_twice_then_dead_letters() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let consumer = Consumer::new(connection.clone(), options(retry(true, true, 2))).unwrap();
    let (seen, handler) = recording(ProcessingOutcome::Retry);
    consumer.start(handler).await.unwrap();

    publisher(&connection)
        .await
        .publish("", QUEUE, MessageEnvelope::new("flaky"))
        .await
        .unwrap();

    eventually("the dead letter", || broker.queue_depth(DEAD_LETTER_QUEUE) == 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    let requeued: Vec<Option<HeaderValue>> = broker
        .published_to(QUEUE)
        .iter()
        .skip(1)
        .map(|message| message.envelope.header(RETRY_COUNT_HEADER).cloned())
        .collect();
    assert_eq!(
        requeued,
        vec![Some(HeaderValue::Int(1)), Some(HeaderValue::Int(2))]
    );

    let dead = broker.published_to(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.payload, b"flaky".to_vec());
    assert!(dead[0].envelope.header(DEAD_LETTER_REASON_HEADER).is_some());
    eventually("every delivery to be settled", || broker.acked().len() == 3).await;
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn zero_limit_dead_letters_on_first_retry() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let consumer = Consumer::new(connection.clone(), options(retry(true, true, 0))).unwrap();
    let (seen, handler) = recording(ProcessingOutcome::Retry);
    consumer.start(handler).await.unwrap();

    publisher(&connection)
        .await
        .publish("", QUEUE, MessageEnvelope::new("flaky"))
        .await
        .unwrap();

    eventually("the dead letter", || broker.queue_depth(DEAD_LETTER_QUEUE) == 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![0]);
    assert_eq!(broker.published_to(QUEUE).len(), 1);
}

#[tokio::test]
async fn reject_without_dead_lettering_discards_with_ack() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let consumer = Consumer::new(connection.clone(), options(retry(true, false, 2))).unwrap();
    let (seen, handler) = recording(ProcessingOutcome::Reject);
    consumer.start(handler).await.unwrap();

    publisher(&connection)
        .await
        .publish("", QUEUE, MessageEnvelope::new("poison"))
        .await
        .unwrap();

    eventually("the ack", || broker.acked().len() == 1).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(!broker.queue_exists(DEAD_LETTER_QUEUE));
    assert!(broker.nacked().is_empty());
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn disabled_retry_hands_messages_back_to_the_broker() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let consumer = Consumer::new(connection.clone(), options(retry(false, true, 2))).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    consumer
        .start(move |envelope: MessageEnvelope| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match (call, envelope.payload.as_slice()) {
                    (_, b"poison") => ProcessingOutcome::Reject,
                    (0, _) => ProcessingOutcome::Retry,
                    _ => ProcessingOutcome::Success,
                }
            }
        })
        .await
        .unwrap();

    let publisher = publisher(&connection).await;
    publisher
        .publish("", QUEUE, MessageEnvelope::new("flaky"))
        .await
        .unwrap();
    eventually("the redelivery to succeed", || broker.acked().len() == 1).await;
    assert_eq!(broker.nacked().len(), 1);
    assert!(broker.nacked()[0].1);

    publisher
        .publish("", QUEUE, MessageEnvelope::new("poison"))
        .await
        .unwrap();
    eventually("the drop", || broker.nacked().len() == 2).await;
    assert!(!broker.nacked()[1].1);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert!(!broker.queue_exists(DEAD_LETTER_QUEUE));
}

#[tokio::test]
async fn keeps_consuming_after_reconnect() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 5).await;
    let consumer = Consumer::new(connection.clone(), options(MessageRetryConfig::default())).unwrap();
    let (seen, handler) = recording(ProcessingOutcome::Success);
    consumer.start(handler).await.unwrap();
    let publisher = publisher(&connection).await;

    publisher
        .publish("", QUEUE, MessageEnvelope::new("first"))
        .await
        .unwrap();
    eventually("the first delivery", || seen.lock().unwrap().len() == 1).await;

    broker.drop_connections("node restart");
    publisher
        .publish("", QUEUE, MessageEnvelope::new("second"))
        .await
        .unwrap();

    eventually("the second delivery", || seen.lock().unwrap().len() == 2).await;
    assert!(consumer.is_running().await);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn applies_prefetch_and_declares_idempotently() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let mut options = options(MessageRetryConfig::default());
    options.consumer.prefetch_count = 5;

    let first = Consumer::new(connection.clone(), options.clone()).unwrap();
    let second = Consumer::new(connection.clone(), options).unwrap();
    first.start(|_: MessageEnvelope| async { ProcessingOutcome::Success }).await.unwrap();
    second.start(|_: MessageEnvelope| async { ProcessingOutcome::Success }).await.unwrap();

    assert_eq!(broker.queue_count(), 2);
    assert_eq!(
        broker.qos_history(),
        vec![
            QosSettings {
                prefetch_count: 5,
                prefetch_size: 0,
                global: false
            };
            2
        ]
    );
}

#[tokio::test]
async fn prefetch_is_skipped_when_disabled() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let mut options = options(MessageRetryConfig::default());
    options.consumer.enabled_prefetch = false;

    let consumer = Consumer::new(connection, options).unwrap();
    consumer.start(|_: MessageEnvelope| async { ProcessingOutcome::Success }).await.unwrap();

    assert!(broker.qos_history().is_empty());
}

#[tokio::test]
async fn refuses_to_start_twice_or_when_disabled() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;

    let consumer = Consumer::new(connection.clone(), options(MessageRetryConfig::default())).unwrap();
    consumer.start(|_: MessageEnvelope| async { ProcessingOutcome::Success }).await.unwrap();
    let again = consumer.start(|_: MessageEnvelope| async { ProcessingOutcome::Success }).await;
    assert!(matches!(again, Err(RabbitMQError::ConsumeError(_))));

    let mut disabled = options(MessageRetryConfig::default());
    disabled.consumer.enabled = false;
    let consumer = Consumer::new(connection, disabled).unwrap();
    let refused = consumer.start(|_: MessageEnvelope| async { ProcessingOutcome::Success }).await;
    assert!(matches!(refused, Err(RabbitMQError::InvalidConfig(_))));
}

#[tokio::test]
async fn conflicting_queue_declaration_surfaces_on_start() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let first = Consumer::new(connection.clone(), options(MessageRetryConfig::default())).unwrap();
    first.start(|_: MessageEnvelope| async { ProcessingOutcome::Success }).await.unwrap();

    let mut conflicting = options(MessageRetryConfig::default());
    conflicting.queue.durable = false;
    let second = Consumer::new(connection, conflicting).unwrap();
    let err = second
        .start(|_: MessageEnvelope| async { ProcessingOutcome::Success })
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::DeclareError(_)));
}

#[tokio::test]
async fn stop_lets_the_current_handler_finish() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let consumer = Consumer::new(connection.clone(), options(MessageRetryConfig::default())).unwrap();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (started_flag, finished_flag) = (Arc::clone(&started), Arc::clone(&finished));
    consumer
        .start(move |_: MessageEnvelope| {
            let started = Arc::clone(&started_flag);
            let finished = Arc::clone(&finished_flag);
            async move {
                started.store(true, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                ProcessingOutcome::Success
            }
        })
        .await
        .unwrap();

    publisher(&connection)
        .await
        .publish("", QUEUE, MessageEnvelope::new("slow"))
        .await
        .unwrap();
    eventually("the handler to start", || started.load(Ordering::SeqCst)).await;

    consumer.stop().await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert!(!consumer.is_running().await);
    assert_eq!(broker.acked().len(), 1);
}

#[tokio::test]
async fn stop_returns_while_the_broker_is_unreachable() {
    let broker = MemoryBroker::new();
    // Unlimited reconnects: waiting for the connection would never end.
    let connection = connected(&broker, 0).await;
    let consumer = Consumer::new(connection, options(MessageRetryConfig::default())).unwrap();
    let (_, handler) = recording(ProcessingOutcome::Success);
    consumer.start(handler).await.unwrap();

    broker.refuse_uri(PRIMARY);
    broker.refuse_uri(SECONDARY);
    broker.drop_connections("node stopped");
    settle().await;

    timeout(Duration::from_secs(3), consumer.stop())
        .await
        .expect("stop returns during the outage")
        .unwrap();
    assert!(!consumer.is_running().await);
}

#[tokio::test]
async fn pause_on_flow_holds_deliveries() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker, 3).await;
    let mut options = options(MessageRetryConfig::default());
    options.consumer.pause_on_flow = true;
    let consumer = Consumer::new(connection, options).unwrap();
    let (seen, handler) = recording(ProcessingOutcome::Success);
    consumer.start(handler).await.unwrap();

    broker.set_flow(true);
    settle().await;
    broker.deliver(QUEUE, MessageEnvelope::new("held"));
    settle().await;
    assert!(seen.lock().unwrap().is_empty());

    broker.set_flow(false);
    eventually("the held delivery", || seen.lock().unwrap().len() == 1).await;
}
