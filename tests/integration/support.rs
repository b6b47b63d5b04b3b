use resilient_rmq::{ConnectionConfig, ConnectionManager, Publisher, PublisherOptions};
use resilient_rmq::rabbitmq::MemoryBroker;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const PRIMARY: &str = "amqp://primary:5672";
pub const SECONDARY: &str = "amqp://secondary:5672";

pub fn config(uris: &[&str], max_attempt: i32) -> ConnectionConfig {
    ConnectionConfig::new(uris.iter().copied())
        .with_reconnect_policy(max_attempt, Duration::from_millis(50))
        .with_connect_timeout(Duration::from_millis(200))
}

pub async fn connected(broker: &MemoryBroker, max_attempt: i32) -> ConnectionManager {
    let manager = ConnectionManager::new(config(&[PRIMARY, SECONDARY], max_attempt), broker.transport())
        .expect("valid config");
    manager.connect().await.expect("connect");
    manager
}

pub async fn publisher(connection: &ConnectionManager) -> Publisher {
    Publisher::new(
        connection.clone(),
        PublisherOptions {
            name: "test-publisher".to_string(),
            exchanges: Vec::new(),
        },
    )
    .await
    .expect("publisher")
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Gives spawned listener tasks a moment to drain their streams.
pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}
