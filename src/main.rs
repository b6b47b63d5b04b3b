// src/main.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use resilient_rmq::config::{create_default_config_file, find_config_file, load_config};
use resilient_rmq::{
    init_tracing, ConnectionManager, Consumer, ConsumerConfig, ConsumerOptions, EnvSettings,
    MessageEnvelope, ProcessingOutcome, Publisher, PublisherOptions, QueueConfig, RabbitMQError,
    RmqSettings,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    sequence: u64,
    sent_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("init-config") {
        let path = args
            .get(2)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ResilientRmq.json"));
        return create_default_config_file(&path);
    }

    let settings = load_settings()?;
    let connection = ConnectionManager::with_lapin(settings.connection.clone())?;
    connection
        .connect()
        .await
        .context("Failed to connect to RabbitMQ")?;

    let publisher = Publisher::new(connection.clone(), settings.publisher.clone()).await?;

    let mut consumers = Vec::new();
    for options in settings.consumers.iter().filter(|o| o.consumer.enabled) {
        let consumer = Consumer::new(connection.clone(), options.clone())?;
        consumer.start(log_delivery).await?;
        consumers.push(consumer);
    }

    let Some(target) = settings.consumers.first().map(|o| o.queue.name.clone()) else {
        warn!("No consumers configured; nothing to publish to");
        tokio::signal::ctrl_c().await?;
        return shutdown(connection, publisher, consumers).await;
    };

    info!("Service running. Press Ctrl+C to exit.");
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                sequence += 1;
                let heartbeat = Heartbeat { sequence, sent_at: Utc::now() };
                match publisher.publish_json("", &target, &heartbeat).await {
                    Ok(()) => info!(sequence, queue = %target, "heartbeat published"),
                    Err(RabbitMQError::Backpressure(cause)) => {
                        warn!(sequence, %cause, "heartbeat skipped")
                    }
                    Err(err) => warn!(sequence, error = %err, "heartbeat failed"),
                }
            }
        }
    }

    shutdown(connection, publisher, consumers).await
}

/// The config file when one exists, otherwise the environment.
fn load_settings() -> Result<RmqSettings> {
    if let Ok(path) = find_config_file() {
        info!("Loading configuration from {}", path.display());
        return load_config(&path);
    }

    let env = EnvSettings::load()?;
    let consumer = ConsumerConfig {
        prefetch_count: env.prefetch_count,
        auto_ack: false,
        ..ConsumerConfig::new("heartbeat-consumer")
    };
    Ok(RmqSettings {
        connection: env.connection_config(),
        publisher: PublisherOptions {
            name: "heartbeat-publisher".to_string(),
            exchanges: Vec::new(),
        },
        consumers: vec![ConsumerOptions::new(
            consumer,
            QueueConfig::new("heartbeats"),
        )],
    })
}

async fn log_delivery(envelope: MessageEnvelope) -> ProcessingOutcome {
    match envelope.decode_json::<Heartbeat>() {
        Ok(heartbeat) => {
            info!(
                sequence = heartbeat.sequence,
                retries = envelope.retry_count(),
                "received heartbeat sent at {}",
                heartbeat.sent_at
            );
            ProcessingOutcome::Success
        }
        Err(err) => {
            warn!(error = %err, "unreadable message");
            ProcessingOutcome::Reject
        }
    }
}

async fn shutdown(
    connection: ConnectionManager,
    publisher: Publisher,
    consumers: Vec<Consumer>,
) -> Result<()> {
    info!("Closing RabbitMQ connection gracefully");
    for consumer in &consumers {
        consumer.stop().await?;
    }
    publisher.close().await?;
    connection.close().await?;
    Ok(())
}
