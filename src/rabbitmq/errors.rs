// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::fmt;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Which broker signal is holding publishes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureCause {
    /// The server asked the channel to stop sending (channel.flow).
    Flow,
    /// The server blocked the TCP connection (connection.blocked).
    Blocked,
}

impl fmt::Display for BackpressureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressureCause::Flow => f.write_str("flow request from server"),
            BackpressureCause::Blocked => f.write_str("TCP blocking from server"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect to any broker URI: {0}")]
    ConnectError(String),

    #[error("Reconnect attempts exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Publishing paused due to {0}")]
    Backpressure(BackpressureCause),

    #[error("Declaration rejected by broker: {0}")]
    DeclareError(String),

    #[error("Message {delivery_tag} exhausted {retries} retries")]
    ProcessingExhausted { delivery_tag: u64, retries: u32 },

    #[error("Authentication refused: {0}")]
    AuthError(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("No broker connection is available")]
    NotConnected,

    #[error("Connection manager is closed")]
    Closed,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether a connection attempt failing with this error may succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::TimeoutError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::NotConnected
        )
    }

    /// Errors after which a manager can never hand out a connection again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectError(_)
                | RabbitMQError::ReconnectExhausted { .. }
                | RabbitMQError::AuthError(_)
                | RabbitMQError::InvalidConfig(_)
                | RabbitMQError::Closed
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("access_refused") || lowered.contains("authentication") {
            RabbitMQError::AuthError(error_text)
        } else if lowered.contains("precondition_failed") || lowered.contains("not_found") {
            RabbitMQError::DeclareError(error_text)
        } else if lowered.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            RabbitMQError::PublishError(error_text)
        } else if lowered.contains("consume") {
            RabbitMQError::ConsumeError(error_text)
        } else if lowered.contains("ack") || lowered.contains("nack") {
            RabbitMQError::AckError(error_text)
        } else {
            RabbitMQError::ConnectionError(error_text)
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RabbitMQError::ConnectionError("reset".into()).is_retryable());
        assert!(RabbitMQError::TimeoutError("slow".into()).is_retryable());
        assert!(!RabbitMQError::AuthError("bad password".into()).is_retryable());
        assert!(!RabbitMQError::InvalidConfig("bad uri".into()).is_retryable());
    }

    #[test]
    fn exhaustion_is_fatal() {
        let err = RabbitMQError::ReconnectExhausted {
            attempts: 3,
            last_error: "refused".into(),
        };
        assert!(err.is_fatal());
        assert!(!RabbitMQError::Backpressure(BackpressureCause::Flow).is_fatal());
    }

    #[test]
    fn backpressure_names_its_cause() {
        let flow = RabbitMQError::Backpressure(BackpressureCause::Flow).to_string();
        let blocked = RabbitMQError::Backpressure(BackpressureCause::Blocked).to_string();
        assert!(flow.contains("flow request"));
        assert!(blocked.contains("TCP blocking"));
    }

    #[test]
    fn elapsed_becomes_timeout() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let elapsed = rt
            .block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_millis(1),
                    std::future::pending::<()>(),
                )
                .await
            })
            .unwrap_err();
        assert!(matches!(
            RabbitMQError::from(elapsed),
            RabbitMQError::TimeoutError(_)
        ));
    }
}
