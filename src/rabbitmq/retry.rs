// src/rabbitmq/retry.rs
use crate::config::MessageRetryConfig;
use crate::message::ProcessingOutcome;

/// What to do with a delivery once its handler has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Republish carrying `retry_count`, then ack the original.
    Requeue { retry_count: u32 },
    /// Publish to the dead-letter destination, then ack the original.
    DeadLetter { reason: String },
    /// Ack without keeping the message anywhere.
    Discard { reason: String },
    /// nack with requeue; the broker redelivers it as is.
    Redeliver,
    /// nack without requeue.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    config: MessageRetryConfig,
}

impl RetryPolicy {
    pub fn new(config: MessageRetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MessageRetryConfig {
        &self.config
    }

    /// Decides the fate of a delivery that has already been retried `retry_count` times.
    pub fn decide(&self, outcome: ProcessingOutcome, retry_count: u32) -> Disposition {
        if !self.config.enabled {
            return match outcome {
                ProcessingOutcome::Success => Disposition::Ack,
                ProcessingOutcome::Retry => Disposition::Redeliver,
                ProcessingOutcome::Reject => Disposition::Drop,
            };
        }

        let reason = match outcome {
            ProcessingOutcome::Success => return Disposition::Ack,
            ProcessingOutcome::Retry if retry_count < self.config.retry_count_limit => {
                return Disposition::Requeue {
                    retry_count: retry_count + 1,
                }
            }
            ProcessingOutcome::Retry => format!(
                "retry limit of {} reached",
                self.config.retry_count_limit
            ),
            ProcessingOutcome::Reject => "rejected by handler".to_string(),
        };

        if self.config.handle_dead_message {
            Disposition::DeadLetter { reason }
        } else {
            Disposition::Discard { reason }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MessageRetryConfig::default())
    }
}
