use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::generate_id;
use crate::rabbitmq::errors::Result;

/// Header carrying how many times a message has been requeued for another attempt.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Header stamped on dead-lettered messages describing why they were routed there.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

/// A header or argument value. Covers the AMQP field types applications actually set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Argument tables for declarations, bindings and message headers.
pub type FieldArgs = BTreeMap<String, HeaderValue>;

/// One message plus its broker metadata and application headers.
///
/// Outgoing envelopes leave `delivery_tag`, `exchange`, `routing_key` and
/// `redelivered` at their defaults; the broker fills them on delivery.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageEnvelope {
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: FieldArgs,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageEnvelope {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Serializes `value` as the payload and marks the content type as JSON.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(payload).with_content_type("application/json"))
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// Number of times this message has already been requeued. Missing or
    /// malformed counters read as zero.
    pub fn retry_count(&self) -> u32 {
        match self.headers.get(RETRY_COUNT_HEADER) {
            Some(HeaderValue::Int(count)) => u32::try_from(*count).unwrap_or(0),
            Some(HeaderValue::String(count)) => count.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub(crate) fn set_retry_count(&mut self, count: u32) {
        self.headers
            .insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::Int(i64::from(count)));
    }

    /// Fills in the ids and timestamp a publish needs when the caller left them out.
    pub(crate) fn stamp_for_publish(&mut self) {
        let message_id = self.message_id.get_or_insert_with(generate_id).clone();
        if self.correlation_id.is_none() {
            self.correlation_id = Some(message_id);
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    /// Copy of a delivered message suitable for publishing again.
    pub(crate) fn to_outgoing(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            content_type: self.content_type.clone(),
            timestamp: self.timestamp,
            ..Self::default()
        }
    }
}

/// What the application handler decided about one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    Retry,
    Reject,
}
