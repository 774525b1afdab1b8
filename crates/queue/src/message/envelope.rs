//! Message types: what producers send and what consumers lease

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessageStatus;

/// Message headers (string keys, arbitrary JSON values)
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Opaque message identifier assigned by the store
///
/// Ids increase monotonically within one store, which makes `id asc` the
/// final FIFO tie-break of dequeue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A message to be sent
///
/// # Example
///
/// ```
/// use durable_queue::NewMessage;
/// use std::time::Duration;
///
/// let message = NewMessage::new(b"resize image 42".to_vec())
///     .with_header("tenant", serde_json::json!("acme"))
///     .with_priority(1)
///     .with_delay(Duration::from_secs(30))
///     .with_route("images");
/// ```
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub body: Vec<u8>,
    pub headers: Headers,

    /// Generated when not provided
    pub correlation_id: Option<Uuid>,

    /// Lower values are dequeued first (when priority ordering is enabled)
    pub priority: Option<u8>,

    /// Delay before the message becomes eligible
    pub delay: Option<Duration>,

    /// Time to live; an expired message is never dequeued
    pub expiration: Option<Duration>,

    pub route: Option<String>,

    /// At most one active message per job name
    pub job_name: Option<String>,
}

impl NewMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Create a message with a JSON-encoded body
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    /// Earliest eligible processing time relative to `now`
    pub fn queue_process_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.delay {
            Some(delay) => offset_after(now, delay),
            None => now,
        }
    }

    /// Absolute expiration time relative to `now`
    pub fn expiration_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expiration.map(|ttl| offset_after(now, ttl))
    }
}

/// A message as stored and as handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub correlation_id: Uuid,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub status: MessageStatus,

    /// Set only while the message is processing (and heartbeats are enabled)
    pub heartbeat: Option<DateTime<Utc>>,

    pub queue_process_time: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
    pub route: Option<String>,
    pub job_name: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    /// Decode the body as JSON
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.get(key)
    }

    /// Whether the message has expired as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|exp| exp <= now)
    }
}

/// Longest offset applied to a timestamp; longer delays and lifetimes are
/// clamped so every backend can store the result
pub const MAX_TIME_OFFSET: Duration = Duration::from_secs(1000 * 365 * 24 * 60 * 60);

fn bounded(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_TIME_OFFSET)).unwrap_or(chrono::Duration::zero())
}

/// `at + duration`, with the duration clamped to [`MAX_TIME_OFFSET`]
pub(crate) fn offset_after(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(bounded(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - duration`, with the duration clamped to [`MAX_TIME_OFFSET`]
pub(crate) fn offset_before(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(bounded(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_builder() {
        let message = NewMessage::new(b"payload".to_vec())
            .with_header("k", serde_json::json!(1))
            .with_priority(3)
            .with_route("r1")
            .with_job_name("nightly");

        assert_eq!(message.body, b"payload");
        assert_eq!(message.headers.get("k"), Some(&serde_json::json!(1)));
        assert_eq!(message.priority, Some(3));
        assert_eq!(message.route.as_deref(), Some("r1"));
        assert_eq!(message.job_name.as_deref(), Some("nightly"));
    }

    #[test]
    fn test_process_and_expiration_times() {
        let now = Utc::now();
        let message = NewMessage::new(vec![])
            .with_delay(Duration::from_secs(10))
            .with_expiration(Duration::from_secs(60));

        assert_eq!(message.queue_process_time(now), now + chrono::Duration::seconds(10));
        assert_eq!(
            message.expiration_time(now),
            Some(now + chrono::Duration::seconds(60))
        );

        let immediate = NewMessage::new(vec![]);
        assert_eq!(immediate.queue_process_time(now), now);
        assert_eq!(immediate.expiration_time(now), None);
    }

    #[test]
    fn test_huge_offsets_are_clamped() {
        let now = Utc::now();
        let message = NewMessage::new(vec![])
            .with_delay(Duration::from_secs(u64::MAX))
            .with_expiration(Duration::MAX);

        let ceiling = now + chrono::Duration::from_std(MAX_TIME_OFFSET).unwrap();
        assert_eq!(message.queue_process_time(now), ceiling);
        assert_eq!(message.expiration_time(now), Some(ceiling));
        assert_eq!(
            offset_before(now, Duration::MAX),
            now - chrono::Duration::from_std(MAX_TIME_OFFSET).unwrap()
        );
        assert_eq!(
            offset_after(DateTime::<Utc>::MAX_UTC, Duration::from_secs(1)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_json_body() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Order {
            id: u32,
        }

        let new = NewMessage::json(&Order { id: 7 }).unwrap();
        let message = Message {
            id: MessageId(1),
            correlation_id: Uuid::now_v7(),
            body: new.body,
            headers: Headers::new(),
            status: MessageStatus::Processing,
            heartbeat: None,
            queue_process_time: Utc::now(),
            expiration_time: None,
            priority: None,
            route: None,
            job_name: None,
            enqueued_at: Utc::now(),
        };

        assert_eq!(message.body_json::<Order>().unwrap(), Order { id: 7 });
        assert!(!message.is_expired(Utc::now()));
    }
}
