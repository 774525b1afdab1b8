//! LeaseStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Headers, Message, MessageId, MessageStatus, NewMessage};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Message not found in the active tables
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// Error record not found
    #[error("error record not found: {0}")]
    ErrorRecordNotFound(MessageId),

    /// An active message already holds the job name; the error record is kept
    #[error("cannot requeue {id}: job name already queued as {existing}")]
    JobAlreadyQueued { id: MessageId, existing: MessageId },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failure is a transport/connectivity problem worth backing off on
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Ordering flags for dequeue
///
/// Sort keys are applied in this order: status, priority (if enabled),
/// queue process time (if delay is enabled), expiration (if enabled), id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueOrder {
    pub priority: bool,
    pub delay: bool,
    pub expiration: bool,
}

impl Default for DequeueOrder {
    fn default() -> Self {
        Self {
            priority: true,
            delay: true,
            expiration: true,
        }
    }
}

impl DequeueOrder {
    /// Column names in sort order (ascending)
    pub fn sort_columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["status"];
        if self.priority {
            columns.push("priority");
        }
        if self.delay {
            columns.push("queue_process_time");
        }
        if self.expiration {
            columns.push("expiration_time");
        }
        columns.push("id");
        columns
    }
}

/// Eligibility filter for one dequeue call
#[derive(Debug, Clone)]
pub struct DequeueFilter {
    /// Evaluation time for delay and expiration checks
    pub now: DateTime<Utc>,

    /// Only messages with this route
    pub route: Option<String>,

    pub order: DequeueOrder,

    /// Stamp a heartbeat when leasing
    pub track_heartbeat: bool,
}

impl DequeueFilter {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            route: None,
            order: DequeueOrder::default(),
            track_heartbeat: true,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_order(mut self, order: DequeueOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_heartbeat(mut self, enabled: bool) -> Self {
        self.track_heartbeat = enabled;
        self
    }

    /// Eligibility predicate shared by backends that evaluate it in process
    pub fn is_eligible(&self, message: &Message) -> bool {
        message.status == MessageStatus::Waiting
            && message.queue_process_time <= self.now
            && !message.is_expired(self.now)
            && self
                .route
                .as_ref()
                .map_or(true, |route| message.route.as_deref() == Some(route.as_str()))
    }
}

/// Result of a successful dequeue
#[derive(Debug, Clone)]
pub enum Dequeued {
    /// Leased message, now Processing
    Message(Message),

    /// The row was leased but its payload could not be reconstructed
    Poison {
        id: MessageId,
        heartbeat: Option<DateTime<Utc>>,
        reason: String,
    },
}

impl Dequeued {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Message(m) => m.id,
            Self::Poison { id, .. } => *id,
        }
    }
}

/// Result of sending a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Stored as Waiting
    Sent(MessageId),

    /// An active message with the same job name already exists
    AlreadyQueued { existing: MessageId },
}

impl SendOutcome {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Sent(id) => *id,
            Self::AlreadyQueued { existing } => *existing,
        }
    }
}

/// Response from a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Lease renewed at this time
    Renewed(DateTime<Utc>),

    /// No row matched: the lease was reclaimed or finalized elsewhere.
    /// Work on the message must stop.
    LeaseLost,
}

/// A lease whose heartbeat went stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredLease {
    pub id: MessageId,
    pub heartbeat: DateTime<Utc>,
}

/// Failure details recorded when promoting a message to the error store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub error_type: String,
    pub message: String,
}

impl ErrorDetails {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// A message in the error store
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Id the message had while active
    pub id: MessageId,
    pub correlation_id: Uuid,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub priority: Option<u8>,
    pub route: Option<String>,
    pub job_name: Option<String>,
    pub error_type: String,
    pub last_error: String,

    /// Retry count for `error_type` at promotion time
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub error_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Rebuild a sendable message from this record
    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            body: self.body.clone(),
            headers: self.headers.clone(),
            correlation_id: Some(self.correlation_id),
            priority: self.priority,
            delay: None,
            expiration: None,
            route: self.route.clone(),
            job_name: self.job_name.clone(),
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// What a backend guarantees around finalization
///
/// Backends differ in how commit and rollback behave; consumers read these
/// flags instead of assuming uniform semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// The message is deleted when leased; `commit` is a no-op and a crash
    /// while processing loses the message.
    pub commit_on_dequeue: bool,

    /// A canceled in-flight message can be returned to Waiting.
    pub transactional_rollback: bool,
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self {
            commit_on_dequeue: false,
            transactional_rollback: true,
        }
    }
}

/// Storage backend contract for the lease protocol
///
/// Implementations must be thread-safe and support concurrent access from
/// many consumer loops. `dequeue` must be atomic: two concurrent calls never
/// return the same message.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    // =========================================================================
    // Producer Operations
    // =========================================================================

    /// Store a new message as Waiting
    async fn send(&self, message: NewMessage) -> Result<SendOutcome, StoreError>;

    /// Store several messages; backends with transactions store all or none
    async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<SendOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.send(message).await?);
        }
        Ok(outcomes)
    }

    // =========================================================================
    // Lease Operations
    // =========================================================================

    /// Select the best eligible Waiting message and flip it to Processing
    async fn dequeue(&self, filter: &DequeueFilter) -> Result<Option<Dequeued>, StoreError>;

    /// Renew the heartbeat of a message in `expected_status`
    async fn send_heartbeat(
        &self,
        id: MessageId,
        expected_status: MessageStatus,
    ) -> Result<HeartbeatResult, StoreError>;

    /// All Processing messages whose heartbeat is older than `dead_before`
    async fn find_expired_leases(
        &self,
        dead_before: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, StoreError>;

    /// Return a lease to Waiting if its heartbeat still equals `expected_heartbeat`
    ///
    /// Returns the number of rows reset (0 or 1). `delay` pushes the queue
    /// process time forward from now.
    async fn reset_lease(
        &self,
        id: MessageId,
        expected_heartbeat: DateTime<Utc>,
        delay: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Delete a processed message and its auxiliary rows
    async fn commit(&self, id: MessageId) -> Result<(), StoreError>;

    /// Return a message to Waiting after a failure
    ///
    /// When `expected_heartbeat` is given the rollback only applies if the
    /// heartbeat is unchanged. Returns rows affected (0 or 1).
    async fn rollback(
        &self,
        id: MessageId,
        expected_heartbeat: Option<DateTime<Utc>>,
        delay: Option<Duration>,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Error Bookkeeping
    // =========================================================================

    /// Increment the retry count for `(id, error_type)`, returning the new count
    async fn record_error(&self, id: MessageId, error_type: &str) -> Result<u32, StoreError>;

    /// Move a message to the error store and remove it from active rotation
    async fn move_to_error(&self, id: MessageId, details: &ErrorDetails)
        -> Result<(), StoreError>;

    /// List error store entries, newest first
    async fn list_errors(&self, pagination: Pagination) -> Result<Vec<ErrorRecord>, StoreError>;

    /// Put an errored message back into rotation with fresh error tracking
    ///
    /// Fails with [`StoreError::JobAlreadyQueued`], leaving the error record
    /// in place, when an active message already carries the same job name.
    async fn requeue_error(&self, id: MessageId) -> Result<MessageId, StoreError>;

    /// Delete error store entries older than `older_than`
    async fn purge_errors(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Inspection & Maintenance
    // =========================================================================

    /// Fetch an active message without leasing it
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Count messages; `Some(Error)` counts the error store, `None` counts all active
    async fn count(&self, status: Option<MessageStatus>) -> Result<u64, StoreError>;

    /// Delete Waiting messages whose expiration has passed
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Finalization guarantees of this backend
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting(id: i64) -> Message {
        Message {
            id: MessageId(id),
            correlation_id: Uuid::now_v7(),
            body: vec![],
            headers: Headers::new(),
            status: MessageStatus::Waiting,
            heartbeat: None,
            queue_process_time: Utc::now() - chrono::Duration::seconds(1),
            expiration_time: None,
            priority: None,
            route: None,
            job_name: None,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_sort_columns() {
        assert_eq!(
            DequeueOrder::default().sort_columns(),
            vec![
                "status",
                "priority",
                "queue_process_time",
                "expiration_time",
                "id"
            ]
        );

        let minimal = DequeueOrder {
            priority: false,
            delay: false,
            expiration: false,
        };
        assert_eq!(minimal.sort_columns(), vec!["status", "id"]);
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        let filter = DequeueFilter::new(now);

        assert!(filter.is_eligible(&waiting(1)));

        let mut delayed = waiting(2);
        delayed.queue_process_time = now + chrono::Duration::seconds(5);
        assert!(!filter.is_eligible(&delayed));

        let mut expired = waiting(3);
        expired.expiration_time = Some(now - chrono::Duration::seconds(1));
        assert!(!filter.is_eligible(&expired));

        let mut processing = waiting(4);
        processing.status = MessageStatus::Processing;
        assert!(!filter.is_eligible(&processing));
    }

    #[test]
    fn test_route_filter() {
        let filter = DequeueFilter::new(Utc::now()).with_route("images");

        let mut routed = waiting(1);
        routed.route = Some("images".to_string());
        assert!(filter.is_eligible(&routed));

        let mut other = waiting(2);
        other.route = Some("video".to_string());
        assert!(!filter.is_eligible(&other));

        assert!(!filter.is_eligible(&waiting(3)));
    }

    #[test]
    fn test_store_error_transient() {
        assert!(StoreError::Database("connection reset".into()).is_transient());
        assert!(!StoreError::MessageNotFound(MessageId(1)).is_transient());
    }
}
