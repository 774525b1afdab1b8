//! In-memory implementation of LeaseStore for testing and single-process use

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::message::{offset_after, Message, MessageId, MessageStatus, NewMessage};

/// How the in-memory store treats a dequeued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseMode {
    /// Dequeue flips the row to Processing; commit deletes it. Same
    /// semantics as the PostgreSQL store.
    #[default]
    Tracked,

    /// Dequeue removes the message. Commit is a no-op, rollback cannot
    /// return the message, and a crash while processing loses it.
    RemoveOnDequeue,
}

struct Row {
    message: Message,

    /// Set when the payload cannot be reconstructed
    poison: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: BTreeMap<MessageId, Row>,

    /// Messages taken out under `LeaseMode::RemoveOnDequeue`, kept only so
    /// they can still be moved to the error store
    detached: HashMap<MessageId, Message>,
    error_tracking: HashMap<(MessageId, String), u32>,
    errors: BTreeMap<MessageId, ErrorRecord>,
}

impl Inner {
    fn insert(&mut self, message: NewMessage, now: DateTime<Utc>) -> SendOutcome {
        if let Some(job_name) = message.job_name.as_deref() {
            let existing = self.rows.values().find(|row| {
                row.message.status.is_active() && row.message.job_name.as_deref() == Some(job_name)
            });
            if let Some(row) = existing {
                return SendOutcome::AlreadyQueued {
                    existing: row.message.id,
                };
            }
        }

        self.next_id += 1;
        let id = MessageId(self.next_id);
        let stored = Message {
            id,
            correlation_id: message.correlation_id.unwrap_or_else(Uuid::now_v7),
            queue_process_time: message.queue_process_time(now),
            expiration_time: message.expiration_time(now),
            body: message.body,
            headers: message.headers,
            status: MessageStatus::Waiting,
            heartbeat: None,
            priority: message.priority,
            route: message.route,
            job_name: message.job_name,
            enqueued_at: now,
        };
        self.rows.insert(
            id,
            Row {
                message: stored,
                poison: None,
            },
        );
        SendOutcome::Sent(id)
    }

    fn clear_tracking(&mut self, id: MessageId) {
        self.error_tracking.retain(|(message_id, _), _| *message_id != id);
    }
}

/// Orders two candidate messages the way the PostgreSQL store's ORDER BY does
///
/// Missing priority and expiration sort last, matching `NULLS LAST` for
/// ascending order.
fn compare(order: &DequeueOrder, a: &Message, b: &Message) -> Ordering {
    fn nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    let mut ordering = a.status.code().cmp(&b.status.code());
    if order.priority {
        ordering = ordering.then_with(|| nulls_last(&a.priority, &b.priority));
    }
    if order.delay {
        ordering = ordering.then_with(|| a.queue_process_time.cmp(&b.queue_process_time));
    }
    if order.expiration {
        ordering = ordering.then_with(|| nulls_last(&a.expiration_time, &b.expiration_time));
    }
    ordering.then_with(|| a.id.cmp(&b.id))
}

/// Strictly increasing heartbeat so compare-and-swap on the old value
/// always observes a renewal
fn next_heartbeat(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

/// In-memory implementation of LeaseStore
///
/// All state lives behind one lock, so every operation is atomic with
/// respect to the others. Provides the same semantics as the PostgreSQL
/// implementation in [`LeaseMode::Tracked`].
///
/// # Example
///
/// ```
/// use durable_queue::InMemoryLeaseStore;
///
/// let store = InMemoryLeaseStore::new();
/// ```
pub struct InMemoryLeaseStore {
    inner: RwLock<Inner>,
    mode: LeaseMode,
}

impl InMemoryLeaseStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::with_mode(LeaseMode::Tracked)
    }

    pub fn with_mode(mode: LeaseMode) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            mode,
        }
    }

    pub fn mode(&self) -> LeaseMode {
        self.mode
    }

    /// Insert a Waiting row whose payload will fail to decode on dequeue
    pub fn insert_undecodable(&self, reason: impl Into<String>) -> MessageId {
        let mut inner = self.inner.write();
        let id = inner.insert(NewMessage::default(), Utc::now()).id();
        if let Some(row) = inner.rows.get_mut(&id) {
            row.poison = Some(reason.into());
        }
        id
    }

    /// Current retry count for `(id, error_type)`
    pub fn retry_count(&self, id: MessageId, error_type: &str) -> u32 {
        self.inner
            .read()
            .error_tracking
            .get(&(id, error_type.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of error tracking rows (for leak checks)
    pub fn tracking_len(&self) -> usize {
        self.inner.read().error_tracking.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn send(&self, message: NewMessage) -> Result<SendOutcome, StoreError> {
        Ok(self.inner.write().insert(message, Utc::now()))
    }

    async fn dequeue(&self, filter: &DequeueFilter) -> Result<Option<Dequeued>, StoreError> {
        let mut inner = self.inner.write();

        let best = inner
            .rows
            .values()
            .filter(|row| filter.is_eligible(&row.message))
            .min_by(|a, b| compare(&filter.order, &a.message, &b.message))
            .map(|row| row.message.id);

        let Some(id) = best else {
            return Ok(None);
        };

        let heartbeat = filter.track_heartbeat.then(|| next_heartbeat(None));

        match self.mode {
            LeaseMode::Tracked => {
                let Some(row) = inner.rows.get_mut(&id) else {
                    return Ok(None);
                };
                row.message.status = MessageStatus::Processing;
                row.message.heartbeat = heartbeat;

                Ok(Some(match &row.poison {
                    Some(reason) => Dequeued::Poison {
                        id,
                        heartbeat,
                        reason: reason.clone(),
                    },
                    None => Dequeued::Message(row.message.clone()),
                }))
            }
            LeaseMode::RemoveOnDequeue => {
                let Some(mut row) = inner.rows.remove(&id) else {
                    return Ok(None);
                };
                row.message.status = MessageStatus::Processing;
                row.message.heartbeat = heartbeat;
                inner.detached.insert(id, row.message.clone());

                Ok(Some(match row.poison {
                    Some(reason) => Dequeued::Poison {
                        id,
                        heartbeat,
                        reason,
                    },
                    None => Dequeued::Message(row.message),
                }))
            }
        }
    }

    async fn send_heartbeat(
        &self,
        id: MessageId,
        expected_status: MessageStatus,
    ) -> Result<HeartbeatResult, StoreError> {
        let mut inner = self.inner.write();

        if let Some(row) = inner.rows.get_mut(&id) {
            if row.message.status == expected_status {
                let renewed = next_heartbeat(row.message.heartbeat);
                row.message.heartbeat = Some(renewed);
                return Ok(HeartbeatResult::Renewed(renewed));
            }
            return Ok(HeartbeatResult::LeaseLost);
        }

        // Detached messages have no row to reclaim, so the lease is never lost
        if let Some(message) = inner.detached.get_mut(&id) {
            let renewed = next_heartbeat(message.heartbeat);
            message.heartbeat = Some(renewed);
            return Ok(HeartbeatResult::Renewed(renewed));
        }

        Ok(HeartbeatResult::LeaseLost)
    }

    async fn find_expired_leases(
        &self,
        dead_before: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .rows
            .values()
            .filter(|row| row.message.status == MessageStatus::Processing)
            .filter_map(|row| {
                row.message
                    .heartbeat
                    .filter(|hb| *hb < dead_before)
                    .map(|heartbeat| ExpiredLease {
                        id: row.message.id,
                        heartbeat,
                    })
            })
            .collect())
    }

    async fn reset_lease(
        &self,
        id: MessageId,
        expected_heartbeat: DateTime<Utc>,
        delay: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.rollback(id, Some(expected_heartbeat), delay).await
    }

    async fn commit(&self, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.clear_tracking(id);

        match self.mode {
            LeaseMode::Tracked => inner
                .rows
                .remove(&id)
                .map(|_| ())
                .ok_or(StoreError::MessageNotFound(id)),
            LeaseMode::RemoveOnDequeue => {
                inner.detached.remove(&id);
                Ok(())
            }
        }
    }

    async fn rollback(
        &self,
        id: MessageId,
        expected_heartbeat: Option<DateTime<Utc>>,
        delay: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();

        let Some(row) = inner.rows.get_mut(&id) else {
            // The message left the store at dequeue; nothing to return
            inner.detached.remove(&id);
            return Ok(0);
        };

        if row.message.status != MessageStatus::Processing {
            return Ok(0);
        }
        if let Some(expected) = expected_heartbeat {
            if row.message.heartbeat != Some(expected) {
                return Ok(0);
            }
        }

        row.message.status = MessageStatus::Waiting;
        row.message.heartbeat = None;
        if let Some(delay) = delay {
            row.message.queue_process_time = offset_after(Utc::now(), delay);
        }
        Ok(1)
    }

    async fn record_error(&self, id: MessageId, error_type: &str) -> Result<u32, StoreError> {
        let mut inner = self.inner.write();
        let count = inner
            .error_tracking
            .entry((id, error_type.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn move_to_error(
        &self,
        id: MessageId,
        details: &ErrorDetails,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let message = match inner.rows.remove(&id) {
            Some(row) => row.message,
            None => inner
                .detached
                .remove(&id)
                .ok_or(StoreError::MessageNotFound(id))?,
        };

        let retry_count = inner
            .error_tracking
            .get(&(id, details.error_type.clone()))
            .copied()
            .unwrap_or(0);
        inner.clear_tracking(id);

        inner.errors.insert(
            id,
            ErrorRecord {
                id,
                correlation_id: message.correlation_id,
                body: message.body,
                headers: message.headers,
                priority: message.priority,
                route: message.route,
                job_name: message.job_name,
                error_type: details.error_type.clone(),
                last_error: details.message.clone(),
                retry_count,
                enqueued_at: message.enqueued_at,
                error_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_errors(&self, pagination: Pagination) -> Result<Vec<ErrorRecord>, StoreError> {
        let inner = self.inner.read();
        let mut records: Vec<ErrorRecord> = inner.errors.values().cloned().collect();
        records.sort_by(|a, b| b.error_at.cmp(&a.error_at).then_with(|| b.id.cmp(&a.id)));

        Ok(records
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn requeue_error(&self, id: MessageId) -> Result<MessageId, StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .errors
            .remove(&id)
            .ok_or(StoreError::ErrorRecordNotFound(id))?;

        match inner.insert(record.to_new_message(), Utc::now()) {
            SendOutcome::Sent(new_id) => Ok(new_id),
            SendOutcome::AlreadyQueued { existing } => {
                inner.errors.insert(id, record);
                Err(StoreError::JobAlreadyQueued { id, existing })
            }
        }
    }

    async fn purge_errors(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.errors.len();
        inner.errors.retain(|_, record| record.error_at >= older_than);
        Ok((before - inner.errors.len()) as u64)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .rows
            .get(&id)
            .map(|row| row.message.clone())
            .or_else(|| inner.detached.get(&id).cloned()))
    }

    async fn count(&self, status: Option<MessageStatus>) -> Result<u64, StoreError> {
        let inner = self.inner.read();
        let count = match status {
            None => inner.rows.len() + inner.detached.len(),
            Some(MessageStatus::Error) => inner.errors.len(),
            Some(MessageStatus::Processing) => {
                inner
                    .rows
                    .values()
                    .filter(|row| row.message.status == MessageStatus::Processing)
                    .count()
                    + inner.detached.len()
            }
            Some(status) => inner
                .rows
                .values()
                .filter(|row| row.message.status == status)
                .count(),
        };
        Ok(count as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let expired: Vec<MessageId> = inner
            .rows
            .values()
            .filter(|row| {
                row.message.status == MessageStatus::Waiting && row.message.is_expired(now)
            })
            .map(|row| row.message.id)
            .collect();

        for id in &expired {
            inner.rows.remove(id);
            inner.clear_tracking(*id);
        }
        Ok(expired.len() as u64)
    }

    fn capabilities(&self) -> StoreCapabilities {
        match self.mode {
            LeaseMode::Tracked => StoreCapabilities::default(),
            LeaseMode::RemoveOnDequeue => StoreCapabilities {
                commit_on_dequeue: true,
                transactional_rollback: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> DequeueFilter {
        DequeueFilter::new(Utc::now())
    }

    async fn dequeue_message(store: &InMemoryLeaseStore) -> Message {
        match store.dequeue(&filter()).await.unwrap() {
            Some(Dequeued::Message(m)) => m,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_and_dequeue() {
        let store = InMemoryLeaseStore::new();
        let id = store.send(NewMessage::new(b"hello".to_vec())).await.unwrap().id();

        let message = dequeue_message(&store).await;
        assert_eq!(message.id, id);
        assert_eq!(message.body, b"hello");
        assert_eq!(message.status, MessageStatus::Processing);
        assert!(message.heartbeat.is_some());

        assert!(store.dequeue(&filter()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let store = InMemoryLeaseStore::new();
        let low = store
            .send(NewMessage::new(vec![]).with_priority(5))
            .await
            .unwrap()
            .id();
        let first_unprioritized = store.send(NewMessage::new(vec![])).await.unwrap().id();
        let high = store
            .send(NewMessage::new(vec![]).with_priority(1))
            .await
            .unwrap()
            .id();

        assert_eq!(dequeue_message(&store).await.id, high);
        assert_eq!(dequeue_message(&store).await.id, low);
        assert_eq!(dequeue_message(&store).await.id, first_unprioritized);
    }

    #[tokio::test]
    async fn test_delayed_message_not_eligible() {
        let store = InMemoryLeaseStore::new();
        store
            .send(NewMessage::new(vec![]).with_delay(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(store.dequeue(&filter()).await.unwrap().is_none());

        let later = DequeueFilter::new(Utc::now() + chrono::Duration::seconds(61));
        assert!(store.dequeue(&later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_job_name_dedup() {
        let store = InMemoryLeaseStore::new();
        let first = store
            .send(NewMessage::new(vec![]).with_job_name("nightly"))
            .await
            .unwrap();
        let second = store
            .send(NewMessage::new(vec![]).with_job_name("nightly"))
            .await
            .unwrap();

        assert!(matches!(first, SendOutcome::Sent(_)));
        assert_eq!(
            second,
            SendOutcome::AlreadyQueued {
                existing: first.id()
            }
        );

        let message = dequeue_message(&store).await;
        store.commit(message.id).await.unwrap();

        let third = store
            .send(NewMessage::new(vec![]).with_job_name("nightly"))
            .await
            .unwrap();
        assert!(matches!(third, SendOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_is_strictly_increasing() {
        let store = InMemoryLeaseStore::new();
        store.send(NewMessage::new(vec![])).await.unwrap();
        let message = dequeue_message(&store).await;

        let HeartbeatResult::Renewed(first) = store
            .send_heartbeat(message.id, MessageStatus::Processing)
            .await
            .unwrap()
        else {
            panic!("expected renewal");
        };
        let HeartbeatResult::Renewed(second) = store
            .send_heartbeat(message.id, MessageStatus::Processing)
            .await
            .unwrap()
        else {
            panic!("expected renewal");
        };

        assert!(first > message.heartbeat.unwrap());
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_heartbeat_after_commit_is_lease_lost() {
        let store = InMemoryLeaseStore::new();
        store.send(NewMessage::new(vec![])).await.unwrap();
        let message = dequeue_message(&store).await;
        store.commit(message.id).await.unwrap();

        assert_eq!(
            store
                .send_heartbeat(message.id, MessageStatus::Processing)
                .await
                .unwrap(),
            HeartbeatResult::LeaseLost
        );
    }

    #[tokio::test]
    async fn test_reset_lease_compare_and_swap() {
        let store = InMemoryLeaseStore::new();
        store.send(NewMessage::new(vec![])).await.unwrap();
        let message = dequeue_message(&store).await;
        let stale = message.heartbeat.unwrap();

        // Renewal invalidates the observed heartbeat
        store
            .send_heartbeat(message.id, MessageStatus::Processing)
            .await
            .unwrap();
        assert_eq!(store.reset_lease(message.id, stale, None).await.unwrap(), 0);

        let expired = store
            .find_expired_leases(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);

        assert_eq!(
            store
                .reset_lease(message.id, expired[0].heartbeat, None)
                .await
                .unwrap(),
            1
        );
        // Idempotent
        assert_eq!(
            store
                .reset_lease(message.id, expired[0].heartbeat, None)
                .await
                .unwrap(),
            0
        );

        let reset = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(reset.status, MessageStatus::Waiting);
        assert_eq!(reset.heartbeat, None);
    }

    #[tokio::test]
    async fn test_rollback_with_delay() {
        let store = InMemoryLeaseStore::new();
        store.send(NewMessage::new(vec![])).await.unwrap();
        let message = dequeue_message(&store).await;

        let affected = store
            .rollback(message.id, None, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(affected, 1);

        assert!(store.dequeue(&filter()).await.unwrap().is_none());
        let rolled_back = store.get_message(message.id).await.unwrap().unwrap();
        assert!(rolled_back.queue_process_time > Utc::now() + chrono::Duration::seconds(25));
    }

    #[tokio::test]
    async fn test_record_and_move_to_error() {
        let store = InMemoryLeaseStore::new();
        store
            .send(NewMessage::new(b"bad".to_vec()).with_route("r"))
            .await
            .unwrap();
        let message = dequeue_message(&store).await;

        assert_eq!(store.record_error(message.id, "Timeout").await.unwrap(), 1);
        assert_eq!(store.record_error(message.id, "Timeout").await.unwrap(), 2);
        assert_eq!(store.record_error(message.id, "Io").await.unwrap(), 1);

        store
            .move_to_error(message.id, &ErrorDetails::new("Timeout", "took too long"))
            .await
            .unwrap();

        assert!(store.get_message(message.id).await.unwrap().is_none());
        assert_eq!(store.tracking_len(), 0);
        assert_eq!(store.count(Some(MessageStatus::Error)).await.unwrap(), 1);

        let errors = store.list_errors(Pagination::default()).await.unwrap();
        assert_eq!(errors[0].retry_count, 2);
        assert_eq!(errors[0].body, b"bad");
        assert_eq!(errors[0].route.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn test_requeue_and_purge_errors() {
        let store = InMemoryLeaseStore::new();
        store.send(NewMessage::new(b"x".to_vec())).await.unwrap();
        let message = dequeue_message(&store).await;
        store
            .move_to_error(message.id, &ErrorDetails::new("E", "boom"))
            .await
            .unwrap();

        let new_id = store.requeue_error(message.id).await.unwrap();
        assert_ne!(new_id, message.id);
        assert_eq!(store.count(Some(MessageStatus::Error)).await.unwrap(), 0);
        assert_eq!(dequeue_message(&store).await.body, b"x");

        assert!(matches!(
            store.requeue_error(message.id).await,
            Err(StoreError::ErrorRecordNotFound(_))
        ));

        store
            .move_to_error(new_id, &ErrorDetails::new("E", "boom again"))
            .await
            .unwrap();
        let purged = store
            .purge_errors(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_requeue_blocked_by_active_job_keeps_error_record() {
        let store = InMemoryLeaseStore::new();
        store
            .send(NewMessage::new(b"old".to_vec()).with_job_name("report"))
            .await
            .unwrap();
        let failed = dequeue_message(&store).await;
        store
            .move_to_error(failed.id, &ErrorDetails::new("E", "boom"))
            .await
            .unwrap();

        let live = store
            .send(NewMessage::new(b"new".to_vec()).with_job_name("report"))
            .await
            .unwrap()
            .id();

        match store.requeue_error(failed.id).await {
            Err(StoreError::JobAlreadyQueued { id, existing }) => {
                assert_eq!(id, failed.id);
                assert_eq!(existing, live);
            }
            other => panic!("expected JobAlreadyQueued, got {other:?}"),
        }
        let errors = store.list_errors(Pagination::default()).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].body, b"old");
        assert_eq!(store.count(None).await.unwrap(), 1);

        // Once the live job is done the record can be requeued
        let leased = dequeue_message(&store).await;
        store.commit(leased.id).await.unwrap();
        let requeued = store.requeue_error(failed.id).await.unwrap();
        assert_eq!(dequeue_message(&store).await.id, requeued);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = InMemoryLeaseStore::new();
        store
            .send(NewMessage::new(vec![]).with_expiration(Duration::from_secs(5)))
            .await
            .unwrap();
        store.send(NewMessage::new(vec![])).await.unwrap();

        let deleted = store
            .delete_expired(Utc::now() + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_row_is_poison() {
        let store = InMemoryLeaseStore::new();
        let id = store.insert_undecodable("truncated body");

        match store.dequeue(&filter()).await.unwrap() {
            Some(Dequeued::Poison {
                id: poison_id,
                reason,
                ..
            }) => {
                assert_eq!(poison_id, id);
                assert_eq!(reason, "truncated body");
            }
            other => panic!("expected poison, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_on_dequeue_mode() {
        let store = InMemoryLeaseStore::with_mode(LeaseMode::RemoveOnDequeue);
        assert!(store.capabilities().commit_on_dequeue);
        assert!(!store.capabilities().transactional_rollback);

        store.send(NewMessage::new(vec![])).await.unwrap();
        let message = dequeue_message(&store).await;

        // Rollback cannot return the message
        assert_eq!(store.rollback(message.id, None, None).await.unwrap(), 0);
        assert_eq!(store.count(None).await.unwrap(), 0);
        assert!(store.dequeue(&filter()).await.unwrap().is_none());
        store.commit(message.id).await.unwrap();
    }
}
