//! PostgreSQL implementation of LeaseStore
//!
//! Production persistence using PostgreSQL with:
//! - Atomic single-message dequeue with `FOR UPDATE SKIP LOCKED`
//! - Compare-and-swap lease reclaim on the heartbeat column
//! - Transactional commit and promotion to the error store

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::message::{offset_after, Headers, Message, MessageId, MessageStatus, NewMessage};

const MESSAGE_COLUMNS: &str = "id, correlation_id, body, headers, status, heartbeat, \
     queue_process_time, expiration_time, priority, route, job_name, enqueued_at";

const ERROR_COLUMNS: &str = "id, correlation_id, body, headers, priority, route, job_name, \
     error_type, last_error, retry_count, enqueued_at, error_at";

/// Attempts for an insert that races a concurrent commit of the same job name
const SEND_ATTEMPTS: usize = 3;

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!(operation, "database error: {}", e);
        StoreError::Database(e.to_string())
    }
}

/// Rebuild a message from a row, or the reason it cannot be rebuilt
fn decode_message(row: &PgRow) -> Result<Message, String> {
    let headers: serde_json::Value = row.try_get("headers").map_err(|e| e.to_string())?;
    let headers: Headers =
        serde_json::from_value(headers).map_err(|e| format!("invalid headers: {e}"))?;

    let code: i16 = row.try_get("status").map_err(|e| e.to_string())?;
    let status =
        MessageStatus::from_code(code).ok_or_else(|| format!("unknown status code {code}"))?;

    let priority = row
        .try_get::<Option<i16>, _>("priority")
        .map_err(|e| e.to_string())?
        .map(|p| u8::try_from(p).map_err(|_| format!("priority out of range: {p}")))
        .transpose()?;

    Ok(Message {
        id: MessageId(row.try_get("id").map_err(|e| e.to_string())?),
        correlation_id: row.try_get("correlation_id").map_err(|e| e.to_string())?,
        body: row.try_get("body").map_err(|e| e.to_string())?,
        headers,
        status,
        heartbeat: row.try_get("heartbeat").map_err(|e| e.to_string())?,
        queue_process_time: row
            .try_get("queue_process_time")
            .map_err(|e| e.to_string())?,
        expiration_time: row.try_get("expiration_time").map_err(|e| e.to_string())?,
        priority,
        route: row.try_get("route").map_err(|e| e.to_string())?,
        job_name: row.try_get("job_name").map_err(|e| e.to_string())?,
        enqueued_at: row.try_get("enqueued_at").map_err(|e| e.to_string())?,
    })
}

fn decode_error_record(row: &PgRow) -> Result<ErrorRecord, StoreError> {
    let headers: serde_json::Value = row.get("headers");
    let headers: Headers =
        serde_json::from_value(headers).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(ErrorRecord {
        id: MessageId(row.get("id")),
        correlation_id: row.get("correlation_id"),
        body: row.get("body"),
        headers,
        priority: row
            .get::<Option<i16>, _>("priority")
            .and_then(|p| u8::try_from(p).ok()),
        route: row.get("route"),
        job_name: row.get("job_name"),
        error_type: row.get("error_type"),
        last_error: row.get("last_error"),
        retry_count: row.get::<i32, _>("retry_count").max(0) as u32,
        enqueued_at: row.get("enqueued_at"),
        error_at: row.get("error_at"),
    })
}

async fn insert_message(
    conn: &mut PgConnection,
    queue_name: &str,
    message: &NewMessage,
) -> Result<SendOutcome, sqlx::Error> {
    let now = Utc::now();
    let correlation_id = message.correlation_id.unwrap_or_else(Uuid::now_v7);

    for _ in 0..SEND_ATTEMPTS {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO dq_messages
                (queue_name, correlation_id, body, headers, status, queue_process_time,
                 expiration_time, priority, route, job_name, enqueued_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (queue_name, job_name) WHERE job_name IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(queue_name)
        .bind(correlation_id)
        .bind(&message.body)
        .bind(Json(&message.headers))
        .bind(message.queue_process_time(now))
        .bind(message.expiration_time(now))
        .bind(message.priority.map(i16::from))
        .bind(&message.route)
        .bind(&message.job_name)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(id) = inserted {
            return Ok(SendOutcome::Sent(MessageId(id)));
        }

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM dq_messages WHERE queue_name = $1 AND job_name = $2",
        )
        .bind(queue_name)
        .bind(&message.job_name)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(id) = existing {
            return Ok(SendOutcome::AlreadyQueued {
                existing: MessageId(id),
            });
        }
        // The conflicting message was finalized between the two statements
    }

    Err(sqlx::Error::Protocol(format!(
        "job name insert kept conflicting after {SEND_ATTEMPTS} attempts"
    )))
}

/// PostgreSQL implementation of LeaseStore
///
/// Several named queues share the same tables, partitioned by `queue_name`.
///
/// # Example
///
/// ```ignore
/// use durable_queue::PostgresLeaseStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresLeaseStore::new(pool, "thumbnails");
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
    queue_name: String,
}

impl PostgresLeaseStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Apply the queue schema
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self, message), fields(queue = %self.queue_name))]
    async fn send(&self, message: NewMessage) -> Result<SendOutcome, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_error("send"))?;
        let outcome = insert_message(&mut conn, &self.queue_name, &message)
            .await
            .map_err(db_error("send"))?;

        if let SendOutcome::AlreadyQueued { existing } = outcome {
            debug!(%existing, job_name = ?message.job_name, "job already queued");
        }
        Ok(outcome)
    }

    #[instrument(skip(self, messages), fields(queue = %self.queue_name, count = messages.len()))]
    async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<SendOutcome>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("send_batch"))?;
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in &messages {
            let outcome = insert_message(&mut tx, &self.queue_name, message)
                .await
                .map_err(db_error("send_batch"))?;
            outcomes.push(outcome);
        }
        tx.commit().await.map_err(db_error("send_batch"))?;
        Ok(outcomes)
    }

    #[instrument(skip(self, filter), fields(queue = %self.queue_name))]
    async fn dequeue(&self, filter: &DequeueFilter) -> Result<Option<Dequeued>, StoreError> {
        // Sort columns are static identifiers, never user input
        let order_by = filter.order.sort_columns().join(", ");
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                FROM dq_messages
                WHERE queue_name = $1
                  AND status = 0
                  AND queue_process_time <= $2
                  AND (expiration_time IS NULL OR expiration_time > $2)
                  AND ($3::text IS NULL OR route = $3)
                ORDER BY {order_by}
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dq_messages m
            SET status = 1,
                heartbeat = CASE WHEN $4 THEN $5::timestamptz ELSE NULL END
            FROM next
            WHERE m.id = next.id
            RETURNING m.id, m.correlation_id, m.body, m.headers, m.status, m.heartbeat,
                      m.queue_process_time, m.expiration_time, m.priority, m.route,
                      m.job_name, m.enqueued_at
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(filter.now)
            .bind(&filter.route)
            .bind(filter.track_heartbeat)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("dequeue"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        match decode_message(&row) {
            Ok(message) => {
                debug!(message_id = %message.id, "leased message");
                Ok(Some(Dequeued::Message(message)))
            }
            Err(reason) => {
                let id = MessageId(row.get("id"));
                let heartbeat: Option<DateTime<Utc>> = row.try_get("heartbeat").ok().flatten();
                warn!(message_id = %id, %reason, "leased message cannot be decoded");
                Ok(Some(Dequeued::Poison {
                    id,
                    heartbeat,
                    reason,
                }))
            }
        }
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn send_heartbeat(
        &self,
        id: MessageId,
        expected_status: MessageStatus,
    ) -> Result<HeartbeatResult, StoreError> {
        // Strictly increasing so a reclaim holding the previous value fails its CAS
        let renewed: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE dq_messages
            SET heartbeat = GREATEST($4, heartbeat + INTERVAL '1 microsecond')
            WHERE queue_name = $1 AND id = $2 AND status = $3
            RETURNING heartbeat
            "#,
        )
        .bind(&self.queue_name)
        .bind(id.as_i64())
        .bind(expected_status.code())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("send_heartbeat"))?;

        Ok(match renewed {
            Some(ts) => HeartbeatResult::Renewed(ts),
            None => HeartbeatResult::LeaseLost,
        })
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn find_expired_leases(
        &self,
        dead_before: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, heartbeat
            FROM dq_messages
            WHERE queue_name = $1 AND status = 1 AND heartbeat < $2
            ORDER BY heartbeat
            "#,
        )
        .bind(&self.queue_name)
        .bind(dead_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("find_expired_leases"))?;

        Ok(rows
            .iter()
            .map(|row| ExpiredLease {
                id: MessageId(row.get("id")),
                heartbeat: row.get("heartbeat"),
            })
            .collect())
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn reset_lease(
        &self,
        id: MessageId,
        expected_heartbeat: DateTime<Utc>,
        delay: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.rollback(id, Some(expected_heartbeat), delay).await
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn commit(&self, id: MessageId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("commit"))?;

        sqlx::query("DELETE FROM dq_error_tracking WHERE message_id = $1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(db_error("commit"))?;

        let deleted = sqlx::query("DELETE FROM dq_messages WHERE queue_name = $1 AND id = $2")
            .bind(&self.queue_name)
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(db_error("commit"))?
            .rows_affected();

        tx.commit().await.map_err(db_error("commit"))?;

        if deleted == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn rollback(
        &self,
        id: MessageId,
        expected_heartbeat: Option<DateTime<Utc>>,
        delay: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let process_at = delay.map(|d| offset_after(Utc::now(), d));

        let affected = sqlx::query(
            r#"
            UPDATE dq_messages
            SET status = 0,
                heartbeat = NULL,
                queue_process_time = COALESCE($4, queue_process_time)
            WHERE queue_name = $1
              AND id = $2
              AND status = 1
              AND ($3::timestamptz IS NULL OR heartbeat = $3)
            "#,
        )
        .bind(&self.queue_name)
        .bind(id.as_i64())
        .bind(expected_heartbeat)
        .bind(process_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("rollback"))?
        .rows_affected();

        Ok(affected)
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn record_error(&self, id: MessageId, error_type: &str) -> Result<u32, StoreError> {
        let count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO dq_error_tracking (message_id, error_type, retry_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (message_id, error_type)
            DO UPDATE SET retry_count = dq_error_tracking.retry_count + 1
            RETURNING retry_count
            "#,
        )
        .bind(id.as_i64())
        .bind(error_type)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("record_error"))?;

        Ok(count.max(0) as u32)
    }

    #[instrument(skip(self, details), fields(queue = %self.queue_name))]
    async fn move_to_error(
        &self,
        id: MessageId,
        details: &ErrorDetails,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("move_to_error"))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO dq_errors
                (id, queue_name, correlation_id, body, headers, priority, route, job_name,
                 error_type, last_error, retry_count, enqueued_at, error_at)
            SELECT m.id, m.queue_name, m.correlation_id, m.body, m.headers, m.priority,
                   m.route, m.job_name, $3, $4, COALESCE(t.retry_count, 0), m.enqueued_at, NOW()
            FROM dq_messages m
            LEFT JOIN dq_error_tracking t ON t.message_id = m.id AND t.error_type = $3
            WHERE m.queue_name = $1 AND m.id = $2
            ON CONFLICT (id) DO UPDATE
            SET error_type = EXCLUDED.error_type,
                last_error = EXCLUDED.last_error,
                retry_count = EXCLUDED.retry_count,
                error_at = EXCLUDED.error_at
            "#,
        )
        .bind(&self.queue_name)
        .bind(id.as_i64())
        .bind(&details.error_type)
        .bind(&details.message)
        .execute(&mut *tx)
        .await
        .map_err(db_error("move_to_error"))?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::MessageNotFound(id));
        }

        sqlx::query("DELETE FROM dq_error_tracking WHERE message_id = $1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(db_error("move_to_error"))?;

        sqlx::query("DELETE FROM dq_messages WHERE queue_name = $1 AND id = $2")
            .bind(&self.queue_name)
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(db_error("move_to_error"))?;

        tx.commit().await.map_err(db_error("move_to_error"))?;

        debug!(message_id = %id, error_type = %details.error_type, "moved message to error store");
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn list_errors(&self, pagination: Pagination) -> Result<Vec<ErrorRecord>, StoreError> {
        let sql = format!(
            "SELECT {ERROR_COLUMNS} FROM dq_errors WHERE queue_name = $1 \
             ORDER BY error_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_errors"))?;

        rows.iter().map(decode_error_record).collect()
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn requeue_error(&self, id: MessageId) -> Result<MessageId, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("requeue_error"))?;

        let sql = format!(
            "DELETE FROM dq_errors WHERE queue_name = $1 AND id = $2 RETURNING {ERROR_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(id.as_i64())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("requeue_error"))?
            .ok_or(StoreError::ErrorRecordNotFound(id))?;

        let record = decode_error_record(&row)?;
        let outcome = insert_message(&mut tx, &self.queue_name, &record.to_new_message())
            .await
            .map_err(db_error("requeue_error"))?;

        let new_id = match outcome {
            SendOutcome::Sent(new_id) => new_id,
            SendOutcome::AlreadyQueued { existing } => {
                // Rolling back restores the error record
                tx.rollback().await.map_err(db_error("requeue_error"))?;
                warn!(message_id = %id, %existing, "requeue blocked by an active job");
                return Err(StoreError::JobAlreadyQueued { id, existing });
            }
        };

        tx.commit().await.map_err(db_error("requeue_error"))?;

        debug!(message_id = %id, %new_id, "requeued errored message");
        Ok(new_id)
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn purge_errors(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let purged = sqlx::query("DELETE FROM dq_errors WHERE queue_name = $1 AND error_at < $2")
            .bind(&self.queue_name)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(db_error("purge_errors"))?
            .rows_affected();

        Ok(purged)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let sql =
            format!("SELECT {MESSAGE_COLUMNS} FROM dq_messages WHERE queue_name = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_message"))?;

        row.map(|row| decode_message(&row).map_err(StoreError::Serialization))
            .transpose()
    }

    async fn count(&self, status: Option<MessageStatus>) -> Result<u64, StoreError> {
        let query = match status {
            None => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM dq_messages WHERE queue_name = $1",
            )
            .bind(&self.queue_name),
            Some(MessageStatus::Error) => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM dq_errors WHERE queue_name = $1",
            )
            .bind(&self.queue_name),
            Some(status) => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM dq_messages WHERE queue_name = $1 AND status = $2",
            )
            .bind(&self.queue_name)
            .bind(status.code()),
        };

        let count = query
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("count"))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM dq_messages
            WHERE queue_name = $1
              AND status = 0
              AND expiration_time IS NOT NULL
              AND expiration_time <= $2
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("delete_expired"))?
        .rows_affected();

        if deleted > 0 {
            debug!(deleted, "deleted expired messages");
        }
        Ok(deleted)
    }
}
