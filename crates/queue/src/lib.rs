//! # Durable Work Queue
//!
//! A lease-based work queue: producers enqueue messages, consumers lease,
//! execute and acknowledge them, and messages held by a consumer that died
//! are reclaimed automatically.
//!
//! ## Features
//!
//! - **Pluggable storage**: PostgreSQL and in-memory backends behind one [`LeaseStore`] contract
//! - **Lease heartbeats**: in-flight leases are renewed; abandoned ones are reset by the sweeper
//! - **Bounded dispatch**: global and per work-group capacity with a free-capacity signal
//! - **Retry bookkeeping**: per-error-type retry counts, backoff, and an error store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                QueueProducer / QueueConsumer                 │
//! │  (send, receive loop, heartbeat sender, sweeper)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            DispatchHandler -> TaskScheduler                  │
//! │  (admission per scope, execution slots, drain on dispose)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LeaseStore                             │
//! │  (PostgreSQL: dq_messages, dq_error_tracking, dq_errors)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use durable_queue::prelude::*;
//!
//! #[derive(serde::Deserialize)]
//! struct Resize {
//!     image_id: u64,
//! }
//!
//! # async fn run(pool: sqlx::PgPool) -> Result<(), QueueError> {
//! let store = PostgresLeaseStore::new(pool, "thumbnails");
//! store.migrate().await?;
//! let store: Arc<dyn LeaseStore> = Arc::new(store);
//!
//! let producer = QueueProducer::new(store.clone());
//! producer.send_json(&serde_json::json!({"image_id": 42})).await?;
//!
//! let consumer = QueueConsumer::new(
//!     store,
//!     QueueConfig::from_env()?,
//!     json_handler(|_ctx, job: Resize| async move {
//!         println!("resizing {}", job.image_id);
//!         Ok(())
//!     }),
//! )?;
//! consumer.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod persistence;
pub mod producer;
pub mod reliability;
pub mod scheduler;
pub mod worker;

pub use config::QueueConfig;
pub use error::QueueError;
pub use message::{Message, MessageId, MessageStatus, NewMessage};
pub use persistence::{InMemoryLeaseStore, LeaseStore, PostgresLeaseStore};
pub use producer::QueueProducer;
pub use reliability::{BackoffLadder, ErrorPolicy, RetryPolicy};
pub use worker::QueueConsumer;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{
        DequeueOptions, ExpirationConfig, HeartbeatConfig, QueueConfig, WorkGroupConfig,
    };
    pub use crate::dispatch::{
        handler_fn, json_handler, HandlerContext, HandlerError, MessageContext, MessageHandler,
    };
    pub use crate::error::{ConsumerError, QueueError, ReceiveError, SendError};
    pub use crate::message::{Headers, Message, MessageId, MessageStatus, NewMessage};
    pub use crate::persistence::{
        InMemoryLeaseStore, LeaseMode, LeaseStore, PostgresLeaseStore, SendOutcome, StoreError,
    };
    pub use crate::producer::QueueProducer;
    pub use crate::reliability::{BackoffLadder, ErrorPolicy, RetryPolicy};
    pub use crate::scheduler::{SchedulerConfig, TaskScheduler, WorkGroup};
    pub use crate::worker::{
        ConsumerStatus, PollerConfig, ProcessOutcome, QueueConsumer, ReceiveOutcome,
    };
}
