//! Persistence layer for the lease protocol
//!
//! This module provides:
//! - [`LeaseStore`] trait: atomic dequeue, heartbeat, reclaim, commit and error bookkeeping
//! - [`InMemoryLeaseStore`] for testing and single-process queues
//! - [`PostgresLeaseStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryLeaseStore, LeaseMode};
pub use postgres::PostgresLeaseStore;
pub use store::{
    DequeueFilter, DequeueOrder, Dequeued, ErrorDetails, ErrorRecord, ExpiredLease,
    HeartbeatResult, LeaseStore, Pagination, SendOutcome, StoreCapabilities, StoreError,
};
