//! Queue consumer and its background loops
//!
//! This module provides:
//! - [`QueueConsumer`] - receive loop with bounded dispatch and graceful shutdown
//! - [`HeartbeatSender`] - renews the leases this consumer holds
//! - [`Sweeper`] - reclaims leases whose owner stopped renewing
//! - [`PollerConfig`] - receive polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        QueueConsumer                          │
//! │  ┌───────────────┐  ┌────────────────┐  ┌─────────────────┐  │
//! │  │ Receive loop  │  │ HeartbeatSender│  │    Sweeper      │  │
//! │  │ (MessagePoller│  │ (interval, 5s) │  │ (reclaim 30s,   │  │
//! │  │  + backoff)   │  │                │  │  expire 60s)    │  │
//! │  └──────┬────────┘  └───────┬────────┘  └─────────────────┘  │
//! │         │ lease             │ renew                          │
//! │         ▼                   ▼                                │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │ LeaseRegistry (message id -> lease state)            │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │ DispatchHandler -> TaskFactory -> TaskScheduler      │    │
//! │  │ [msg 1] [msg 2] ... commit / retry / error store     │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod consumer;
mod heartbeat;
mod poller;
mod sweeper;

pub use consumer::{ConsumerStatus, ProcessOutcome, QueueConsumer, ReceiveOutcome};
pub use heartbeat::{HeartbeatSender, LeaseRegistration, LeaseRegistry};
pub use poller::{MessagePoller, PollerConfig};
pub use sweeper::Sweeper;
