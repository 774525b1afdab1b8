//! Concurrency-controlled dispatch
//!
//! This module provides:
//! - [`TaskScheduler`] - global and per work-group admission with execution slots
//! - [`WorkGroup`] - named capacity partition
//! - [`TaskFactory`] - non-blocking admission returning rejected work to the caller
//!
//! # Capacity model
//!
//! ```text
//!            admitted (counted)                      running (permits)
//!  ┌───────────────────────────────────┐     ┌──────────────────────────┐
//!  │ global:  max_threads + queue size │ ──▶ │ max_threads slots        │
//!  │ group g: level(g) + queue size(g) │ ──▶ │ level(g) slots           │
//!  └───────────────────────────────────┘     └──────────────────────────┘
//! ```

mod task_factory;
mod task_scheduler;
mod work_group;

pub use task_factory::{Admission, TaskFactory};
pub use task_scheduler::{SchedulerConfig, SchedulerError, TaskHandle, TaskOutcome, TaskScheduler};
pub use work_group::{Room, WorkGroup};

pub(crate) use task_scheduler::panic_message;
