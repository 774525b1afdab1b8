//! Reliability patterns for message processing
//!
//! This module provides:
//! - [`RetryPolicy`] - retry limit and exponential backoff for one error type
//! - [`ErrorPolicy`] - retry policies keyed by error type
//! - [`BackoffLadder`] - stepped delays for repeated receive failures

mod backoff;
mod retry;

pub use backoff::BackoffLadder;
pub use retry::{ErrorPolicy, RetryPolicy};
