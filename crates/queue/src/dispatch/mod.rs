//! Message dispatch
//!
//! This module provides:
//! - [`MessageContext`] - single-use finalizer for a leased message
//! - [`DispatchHandler`] - admits leased messages into the scheduler
//! - [`MessageHandler`] - user processing logic
//! - [`route_failure`] - retry or promote a failed message

mod context;
mod failure;
mod handler;

pub use context::{LeaseState, MessageContext};
pub use failure::{route_failure, FailureOutcome, PANIC_ERROR_TYPE, POISON_ERROR_TYPE};
pub use handler::{
    handler_fn, json_handler, DispatchHandler, Dispatched, FnHandler, HandlerContext,
    HandlerError, Interrupted, JsonHandler, MessageHandler,
};
