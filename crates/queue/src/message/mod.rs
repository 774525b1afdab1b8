//! Message model
//!
//! This module provides:
//! - [`NewMessage`] - what a producer sends
//! - [`Message`] - what a consumer leases
//! - [`MessageStatus`] - lifecycle status with stable integer codes

mod envelope;
mod status;

pub use envelope::{Headers, Message, MessageId, NewMessage, MAX_TIME_OFFSET};
pub(crate) use envelope::{offset_after, offset_before};
pub use status::MessageStatus;
