//! Message status codes

use serde::{Deserialize, Serialize};

/// Lifecycle status of a message
///
/// The integer codes are stable across backends and are what the PostgreSQL
/// store persists in its `status` column.
///
/// ```text
/// Waiting --dequeue--> Processing --commit--> Processed
///    ^                     |
///    +--rollback/reclaim---+--retries exhausted--> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Not (yet) handed to a queue
    NotQueued,

    /// Eligible for dequeue once its process time has passed
    Waiting,

    /// Leased by a consumer
    Processing,

    /// Committed; the message no longer exists in the active tables
    Processed,

    /// Retries exhausted; moved to the error store
    Error,
}

impl MessageStatus {
    /// Stable integer code
    pub fn code(self) -> i16 {
        match self {
            Self::NotQueued => -1,
            Self::Waiting => 0,
            Self::Processing => 1,
            Self::Processed => 2,
            Self::Error => 3,
        }
    }

    /// Parse a stable integer code
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            -1 => Some(Self::NotQueued),
            0 => Some(Self::Waiting),
            1 => Some(Self::Processing),
            2 => Some(Self::Processed),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Error)
    }

    /// Whether the message still occupies the active tables
    pub fn is_active(self) -> bool {
        matches!(self, Self::Waiting | Self::Processing)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotQueued => write!(f, "not_queued"),
            Self::Waiting => write!(f, "waiting"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Error => write!(f, "error"),
        }
    }
}
