//! Clock and identity sources for recording devices.
//!
//! Sequence numbers are persisted by the store that owns them, see
//! [`crate::ports::SequenceSource`].

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Wall clock used for display timestamps and retry scheduling. Never used
/// to order transactions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Client-generated transaction identifier (random v4 UUID).
pub fn new_transaction_id() -> Uuid {
    Uuid::new_v4()
}
