use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// A metadata write that failed once and is scheduled for its single retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRetry {
    pub session_id: u64,
    pub slot: u8,
    pub value: String,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Applied { session_id: u64, slot: u8 },
    /// The retry failed too; the value is lost.
    Dropped { session_id: u64, slot: u8, error: String },
}

/// Pending one-shot retries, ordered by scheduling time.
#[derive(Debug, Default)]
pub(crate) struct RetryQueue {
    pending: Mutex<Vec<MetadataRetry>>,
}

impl RetryQueue {
    pub(crate) fn schedule(&self, retry: MetadataRetry) {
        self.lock().push(retry);
    }

    /// Remove and return every retry due at `now`.
    pub(crate) fn take_due(&self, now: DateTime<Utc>) -> Vec<MetadataRetry> {
        let mut pending = self.lock();
        let (due, later): (Vec<_>, Vec<_>) = pending.drain(..).partition(|r| r.due_at <= now);
        *pending = later;
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MetadataRetry>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
