use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Active,
    /// Timed out; finalization was attempted and has not committed yet.
    PendingEnd,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    /// Latest tracker timestamp seen for the session
    last_timestamp: u64,
    /// Latest wall-clock observation, epoch milliseconds
    observed_at: i64,
    /// Bumped on every update; lets a scan detect updates that raced it
    generation: u64,
    state: ActivityState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub finalized: usize,
    pub pending: usize,
}

type Shard = Mutex<HashMap<u64, Activity>>;

/// Tracks the last activity of every live session and decides when a session has ended.
///
/// Sessions are spread over shards by `session_id % shards`; `update` locks only
/// its own shard, and a scan holds one shard lock at a time and never across
/// the finalization callback.
///
/// `update` and `scan_and_finalize` are expected to be called from one control
/// loop, one after the other, so no update lands while a callback runs. If a
/// caller does interleave them, the generation check keeps the updated session
/// tracked and a later scan finalizes it again with the newer timestamp.
pub struct SessionEndDetector {
    shards: Vec<Shard>,
}

impl SessionEndDetector {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, session_id: u64) -> usize {
        (session_id % self.shards.len() as u64) as usize
    }

    /// Record activity. Any update moves the session back to `Active`.
    pub fn update(&self, session_id: u64, observed_at: i64, event_timestamp: u64) {
        let mut shard = self.lock_shard(self.shard_of(session_id));
        let activity = shard.entry(session_id).or_insert(Activity {
            last_timestamp: event_timestamp,
            observed_at,
            generation: 0,
            state: ActivityState::Active,
        });
        activity.last_timestamp = activity.last_timestamp.max(event_timestamp);
        activity.observed_at = activity.observed_at.max(observed_at);
        activity.generation += 1;
        activity.state = ActivityState::Active;
    }

    /// Stop tracking a session that ended upstream.
    pub fn remove(&self, session_id: u64) -> bool {
        self.lock_shard(self.shard_of(session_id))
            .remove(&session_id)
            .is_some()
    }

    pub fn tracked(&self) -> usize {
        (0..self.shards.len())
            .map(|index| self.lock_shard(index).len())
            .sum()
    }

    pub fn state(&self, session_id: u64) -> Option<ActivityState> {
        self.lock_shard(self.shard_of(session_id))
            .get(&session_id)
            .map(|activity| activity.state)
    }

    /// Finalize every session idle for at least `timeout_ms` as of `now_ms`.
    ///
    /// `on_ended(session_id, last_timestamp)` returns whether the end was
    /// durably recorded. Only then is the session dropped, and only if no
    /// update arrived while the callback ran. Otherwise it stays tracked and
    /// is offered again on the next scan.
    ///
    /// The shard lock is released while `on_ended` runs; serializing this
    /// call with `update` is up to the caller.
    pub async fn scan_and_finalize<F, Fut>(
        &self,
        now_ms: i64,
        timeout_ms: i64,
        mut on_ended: F,
    ) -> ScanSummary
    where
        F: FnMut(u64, u64) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut summary = ScanSummary::default();

        for index in 0..self.shards.len() {
            let expired: Vec<(u64, u64, u64)> = {
                let mut shard = self.lock_shard(index);
                shard
                    .iter_mut()
                    .filter(|(_, activity)| now_ms.saturating_sub(activity.observed_at) >= timeout_ms)
                    .map(|(session_id, activity)| {
                        activity.state = ActivityState::PendingEnd;
                        (*session_id, activity.last_timestamp, activity.generation)
                    })
                    .collect()
            };

            for (session_id, last_timestamp, generation) in expired {
                let committed = on_ended(session_id, last_timestamp).await;

                let mut shard = self.lock_shard(index);
                let unchanged = shard
                    .get(&session_id)
                    .is_some_and(|activity| activity.generation == generation);
                if committed && unchanged {
                    shard.remove(&session_id);
                    summary.finalized += 1;
                } else if unchanged {
                    summary.pending += 1;
                }
            }
        }

        if summary.pending > 0 {
            tracing::warn!(pending = summary.pending, "session ends not committed; retrying next tick");
        }
        summary
    }

    pub(crate) fn lock_shard(&self, index: usize) -> MutexGuard<'_, HashMap<u64, Activity>> {
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
