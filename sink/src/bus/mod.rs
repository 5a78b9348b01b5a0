use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use replay_core::messages::Message;

pub mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::{PgConsumer, PgProducer};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("bus connection closed")]
    Closed,
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Position and broker time of a consumed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMeta {
    pub partition: u32,
    pub offset: i64,
    /// Time the record was written to the bus, epoch milliseconds
    pub timestamp_ms: i64,
}

/// One consumed record: every message in it belongs to `session_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub session_id: u64,
    pub messages: Vec<Message>,
    pub meta: DeliveryMeta,
}

#[async_trait]
pub trait Consumer: Send {
    /// Next record in partition order. `None` after an idle poll.
    async fn consume_next(&mut self) -> Result<Option<Delivery>, BusError>;

    /// Commit read positions, lagging `gap` behind the newest consumed record.
    async fn commit_back(&mut self, gap: Duration) -> Result<(), BusError>;

    async fn close(&mut self) -> Result<(), BusError>;
}

#[async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Publish a record keyed by session id. Returns once the record is durable.
    async fn produce(&self, topic: &str, session_id: u64, payload: Vec<u8>) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Partition of a session's records.
pub fn partition_for(session_id: u64, partitions: u32) -> u32 {
    (session_id % u64::from(partitions.max(1))) as u32
}

/// Remembers consumed records per partition so commits can lag behind by time.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<u32, PartitionLog>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// (offset, timestamp_ms) of consumed records not yet behind a commit point
    records: VecDeque<(i64, i64)>,
    committed: Option<i64>,
}

impl OffsetTracker {
    pub fn record(&mut self, meta: &DeliveryMeta) {
        self.partitions
            .entry(meta.partition)
            .or_default()
            .records
            .push_back((meta.offset, meta.timestamp_ms));
    }

    /// Per partition, the offset to resume from: the oldest consumed record no
    /// more than `gap_ms` older than the newest one. Partitions whose point did
    /// not move since the last call are left out.
    pub fn commit_points(&mut self, gap_ms: i64) -> Vec<(u32, i64)> {
        let mut points = Vec::new();
        for (partition, log) in &mut self.partitions {
            let Some(&(_, newest_ts)) = log.records.back() else {
                continue;
            };
            let threshold = newest_ts.saturating_sub(gap_ms);
            while log
                .records
                .front()
                .is_some_and(|&(_, ts)| ts < threshold)
            {
                log.records.pop_front();
            }
            let Some(&(offset, _)) = log.records.front() else {
                continue;
            };
            if log.committed != Some(offset) {
                log.committed = Some(offset);
                points.push((*partition, offset));
            }
        }
        points
    }
}
