use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::DeliveryMeta;
use crate::clock::Clock;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub records: u64,
    pub messages: u64,
    pub last_offset: i64,
    pub last_timestamp_ms: i64,
}

/// Per-partition consumption counters, logged and reset on an interval.
pub struct QueueStats {
    clock: Arc<dyn Clock>,
    interval_ms: i64,
    started_at: i64,
    partitions: BTreeMap<u32, PartitionStats>,
}

impl QueueStats {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let started_at = clock.now_millis();
        Self {
            clock,
            interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
            started_at,
            partitions: BTreeMap::new(),
        }
    }

    pub fn collect(&mut self, meta: &DeliveryMeta, messages: usize) {
        let stats = self.partitions.entry(meta.partition).or_default();
        stats.records += 1;
        stats.messages += messages as u64;
        stats.last_offset = meta.offset;
        stats.last_timestamp_ms = meta.timestamp_ms;
    }

    pub fn partition(&self, partition: u32) -> Option<&PartitionStats> {
        self.partitions.get(&partition)
    }

    /// Log one line per partition once the interval has elapsed, then reset.
    /// Returns whether anything was logged.
    pub fn log_if_due(&mut self) -> bool {
        let now = self.clock.now_millis();
        let window_ms = now - self.started_at;
        if window_ms < self.interval_ms {
            return false;
        }

        for (partition, stats) in &self.partitions {
            tracing::info!(
                partition,
                records = stats.records,
                messages = stats.messages,
                last_offset = stats.last_offset,
                lag_ms = now - stats.last_timestamp_ms,
                window_ms,
                "queue stats"
            );
        }
        let logged = !self.partitions.is_empty();
        self.partitions.clear();
        self.started_at = now;
        logged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn meta(partition: u32, offset: i64) -> DeliveryMeta {
        DeliveryMeta {
            partition,
            offset,
            timestamp_ms: 1_000,
        }
    }

    #[test]
    fn counts_records_and_messages_per_partition() {
        let clock = ManualClock::at_millis(0);
        let mut stats = QueueStats::new(Arc::new(clock), Duration::from_secs(60));
        stats.collect(&meta(0, 5), 3);
        stats.collect(&meta(0, 6), 2);
        stats.collect(&meta(2, 1), 1);

        let p0 = stats.partition(0).unwrap();
        assert_eq!((p0.records, p0.messages, p0.last_offset), (2, 5, 6));
        assert_eq!(stats.partition(2).unwrap().records, 1);
    }

    #[test]
    fn logs_and_resets_only_after_interval() {
        let clock = ManualClock::at_millis(0);
        let mut stats = QueueStats::new(Arc::new(clock.clone()), Duration::from_secs(60));
        stats.collect(&meta(0, 5), 3);

        clock.advance_millis(59_999);
        assert!(!stats.log_if_due());
        assert!(stats.partition(0).is_some());

        clock.advance_millis(1);
        assert!(stats.log_if_due());
        assert!(stats.partition(0).is_none());
    }
}
