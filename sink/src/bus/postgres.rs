use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use replay_core::messages::decode_batch;
use sqlx::PgPool;

use super::{BusError, Consumer, Delivery, DeliveryMeta, OffsetTracker, Producer, partition_for};

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: i64,
    partition: i32,
    partition_key: i64,
    payload: Vec<u8>,
    created_at_ms: i64,
}

impl RecordRow {
    fn meta(&self) -> DeliveryMeta {
        DeliveryMeta {
            partition: self.partition as u32,
            offset: self.id,
            timestamp_ms: self.created_at_ms,
        }
    }

    /// Decode the payload. Undecodable elements are logged and dropped; `None`
    /// only when the payload is not a record at all.
    fn into_delivery(self, meta: DeliveryMeta) -> Option<Delivery> {
        let session_id = self.partition_key as u64;
        match decode_batch(&self.payload) {
            Ok(batch) => {
                for skipped in &batch.skipped {
                    tracing::warn!(
                        session_id,
                        partition = meta.partition,
                        offset = meta.offset,
                        kind = %skipped.kind,
                        error = %skipped.error,
                        "dropping undecodable message"
                    );
                }
                Some(Delivery {
                    session_id,
                    messages: batch.messages,
                    meta,
                })
            }
            Err(err) => {
                tracing::warn!(
                    session_id,
                    partition = meta.partition,
                    offset = meta.offset,
                    error = %err,
                    "skipping undecodable bus record"
                );
                None
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct OffsetRow {
    partition: i32,
    committed_offset: i64,
}

/// Consumer-group reader over the `bus_messages` table.
pub struct PgConsumer {
    pool: PgPool,
    group: String,
    topic: String,
    poll_limit: i64,
    idle: Duration,
    /// Next offset to read, per partition
    positions: HashMap<u32, i64>,
    partitions: u32,
    buffer: VecDeque<RecordRow>,
    tracker: OffsetTracker,
    closed: bool,
}

impl PgConsumer {
    /// Join `group` on `topic`, resuming from the group's committed offsets.
    pub async fn connect(
        pool: PgPool,
        group: &str,
        topic: &str,
        partitions: u32,
        poll_limit: u32,
        idle: Duration,
    ) -> Result<Self, BusError> {
        let rows = sqlx::query_as::<_, OffsetRow>(
            r#"
            SELECT partition, committed_offset
            FROM bus_consumer_offsets
            WHERE group_id = $1 AND topic = $2
            "#,
        )
        .bind(group)
        .bind(topic)
        .fetch_all(&pool)
        .await?;

        let mut positions: HashMap<u32, i64> = (0..partitions).map(|p| (p, 0)).collect();
        for row in rows {
            positions.insert(row.partition as u32, row.committed_offset);
        }

        tracing::info!(group, topic, partitions, "bus consumer joined");

        Ok(Self {
            pool,
            group: group.to_string(),
            topic: topic.to_string(),
            poll_limit: i64::from(poll_limit.max(1)),
            idle,
            positions,
            partitions,
            buffer: VecDeque::new(),
            tracker: OffsetTracker::default(),
            closed: false,
        })
    }

    async fn poll(&mut self) -> Result<(), BusError> {
        let (partitions, positions): (Vec<i32>, Vec<i64>) = self
            .positions
            .iter()
            .map(|(partition, position)| (*partition as i32, *position))
            .unzip();

        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT m.id, m.partition, m.partition_key, m.payload,
                (EXTRACT(EPOCH FROM m.created_at) * 1000)::bigint AS created_at_ms
            FROM bus_messages m
            JOIN UNNEST($2::int[], $3::bigint[]) AS p(partition, position)
                ON p.partition = m.partition
            WHERE m.topic = $1 AND m.id >= p.position
            ORDER BY m.id
            LIMIT $4
            "#,
        )
        .bind(&self.topic)
        .bind(partitions)
        .bind(positions)
        .bind(self.poll_limit)
        .fetch_all(&self.pool)
        .await?;

        self.buffer.extend(rows);
        Ok(())
    }
}

#[async_trait]
impl Consumer for PgConsumer {
    async fn consume_next(&mut self) -> Result<Option<Delivery>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        if self.buffer.is_empty() {
            self.poll().await?;
            if self.buffer.is_empty() {
                tokio::time::sleep(self.idle).await;
                return Ok(None);
            }
        }

        while let Some(row) = self.buffer.pop_front() {
            self.positions.insert(row.partition as u32, row.id + 1);
            let meta = row.meta();
            self.tracker.record(&meta);
            if let Some(delivery) = row.into_delivery(meta) {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    async fn commit_back(&mut self, gap: Duration) -> Result<(), BusError> {
        let gap_ms = i64::try_from(gap.as_millis()).unwrap_or(i64::MAX);
        let points = self.tracker.commit_points(gap_ms);
        if points.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (partition, offset) in &points {
            sqlx::query(
                r#"
                INSERT INTO bus_consumer_offsets (group_id, topic, partition, committed_offset)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (group_id, topic, partition)
                DO UPDATE SET committed_offset = GREATEST(bus_consumer_offsets.committed_offset, EXCLUDED.committed_offset)
                "#,
            )
            .bind(&self.group)
            .bind(&self.topic)
            .bind(*partition as i32)
            .bind(*offset)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(group = %self.group, partitions = points.len(), "consumer offsets committed");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.closed = true;
        self.buffer.clear();
        tracing::info!(group = %self.group, topic = %self.topic, partitions = self.partitions, "bus consumer closed");
        Ok(())
    }
}

/// Writer to the `bus_messages` table.
pub struct PgProducer {
    pool: PgPool,
    partitions: u32,
    closed: AtomicBool,
}

impl PgProducer {
    pub fn new(pool: PgPool, partitions: u32) -> Self {
        Self {
            pool,
            partitions,
            closed: AtomicBool::new(false),
        }
    }
}

/// Taken by every writer to `bus_messages` before inserting. Ids are assigned
/// and committed one writer at a time per topic partition, so a consumer that
/// has read id N never sees a lower id appear later in that partition.
const PARTITION_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1), $2)";

#[async_trait]
impl Producer for PgProducer {
    async fn produce(&self, topic: &str, session_id: u64, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let partition = partition_for(session_id, self.partitions) as i32;

        let mut tx = self.pool.begin().await?;
        sqlx::query(PARTITION_LOCK_SQL)
            .bind(topic)
            .bind(partition)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO bus_messages (topic, partition, partition_key, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(session_id as i64)
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
