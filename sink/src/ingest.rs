use std::sync::Arc;
use std::time::Duration;

use replay_core::messages::{Message, SessionEnd, encode_batch};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::{BusError, Consumer, Delivery, Producer};
use crate::cache::RetryOutcome;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::saver::Saver;
use crate::search::SearchIndexer;
use crate::state::PipelineState;
use crate::stats::QueueStats;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Draining,
    Stopped,
}

struct LoopSettings {
    topic_raw_web: String,
    session_end_timeout: Duration,
    tick_interval: Duration,
    commit_gap: Duration,
    consumer_idle: Duration,
    shutdown_timeout: Duration,
}

enum Step {
    Shutdown,
    Tick,
    Consumed(Result<Option<Delivery>, BusError>),
}

/// The single consuming control loop: route deliveries, then on every tick
/// flush batches, finalize idle sessions and commit read positions.
pub struct IngestLoop<S, I, C, P> {
    state: PipelineState<S, I>,
    consumer: C,
    producer: Arc<P>,
    settings: LoopSettings,
    stats: QueueStats,
    loop_state: LoopState,
}

impl<S, I, C, P> IngestLoop<S, I, C, P>
where
    S: Store,
    I: SearchIndexer,
    C: Consumer,
    P: Producer,
{
    pub fn new(state: PipelineState<S, I>, consumer: C, producer: Arc<P>, config: &PipelineConfig) -> Self {
        let stats = QueueStats::new(state.clock.clone(), config.stats_interval);
        Self {
            state,
            consumer,
            producer,
            settings: LoopSettings {
                topic_raw_web: config.topic_raw_web.clone(),
                session_end_timeout: config.session_end_timeout,
                tick_interval: config.tick_interval,
                commit_gap: config.commit_gap,
                consumer_idle: config.consumer_idle,
                shutdown_timeout: config.shutdown_timeout,
            },
            stats,
            loop_state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.loop_state
    }

    /// Run until `shutdown` flips to true, then drain. Only a closed bus ends the loop early.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let period = self.settings.tick_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(topic = %self.settings.topic_raw_web, "ingestion loop started");

        let mut outcome = Ok(());
        while self.loop_state == LoopState::Running {
            if *shutdown.borrow() {
                break;
            }
            let step = tokio::select! {
                biased;
                changed = shutdown.changed() => match changed {
                    Ok(()) if !*shutdown.borrow() => continue,
                    _ => Step::Shutdown,
                },
                _ = ticker.tick() => Step::Tick,
                next = self.consumer.consume_next() => Step::Consumed(next),
            };

            match step {
                Step::Shutdown => break,
                Step::Tick => self.tick().await,
                Step::Consumed(Ok(Some(delivery))) => self.handle_delivery(delivery).await,
                Step::Consumed(Ok(None)) => {}
                Step::Consumed(Err(BusError::Closed)) => {
                    tracing::error!("bus consumer closed unexpectedly");
                    outcome = Err(PipelineError::Bus(BusError::Closed));
                    break;
                }
                Step::Consumed(Err(err)) => {
                    tracing::warn!(error = %err, "bus poll failed");
                    tokio::time::sleep(self.settings.consumer_idle).await;
                }
            }
        }

        self.drain().await;
        outcome
    }

    /// Route every message of one record and feed the detector.
    pub async fn handle_delivery(&mut self, delivery: Delivery) {
        self.stats.collect(&delivery.meta, delivery.messages.len());
        let session_id = delivery.session_id;

        for message in &delivery.messages {
            if !message.is_lifecycle() {
                if message.timestamp() == 0 {
                    tracing::warn!(session_id, message_kind = message.kind(), "message without timestamp");
                }
                self.state
                    .detector
                    .update(session_id, delivery.meta.timestamp_ms, message.timestamp());
            }

            let result = self.state.saver.route(session_id, message).await;
            if matches!(message, Message::SessionEnd(_))
                && matches!(result, Ok(()) | Err(PipelineError::DuplicateSessionEnd { .. }))
            {
                self.state.detector.remove(session_id);
            }
            if let Err(err) = result {
                log_route_error(session_id, message, &err);
            }
        }
    }

    /// Periodic work: metadata retries, batch flush, session-end scan, offset commit.
    pub async fn tick(&mut self) {
        for outcome in self.state.cache.run_due_retries().await {
            if let RetryOutcome::Applied { session_id, slot } = outcome {
                tracing::debug!(session_id, slot, "deferred metadata applied");
            }
        }

        if let Err(err) = self.state.batches.flush_all().await {
            tracing::warn!(error = %err, "batch flush failed");
        }

        self.finalize_idle_sessions().await;
        self.commit().await;
        self.stats.log_if_due();
    }

    /// Commit read positions unless a failed batch still holds writes from consumed records.
    async fn commit(&mut self) {
        let failed = self.state.batches.failed_sessions();
        if failed > 0 {
            tracing::warn!(sessions = failed, "offset commit held back by unwritten batches");
            return;
        }
        if let Err(err) = self.consumer.commit_back(self.settings.commit_gap).await {
            tracing::warn!(error = %err, "offset commit failed");
        }
    }

    async fn finalize_idle_sessions(&self) {
        let saver: &Saver<S, I> = &self.state.saver;
        let producer: &P = &self.producer;
        let topic = self.settings.topic_raw_web.as_str();
        let timeout_ms = i64::try_from(self.settings.session_end_timeout.as_millis()).unwrap_or(i64::MAX);

        let summary = self
            .state
            .detector
            .scan_and_finalize(self.state.clock.now_millis(), timeout_ms, move |session_id, timestamp| {
                finalize(saver, producer, topic, session_id, timestamp)
            })
            .await;
        if summary.finalized > 0 {
            tracing::info!(finalized = summary.finalized, pending = summary.pending, "idle sessions finalized");
        }
    }

    async fn drain(&mut self) {
        self.loop_state = LoopState::Draining;
        tracing::info!("draining ingestion loop");

        let drained = tokio::time::timeout(self.settings.shutdown_timeout, async {
            self.finalize_idle_sessions().await;
            if let Err(err) = self.state.batches.flush_all().await {
                tracing::warn!(error = %err, "final batch flush failed");
            }
            self.commit().await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                timeout_ms = self.settings.shutdown_timeout.as_millis() as u64,
                "drain did not finish within the shutdown window"
            );
        }

        if let Err(err) = self.producer.close().await {
            tracing::warn!(error = %err, "producer close failed");
        }
        if let Err(err) = self.consumer.close().await {
            tracing::warn!(error = %err, "consumer close failed");
        }

        self.loop_state = LoopState::Stopped;
        tracing::info!("ingestion loop stopped");
    }
}

/// Persist a detected end, then republish it. True only when both succeeded.
async fn finalize<S, I, P>(
    saver: &Saver<S, I>,
    producer: &P,
    topic: &str,
    session_id: u64,
    timestamp: u64,
) -> bool
where
    S: Store,
    I: SearchIndexer,
    P: Producer,
{
    match saver.finalize_session(session_id, timestamp).await {
        // A previous attempt recorded the end but failed to publish it.
        Ok(()) | Err(PipelineError::DuplicateSessionEnd { .. }) => {}
        Err(err) => {
            tracing::warn!(session_id, error = %err, error_kind = %err.kind(), "session end not saved");
            return false;
        }
    }

    let payload = match encode_batch(&[Message::SessionEnd(SessionEnd { timestamp })]) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(session_id, error = %err, "session end encode failed");
            return false;
        }
    };
    if let Err(err) = producer.produce(topic, session_id, payload).await {
        tracing::warn!(session_id, error = %err, "session end publish failed");
        return false;
    }
    true
}

fn log_route_error(session_id: u64, message: &Message, err: &PipelineError) {
    match err {
        PipelineError::DuplicateSessionEnd { .. } => {
            tracing::debug!(session_id, message_kind = message.kind(), error = %err, "duplicate session end");
        }
        _ => {
            tracing::warn!(
                session_id,
                message_kind = message.kind(),
                error_kind = %err.kind(),
                error = %err,
                "message not applied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use replay_core::messages::{ClickEvent, Message, SessionEnd};

    use super::*;
    use crate::bus::DeliveryMeta;
    use crate::bus::memory::MemoryBus;
    use crate::clock::ManualClock;
    use crate::saver::testing::{project, start};
    use crate::search::NoopIndexer;
    use crate::store::memory::MemoryStore;

    type TestLoop = IngestLoop<MemoryStore, NoopIndexer, MemoryBus, MemoryBus>;

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::from_lookup(|name| {
            (name == "DATABASE_URL").then(|| "postgres://localhost/replay".to_string())
        })
        .unwrap();
        config.partitions = 4;
        config.session_end_timeout = Duration::from_millis(5_000);
        config.commit_gap = Duration::from_millis(0);
        config
    }

    fn setup() -> (TestLoop, Arc<MemoryStore>, MemoryBus, ManualClock) {
        let store = Arc::new(MemoryStore::new().with_project(project(7, false)));
        let bus = MemoryBus::new();
        let clock = ManualClock::at_millis(0);
        let config = config();
        let state = PipelineState::new(store.clone(), Arc::new(NoopIndexer), Arc::new(clock.clone()), &config);
        let ingest = IngestLoop::new(state, bus.clone(), Arc::new(bus.clone()), &config);
        (ingest, store, bus, clock)
    }

    fn delivery(session_id: u64, messages: Vec<Message>, offset: i64, timestamp_ms: i64) -> Delivery {
        Delivery {
            session_id,
            messages,
            meta: DeliveryMeta {
                partition: 2,
                offset,
                timestamp_ms,
            },
        }
    }

    fn click(timestamp: u64) -> Message {
        Message::ClickEvent(ClickEvent {
            message_id: 1,
            timestamp,
            label: "Buy".to_string(),
            selector: "#buy".to_string(),
        })
    }

    /// Start session 42 through the bus so the consumer tracks its offset.
    async fn start_session(ingest: &mut TestLoop, bus: &MemoryBus) {
        bus.push(42, vec![Message::SessionStart(start(7, 1_000)), click(1_500)], 1_500);
        let delivery = ingest.consumer.consume_next().await.unwrap().unwrap();
        ingest.handle_delivery(delivery).await;
    }

    #[tokio::test]
    async fn lifecycle_messages_do_not_feed_the_detector() {
        let (mut ingest, store, _bus, _clock) = setup();
        ingest
            .handle_delivery(delivery(42, vec![Message::SessionStart(start(7, 1_000))], 0, 1_000))
            .await;
        assert!(store.stored_session(42).is_some());
        assert_eq!(ingest.state.detector.tracked(), 0);

        ingest.handle_delivery(delivery(42, vec![click(1_500)], 1, 1_500)).await;
        assert_eq!(ingest.state.detector.tracked(), 1);
    }

    #[tokio::test]
    async fn idle_session_is_saved_republished_then_committed() {
        let (mut ingest, store, bus, clock) = setup();
        start_session(&mut ingest, &bus).await;

        clock.advance_millis(6_499);
        ingest.tick().await;
        assert!(bus.produced().is_empty());
        assert_eq!(ingest.state.detector.tracked(), 1);

        clock.advance_millis(1);
        ingest.tick().await;
        assert_eq!(store.stored_session(42).unwrap().duration, Some(500));
        assert_eq!(
            bus.produced(),
            vec![(
                "raw".to_string(),
                42,
                vec![Message::SessionEnd(SessionEnd { timestamp: 1_500 })]
            )]
        );
        assert_eq!(ingest.state.detector.tracked(), 0);
        assert!(!ingest.state.cache.has_session(42).await);
        assert!(bus.commits().iter().any(|points| points == &vec![(2, 0)]));
    }

    #[tokio::test]
    async fn failed_save_keeps_session_tracked_until_a_later_tick() {
        let (mut ingest, store, bus, clock) = setup();
        start_session(&mut ingest, &bus).await;
        ingest.state.batches.flush_all().await.unwrap();

        clock.advance_millis(10_000);
        store.fail_writes(1);
        ingest.tick().await;
        assert!(bus.produced().is_empty());
        assert_eq!(ingest.state.detector.tracked(), 1);

        ingest.tick().await;
        assert_eq!(bus.produced().len(), 1);
        assert_eq!(ingest.state.detector.tracked(), 0);
    }

    #[tokio::test]
    async fn failed_publish_is_retried_without_a_second_save() {
        let (mut ingest, store, bus, clock) = setup();
        start_session(&mut ingest, &bus).await;

        clock.advance_millis(10_000);
        bus.fail_produces(1);
        ingest.tick().await;
        assert_eq!(store.stored_session(42).unwrap().duration, Some(500));
        assert_eq!(ingest.state.detector.tracked(), 1);

        ingest.tick().await;
        assert_eq!(bus.produced().len(), 1);
        assert_eq!(ingest.state.detector.tracked(), 0);
        let issue_type_updates = store
            .executed()
            .iter()
            .filter(|s| s.sql.contains("issue_types"))
            .count();
        assert_eq!(issue_type_updates, 1);
    }

    #[tokio::test]
    async fn explicit_session_end_stops_tracking() {
        let (mut ingest, store, bus, _clock) = setup();
        start_session(&mut ingest, &bus).await;

        ingest
            .handle_delivery(delivery(42, vec![Message::SessionEnd(SessionEnd { timestamp: 4_000 })], 1, 4_000))
            .await;
        assert_eq!(store.stored_session(42).unwrap().duration, Some(3_000));
        assert_eq!(ingest.state.detector.tracked(), 0);
    }

    #[tokio::test]
    async fn zero_timestamp_is_still_routed() {
        let (mut ingest, _store, bus, _clock) = setup();
        start_session(&mut ingest, &bus).await;
        ingest.handle_delivery(delivery(42, vec![click(0)], 1, 2_000)).await;

        let session = ingest.state.cache.get_session(42).await.unwrap();
        assert_eq!(session.events_count, 2);
    }

    #[tokio::test]
    async fn failing_message_does_not_stop_the_record() {
        let (mut ingest, _store, bus, _clock) = setup();
        start_session(&mut ingest, &bus).await;
        ingest
            .handle_delivery(delivery(
                42,
                vec![Message::SessionStart(start(7, 1_000)), click(1_600)],
                1,
                1_600,
            ))
            .await;

        let session = ingest.state.cache.get_session(42).await.unwrap();
        assert_eq!(session.events_count, 2);
    }

    #[tokio::test]
    async fn commit_is_held_back_while_a_batch_keeps_failing() {
        let (mut ingest, store, bus, _clock) = setup();
        start_session(&mut ingest, &bus).await;

        store.fail_writes(2);
        ingest.tick().await;
        ingest.tick().await;
        assert!(bus.commits().is_empty());
        assert_eq!(ingest.state.batches.failed_sessions(), 1);

        ingest.tick().await;
        assert_eq!(ingest.state.batches.pending_sessions(), 0);
        assert_eq!(bus.commits(), vec![vec![(2, 0)]]);
        assert!(store.transactions().iter().any(|unit| unit.iter().any(|s| s.sql.contains("autocomplete"))));
    }

    #[tokio::test]
    async fn activity_consumed_after_finalization_is_tracked_again() {
        let (mut ingest, store, bus, clock) = setup();
        start_session(&mut ingest, &bus).await;
        clock.advance_millis(10_000);
        bus.push(42, vec![click(9_000)], 10_000);

        // The tick runs to completion before the queued record is read.
        ingest.tick().await;
        assert_eq!(store.stored_session(42).unwrap().duration, Some(500));
        assert_eq!(ingest.state.detector.tracked(), 0);
        assert_eq!(bus.pending(), 1);

        let delivery = ingest.consumer.consume_next().await.unwrap().unwrap();
        ingest.handle_delivery(delivery).await;
        assert_eq!(ingest.state.detector.tracked(), 1);

        clock.advance_millis(5_000);
        ingest.tick().await;
        assert_eq!(store.stored_session(42).unwrap().duration, Some(8_000));
        assert_eq!(bus.produced().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_finalizes_sessions_that_went_idle() {
        let (mut ingest, store, bus, clock) = setup();
        start_session(&mut ingest, &bus).await;
        clock.advance_millis(10_000);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        ingest.run(rx).await.unwrap();

        assert_eq!(store.stored_session(42).unwrap().duration, Some(500));
        assert_eq!(
            bus.produced(),
            vec![(
                "raw".to_string(),
                42,
                vec![Message::SessionEnd(SessionEnd { timestamp: 1_500 })]
            )]
        );
        assert_eq!(ingest.state.detector.tracked(), 0);
        assert_eq!(bus.operations(), vec!["produce", "commit"]);
        assert_eq!(bus.commits(), vec![vec![(2, 0)]]);
    }

    #[tokio::test]
    async fn shutdown_drains_and_closes_the_bus() {
        let (mut ingest, store, bus, _clock) = setup();
        start_session(&mut ingest, &bus).await;
        assert!(ingest.state.batches.pending_sessions() > 0);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        ingest.run(rx).await.unwrap();

        assert_eq!(ingest.state(), LoopState::Stopped);
        assert_eq!(ingest.state.batches.pending_sessions(), 0);
        assert!(!store.transactions().is_empty());
        assert!(bus.consumer_closed());
        assert!(bus.producer_closed());
        assert!(!bus.commits().is_empty());
    }
}
