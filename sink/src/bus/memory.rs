use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use replay_core::messages::{Message, decode_batch};

use super::{BusError, Consumer, Delivery, DeliveryMeta, OffsetTracker, Producer, partition_for};

/// In-memory bus for tests. Clones share state; one handle can act as both
/// consumer and producer.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    inbound: VecDeque<Delivery>,
    next_offset: i64,
    produced: Vec<(String, u64, Vec<u8>)>,
    commits: Vec<Vec<(u32, i64)>>,
    /// "produce" and "commit", in call order
    operations: Vec<&'static str>,
    tracker: OffsetTracker,
    failing_produces: usize,
    consumer_closed: bool,
    producer_closed: bool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a record for consumption.
    pub fn push(&self, session_id: u64, messages: Vec<Message>, timestamp_ms: i64) {
        let mut state = self.state.lock().unwrap();
        let offset = state.next_offset;
        state.next_offset += 1;
        state.inbound.push_back(Delivery {
            session_id,
            messages,
            meta: DeliveryMeta {
                partition: partition_for(session_id, 4),
                offset,
                timestamp_ms,
            },
        });
    }

    pub fn fail_produces(&self, count: usize) {
        self.state.lock().unwrap().failing_produces = count;
    }

    /// Produced records as (topic, session id, decoded messages).
    pub fn produced(&self) -> Vec<(String, u64, Vec<Message>)> {
        self.state
            .lock()
            .unwrap()
            .produced
            .iter()
            .map(|(topic, key, payload)| {
                (topic.clone(), *key, decode_batch(payload).unwrap().messages)
            })
            .collect()
    }

    pub fn commits(&self) -> Vec<Vec<(u32, i64)>> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().inbound.len()
    }

    pub fn consumer_closed(&self) -> bool {
        self.state.lock().unwrap().consumer_closed
    }

    pub fn producer_closed(&self) -> bool {
        self.state.lock().unwrap().producer_closed
    }
}

#[async_trait]
impl Consumer for MemoryBus {
    async fn consume_next(&mut self) -> Result<Option<Delivery>, BusError> {
        let delivery = {
            let mut state = self.state.lock().unwrap();
            if state.consumer_closed {
                return Err(BusError::Closed);
            }
            let delivery = state.inbound.pop_front();
            if let Some(delivery) = &delivery {
                state.tracker.record(&delivery.meta);
            }
            delivery
        };
        if delivery.is_none() {
            tokio::task::yield_now().await;
        }
        Ok(delivery)
    }

    async fn commit_back(&mut self, gap: Duration) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        let points = state.tracker.commit_points(gap.as_millis() as i64);
        state.commits.push(points);
        state.operations.push("commit");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.state.lock().unwrap().consumer_closed = true;
        Ok(())
    }
}

#[async_trait]
impl Producer for MemoryBus {
    async fn produce(&self, topic: &str, session_id: u64, payload: Vec<u8>) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.producer_closed {
            return Err(BusError::Closed);
        }
        if state.failing_produces > 0 {
            state.failing_produces -= 1;
            return Err(BusError::Unavailable("injected produce failure".to_string()));
        }
        state.produced.push((topic.to_string(), session_id, payload));
        state.operations.push("produce");
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.state.lock().unwrap().producer_closed = true;
        Ok(())
    }
}
