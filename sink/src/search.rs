use std::sync::Arc;

use async_trait::async_trait;
use replay_core::messages::{Message, encode_batch};

use crate::bus::Producer;

/// Receives page, fetch and GraphQL events for full-text search. Failures stay inside.
#[async_trait]
pub trait SearchIndexer: Send + Sync + 'static {
    async fn index(&self, session_id: u64, message: &Message);
}

/// Publishes indexable events to the search topic.
pub struct BusSearchIndexer<P> {
    producer: Arc<P>,
    topic: String,
}

impl<P: Producer> BusSearchIndexer<P> {
    pub fn new(producer: Arc<P>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl<P: Producer> SearchIndexer for BusSearchIndexer<P> {
    async fn index(&self, session_id: u64, message: &Message) {
        let payload = match encode_batch(std::slice::from_ref(message)) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(session_id, message_kind = message.kind(), error = %err, "search payload encode failed");
                return;
            }
        };
        if let Err(err) = self.producer.produce(&self.topic, session_id, payload).await {
            tracing::warn!(session_id, message_kind = message.kind(), error = %err, "search indexing publish failed");
        }
    }
}

/// Indexer used when no search topic is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIndexer;

#[async_trait]
impl SearchIndexer for NoopIndexer {
    async fn index(&self, _session_id: u64, _message: &Message) {}
}

/// Either indexer, chosen at startup from configuration.
pub enum Indexer<P> {
    Bus(BusSearchIndexer<P>),
    Disabled(NoopIndexer),
}

#[async_trait]
impl<P: Producer> SearchIndexer for Indexer<P> {
    async fn index(&self, session_id: u64, message: &Message) {
        match self {
            Indexer::Bus(indexer) => indexer.index(session_id, message).await,
            Indexer::Disabled(indexer) => indexer.index(session_id, message).await,
        }
    }
}
