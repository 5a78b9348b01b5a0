use std::sync::Arc;

use crate::batch::BatchWriter;
use crate::cache::{CacheSettings, StateCache};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::detector::SessionEndDetector;
use crate::saver::Saver;
use crate::search::SearchIndexer;
use crate::store::Store;

/// Shared pipeline components, wired once at startup.
pub struct PipelineState<S, I> {
    pub cache: Arc<StateCache<S>>,
    pub batches: Arc<BatchWriter<S>>,
    pub saver: Arc<Saver<S, I>>,
    pub detector: Arc<SessionEndDetector>,
    pub clock: Arc<dyn Clock>,
}

impl<S: Store, I: SearchIndexer> PipelineState<S, I> {
    pub fn new(store: Arc<S>, indexer: Arc<I>, clock: Arc<dyn Clock>, config: &PipelineConfig) -> Self {
        let cache = Arc::new(StateCache::new(
            store.clone(),
            clock.clone(),
            CacheSettings {
                project_ttl: config.project_expiration,
                metadata_retry_delay: config.metadata_retry_delay,
            },
        ));
        let batches = Arc::new(BatchWriter::new(store, config.batch));
        let saver = Arc::new(Saver::new(cache.clone(), batches.clone(), indexer));
        let detector = Arc::new(SessionEndDetector::new(config.partitions as usize));

        Self {
            cache,
            batches,
            saver,
            detector,
            clock,
        }
    }
}
