use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::PipelineError;
use crate::store::{SqlParam, Statement, Store};

const SESSION_COUNTERS_SQL: &str = "UPDATE sessions SET pages_count = pages_count + $1, events_count = events_count + $2 WHERE session_id = $3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Statements per session batch before an eager flush
    pub queue_limit: usize,
    /// Estimated bytes per session batch before an eager flush
    pub size_limit: usize,
    /// Failed flushes after which a still-failing batch is logged as an error
    pub alert_after: u32,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            queue_limit: 20,
            size_limit: 10_000_000,
            alert_after: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    /// A limit was reached; the caller should flush this session now.
    Full,
}

#[derive(Debug, Default)]
struct PendingBatch {
    statements: Vec<Statement>,
    size: usize,
    pages: u64,
    events: u64,
    attempts: u32,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.pages == 0 && self.events == 0
    }

    /// Statements to submit, followed by the accumulated counter update.
    fn unit(&self, session_id: u64) -> Vec<Statement> {
        let mut statements = self.statements.clone();
        if self.pages > 0 || self.events > 0 {
            statements.push(Statement::new(
                SESSION_COUNTERS_SQL,
                vec![
                    SqlParam::uint(self.pages),
                    SqlParam::uint(self.events),
                    SqlParam::uint(session_id),
                ],
            ));
        }
        statements
    }

    /// `self` failed to flush while `newer` accumulated; keep `self` in front.
    fn prepend_to(mut self, newer: PendingBatch) -> PendingBatch {
        self.statements.extend(newer.statements);
        self.size += newer.size;
        self.pages += newer.pages;
        self.events += newer.events;
        self
    }
}

/// Per-session accumulation of pending writes, submitted one transaction per session.
pub struct BatchWriter<S> {
    store: Arc<S>,
    limits: BatchLimits,
    pending: Mutex<HashMap<u64, PendingBatch>>,
}

impl<S: Store> BatchWriter<S> {
    pub fn new(store: Arc<S>, limits: BatchLimits) -> Self {
        Self {
            store,
            limits,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Append a statement to the session's batch. Never blocks on the store and never drops.
    pub fn enqueue(&self, session_id: u64, statement: Statement, estimated_size: usize) -> BatchStatus {
        let mut pending = self.lock();
        let batch = pending.entry(session_id).or_default();
        batch.statements.push(statement);
        batch.size += estimated_size;

        if batch.statements.len() >= self.limits.queue_limit || batch.size >= self.limits.size_limit {
            BatchStatus::Full
        } else {
            BatchStatus::Pending
        }
    }

    /// Accumulate page and event counters, written as one update when the batch flushes.
    pub fn record_session_events(&self, session_id: u64, pages: u64, events: u64) {
        let mut pending = self.lock();
        let batch = pending.entry(session_id).or_default();
        batch.pages += pages;
        batch.events += events;
    }

    /// Submit and clear one session's batch.
    pub async fn flush(&self, session_id: u64) -> Result<(), PipelineError> {
        let Some(batch) = self.lock().remove(&session_id) else {
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.submit(session_id, batch).await
    }

    /// Submit every pending batch. A failing session does not affect the others;
    /// the failed sessions are reported together.
    pub async fn flush_all(&self) -> Result<(), PipelineError> {
        let mut batches: Vec<(u64, PendingBatch)> = self
            .lock()
            .drain()
            .filter(|(_, batch)| !batch.is_empty())
            .collect();
        batches.sort_by_key(|(session_id, _)| *session_id);

        let mut failed = Vec::new();
        for (session_id, batch) in batches {
            if self.submit(session_id, batch).await.is_err() {
                failed.push(session_id);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::BatchFlush { failed })
        }
    }

    async fn submit(&self, session_id: u64, batch: PendingBatch) -> Result<(), PipelineError> {
        let unit = batch.unit(session_id);

        match self.store.execute_transaction(&unit).await {
            Ok(()) => {
                tracing::debug!(session_id, statements = unit.len(), size = batch.size, "session batch flushed");
                Ok(())
            }
            Err(err) => {
                let attempts = batch.attempts + 1;
                if attempts >= self.limits.alert_after {
                    tracing::error!(
                        session_id,
                        attempts,
                        statements = unit.len(),
                        error = %err,
                        "session batch still failing; requeued"
                    );
                } else {
                    tracing::warn!(session_id, attempts, error = %err, "session batch flush failed; requeued");
                }
                let mut pending = self.lock();
                let newer = pending.remove(&session_id).unwrap_or_default();
                let failed = PendingBatch { attempts, ..batch };
                pending.insert(session_id, failed.prepend_to(newer));
                Err(err.into())
            }
        }
    }

    /// Sessions whose batch has failed at least once and is not yet written.
    /// Read positions must not be committed past their records while this is non-zero.
    pub fn failed_sessions(&self) -> usize {
        self.lock().values().filter(|b| b.attempts > 0).count()
    }

    pub fn pending_sessions(&self) -> usize {
        self.lock().len()
    }

    pub fn pending_statements(&self) -> usize {
        self.lock().values().map(|b| b.statements.len()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingBatch>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
