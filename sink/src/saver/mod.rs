use std::sync::Arc;

use replay_core::messages::{ErrorEvent, Message, SessionEnd};

use crate::batch::{BatchStatus, BatchWriter};
use crate::cache::StateCache;
use crate::error::PipelineError;
use crate::search::SearchIndexer;
use crate::store::{SqlParam, Statement, Store};

mod events;
mod issues;
mod sessions;

pub use issues::issue_score;

const AUTOCOMPLETE_SQL: &str =
    "INSERT INTO autocomplete (value, type, project_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING";

/// Turns consumed messages into cache mutations, batched writes and transactions.
pub struct Saver<S, I> {
    cache: Arc<StateCache<S>>,
    batches: Arc<BatchWriter<S>>,
    indexer: Arc<I>,
}

impl<S: Store, I: SearchIndexer> Saver<S, I> {
    pub fn new(cache: Arc<StateCache<S>>, batches: Arc<BatchWriter<S>>, indexer: Arc<I>) -> Self {
        Self {
            cache,
            batches,
            indexer,
        }
    }

    /// Apply one message for `session_id`. A failure affects this message only.
    pub async fn route(&self, session_id: u64, message: &Message) -> Result<(), PipelineError> {
        match message {
            Message::SessionStart(start) => self.session_start(session_id, start).await,
            Message::SessionEnd(end) => self.session_end(session_id, end).await,
            Message::UserId(user) => self.user_id(session_id, &user.id).await,
            Message::UserAnonymousId(user) => self.user_anonymous_id(session_id, &user.id).await,
            Message::Metadata(metadata) => {
                self.cache
                    .insert_metadata(session_id, &metadata.key, &metadata.value)
                    .await
            }
            Message::IssueEvent(issue) => self.issue(session_id, issue).await,
            Message::CustomEvent(custom) => self.custom(session_id, custom).await,
            Message::ClickEvent(click) => self.click(session_id, click).await,
            Message::InputEvent(input) => self.input(session_id, input).await,
            Message::PageEvent(page) => {
                self.indexer.index(session_id, message).await;
                self.page(session_id, page).await
            }
            Message::ErrorEvent(error) => self.error(session_id, error).await,
            Message::FetchEvent(fetch) => {
                self.indexer.index(session_id, message).await;
                self.fetch(session_id, fetch).await
            }
            Message::GraphQlEvent(graphql) => {
                self.indexer.index(session_id, message).await;
                self.graphql(session_id, graphql).await
            }
            Message::IntegrationEvent(integration) => {
                self.error(session_id, &ErrorEvent::from(integration)).await
            }
        }
    }

    /// Record the end of a session detected by inactivity.
    pub async fn finalize_session(&self, session_id: u64, timestamp: u64) -> Result<(), PipelineError> {
        self.session_end(session_id, &SessionEnd { timestamp }).await
    }

    async fn queue(&self, session_id: u64, statement: Statement) {
        let size = statement.estimated_size();
        self.queue_sized(session_id, statement, size).await;
    }

    async fn queue_sized(&self, session_id: u64, statement: Statement, size: usize) {
        if self.batches.enqueue(session_id, statement, size) == BatchStatus::Full {
            // A failed batch stays queued for the next flush.
            let _ = self.batches.flush(session_id).await;
        }
    }

    async fn autocomplete(&self, session_id: u64, project_id: u32, kind: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        let statement = Statement::new(
            AUTOCOMPLETE_SQL,
            vec![
                SqlParam::text(value),
                SqlParam::text(kind),
                SqlParam::Int(i64::from(project_id)),
            ],
        );
        self.queue(session_id, statement).await;
    }
}

/// Non-web platforms get their own autocomplete namespace, e.g. `USEROS_IOS`.
fn autocomplete_type(base: &str, platform: &str) -> String {
    if platform == "web" {
        base.to_string()
    } else {
        format!("{base}_{}", platform.to_uppercase())
    }
}

/// Sequence index stored on occurrence rows.
fn seq_index(message_id: u64) -> SqlParam {
    SqlParam::Int((message_id % i32::MAX as u64) as i64)
}

/// Empty strings and `{}` are stored as NULL in JSON columns.
fn json_or_null(value: &str) -> SqlParam {
    if value.is_empty() || value == "{}" {
        SqlParam::null()
    } else {
        SqlParam::text(value)
    }
}
