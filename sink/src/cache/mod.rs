use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use replay_core::model::{Project, Session};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::store::{SqlParam, Statement, Store};

mod retry;

pub use retry::{MetadataRetry, RetryOutcome};
use retry::RetryQueue;

/// Cached lookup result. `Absent` records a confirmed miss and is distinct
/// from having no entry at all.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry<T> {
    Loaded {
        value: T,
        /// `None` never expires
        expires_at: Option<DateTime<Utc>>,
    },
    Absent,
}

impl<T> CacheEntry<T> {
    fn fresh(&self, now: DateTime<Utc>) -> Option<&T> {
        match self {
            CacheEntry::Loaded { value, expires_at } => match expires_at {
                Some(at) if *at <= now => None,
                _ => Some(value),
            },
            CacheEntry::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub project_ttl: Duration,
    pub metadata_retry_delay: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            project_ttl: Duration::from_millis(1_200_000),
            metadata_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Session and project state shared by every message handler.
///
/// Sessions never expire; they leave the cache only through [`StateCache::delete_session`].
/// A session confirmed absent stays absent for the lifetime of the process.
/// Projects are refreshed from the store once their TTL has passed.
pub struct StateCache<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    sessions: RwLock<HashMap<u64, CacheEntry<Session>>>,
    projects: RwLock<HashMap<u32, CacheEntry<Project>>>,
    projects_by_key: RwLock<HashMap<String, CacheEntry<Project>>>,
    retries: RetryQueue,
}

impl<S: Store> StateCache<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: CacheSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            sessions: RwLock::new(HashMap::new()),
            projects: RwLock::new(HashMap::new()),
            projects_by_key: RwLock::new(HashMap::new()),
            retries: RetryQueue::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn get_session(&self, session_id: u64) -> Result<Session, PipelineError> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(&session_id) {
                Some(CacheEntry::Loaded { value, .. }) => return Ok(value.clone()),
                Some(CacheEntry::Absent) => return Err(PipelineError::NotFound { session_id }),
                None => {}
            }
        }

        let Some(mut session) = self.store.fetch_session(session_id).await? else {
            self.sessions
                .write()
                .await
                .insert(session_id, CacheEntry::Absent);
            return Err(PipelineError::NotFound { session_id });
        };

        let project = self.get_project(session.project_id).await?;
        session.save_request_payload = project.save_request_payloads;

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session_id)
            .or_insert_with(|| CacheEntry::Loaded {
                value: session,
                expires_at: None,
            });
        match entry {
            CacheEntry::Loaded { value, .. } => Ok(value.clone()),
            CacheEntry::Absent => Err(PipelineError::NotFound { session_id }),
        }
    }

    /// True only for a loaded entry; a negative marker does not count.
    pub async fn has_session(&self, session_id: u64) -> bool {
        matches!(
            self.sessions.read().await.get(&session_id),
            Some(CacheEntry::Loaded { .. })
        )
    }

    pub async fn add_session(&self, session: Session) {
        self.sessions.write().await.insert(
            session.session_id,
            CacheEntry::Loaded {
                value: session,
                expires_at: None,
            },
        );
    }

    pub async fn delete_session(&self, session_id: u64) {
        self.sessions.write().await.remove(&session_id);
    }

    /// Apply `mutate` to the cached session, loading it first if needed.
    pub async fn update_session<F, R>(&self, session_id: u64, mutate: F) -> Result<R, PipelineError>
    where
        F: FnOnce(&mut Session) -> R,
    {
        self.get_session(session_id).await?;
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session_id) {
            Some(CacheEntry::Loaded { value, .. }) => Ok(mutate(value)),
            _ => Err(PipelineError::NotFound { session_id }),
        }
    }

    pub async fn cached_sessions(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| matches!(entry, CacheEntry::Loaded { .. }))
            .count()
    }

    pub async fn get_project(&self, project_id: u32) -> Result<Project, PipelineError> {
        let now = self.clock.now();
        {
            let projects = self.projects.read().await;
            if let Some(entry) = projects.get(&project_id)
                && let Some(project) = entry.fresh(now)
            {
                return Ok(project.clone());
            }
        }

        let Some(project) = self.store.fetch_project(project_id).await? else {
            self.projects.write().await.remove(&project_id);
            return Err(PipelineError::ProjectNotFound { project_id });
        };

        self.projects
            .write()
            .await
            .insert(project_id, self.project_entry(&project, now));
        Ok(project)
    }

    /// Lookup by project key. Independent of the id index; the two may disagree
    /// until both entries expire.
    pub async fn get_project_by_key(&self, project_key: &str) -> Result<Project, PipelineError> {
        let now = self.clock.now();
        {
            let projects = self.projects_by_key.read().await;
            if let Some(entry) = projects.get(project_key)
                && let Some(project) = entry.fresh(now)
            {
                return Ok(project.clone());
            }
        }

        let Some(project) = self.store.fetch_project_by_key(project_key).await? else {
            self.projects_by_key.write().await.remove(project_key);
            return Err(PipelineError::ProjectKeyNotFound {
                project_key: project_key.to_string(),
            });
        };

        self.projects_by_key
            .write()
            .await
            .insert(project_key.to_string(), self.project_entry(&project, now));
        Ok(project)
    }

    fn project_entry(&self, project: &Project, now: DateTime<Utc>) -> CacheEntry<Project> {
        CacheEntry::Loaded {
            value: project.clone(),
            expires_at: Some(now + to_chrono(self.settings.project_ttl)),
        }
    }

    /// Write a metadata value into the slot its key maps to in the session's project.
    ///
    /// Unmapped keys are a no-op. A failed write is returned to the caller and
    /// scheduled for exactly one retry after the configured delay.
    pub async fn insert_metadata(
        &self,
        session_id: u64,
        key: &str,
        value: &str,
    ) -> Result<(), PipelineError> {
        let session = self.get_session(session_id).await?;
        let project = self.get_project(session.project_id).await?;

        let Some(slot) = project.metadata_slot(key) else {
            return Ok(());
        };

        match self.store.execute(&metadata_statement(session_id, slot, value)).await {
            Ok(_) => {
                self.set_cached_metadata(session_id, slot, value).await;
                Ok(())
            }
            Err(err) => {
                self.retries.schedule(MetadataRetry {
                    session_id,
                    slot,
                    value: value.to_string(),
                    due_at: self.clock.now() + to_chrono(self.settings.metadata_retry_delay),
                });
                Err(err.into())
            }
        }
    }

    /// Attempt every metadata retry that is due. Each retry runs once; a second
    /// failure is logged and dropped.
    pub async fn run_due_retries(&self) -> Vec<RetryOutcome> {
        let due = self.retries.take_due(self.clock.now());
        let mut outcomes = Vec::with_capacity(due.len());

        for retry in due {
            let statement = metadata_statement(retry.session_id, retry.slot, &retry.value);
            match self.store.execute(&statement).await {
                Ok(_) => {
                    self.set_cached_metadata(retry.session_id, retry.slot, &retry.value)
                        .await;
                    outcomes.push(RetryOutcome::Applied {
                        session_id: retry.session_id,
                        slot: retry.slot,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = retry.session_id,
                        slot = retry.slot,
                        error = %err,
                        "metadata retry failed; value dropped"
                    );
                    outcomes.push(RetryOutcome::Dropped {
                        session_id: retry.session_id,
                        slot: retry.slot,
                        error: err.to_string(),
                    });
                }
            }
        }
        outcomes
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    async fn set_cached_metadata(&self, session_id: u64, slot: u8, value: &str) {
        if let Some(CacheEntry::Loaded { value: session, .. }) =
            self.sessions.write().await.get_mut(&session_id)
        {
            session.set_metadata(slot, value);
        }
    }
}

fn metadata_statement(session_id: u64, slot: u8, value: &str) -> Statement {
    Statement::new(
        format!("UPDATE sessions SET metadata_{slot} = $1 WHERE session_id = $2"),
        vec![SqlParam::text(value), SqlParam::uint(session_id)],
    )
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 1_000))
}
