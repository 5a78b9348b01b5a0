use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use replay_core::model::{METADATA_SLOTS, Project, Session};
use sqlx::PgPool;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

use super::{SqlParam, Statement, Store, StoreError};

/// Postgres-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn timed<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: i64,
    project_id: i32,
    platform: String,
    start_ts: i64,
    duration: Option<i64>,
    tracker_version: String,
    rev_id: Option<String>,
    user_uuid: String,
    user_agent: Option<String>,
    user_os: String,
    user_os_version: Option<String>,
    user_browser: Option<String>,
    user_browser_version: Option<String>,
    user_device: String,
    user_device_type: String,
    user_device_memory_size: i64,
    user_device_heap_size: i64,
    user_country: String,
    user_id: Option<String>,
    user_anonymous_id: Option<String>,
    referrer: Option<String>,
    metadata_1: Option<String>,
    metadata_2: Option<String>,
    metadata_3: Option<String>,
    metadata_4: Option<String>,
    metadata_5: Option<String>,
    metadata_6: Option<String>,
    metadata_7: Option<String>,
    metadata_8: Option<String>,
    metadata_9: Option<String>,
    metadata_10: Option<String>,
    pages_count: i64,
    events_count: i64,
    errors_count: i64,
    issue_score: i64,
    issue_types: Vec<String>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            session_id: row.session_id as u64,
            project_id: row.project_id as u32,
            platform: row.platform,
            start_ts: row.start_ts.max(0) as u64,
            duration: row.duration.map(|d| d.max(0) as u64),
            tracker_version: row.tracker_version,
            rev_id: row.rev_id,
            user_uuid: row.user_uuid,
            user_agent: row.user_agent,
            user_os: row.user_os,
            user_os_version: row.user_os_version,
            user_browser: row.user_browser,
            user_browser_version: row.user_browser_version,
            user_device: row.user_device,
            user_device_type: row.user_device_type,
            user_device_memory_size: row.user_device_memory_size.max(0) as u64,
            user_device_heap_size: row.user_device_heap_size.max(0) as u64,
            user_country: row.user_country,
            user_id: row.user_id,
            user_anonymous_id: row.user_anonymous_id,
            referrer: row.referrer,
            metadata: [
                row.metadata_1,
                row.metadata_2,
                row.metadata_3,
                row.metadata_4,
                row.metadata_5,
                row.metadata_6,
                row.metadata_7,
                row.metadata_8,
                row.metadata_9,
                row.metadata_10,
            ],
            pages_count: row.pages_count.max(0) as u64,
            events_count: row.events_count.max(0) as u64,
            errors_count: row.errors_count.max(0) as u64,
            issue_score: row.issue_score,
            issue_types: row.issue_types.into_iter().collect(),
            save_request_payload: false,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    project_id: i32,
    project_key: String,
    max_session_duration: i64,
    sample_rate: i16,
    save_request_payloads: bool,
    metadata_1: Option<String>,
    metadata_2: Option<String>,
    metadata_3: Option<String>,
    metadata_4: Option<String>,
    metadata_5: Option<String>,
    metadata_6: Option<String>,
    metadata_7: Option<String>,
    metadata_8: Option<String>,
    metadata_9: Option<String>,
    metadata_10: Option<String>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        let metadata_names: [Option<String>; METADATA_SLOTS] = [
            row.metadata_1,
            row.metadata_2,
            row.metadata_3,
            row.metadata_4,
            row.metadata_5,
            row.metadata_6,
            row.metadata_7,
            row.metadata_8,
            row.metadata_9,
            row.metadata_10,
        ];
        Project {
            project_id: row.project_id as u32,
            project_key: row.project_key,
            max_session_duration: row.max_session_duration,
            sample_rate: row.sample_rate.clamp(0, 100) as u8,
            save_request_payloads: row.save_request_payloads,
            metadata_names,
        }
    }
}

const SELECT_SESSION: &str = r#"
    SELECT session_id, project_id, platform, start_ts, duration,
        tracker_version, rev_id, user_uuid, user_agent,
        user_os, user_os_version, user_browser, user_browser_version,
        COALESCE(user_device, '') AS user_device,
        COALESCE(user_device_type, '') AS user_device_type,
        COALESCE(user_device_memory_size, 0)::bigint AS user_device_memory_size,
        COALESCE(user_device_heap_size, 0)::bigint AS user_device_heap_size,
        COALESCE(user_country, '') AS user_country,
        user_id, user_anonymous_id, referrer,
        metadata_1, metadata_2, metadata_3, metadata_4, metadata_5,
        metadata_6, metadata_7, metadata_8, metadata_9, metadata_10,
        COALESCE(pages_count, 0)::bigint AS pages_count,
        COALESCE(events_count, 0)::bigint AS events_count,
        COALESCE(errors_count, 0)::bigint AS errors_count,
        COALESCE(issue_score, 0)::bigint AS issue_score,
        COALESCE(issue_types, '{}')::text[] AS issue_types
    FROM sessions
    WHERE session_id = $1
"#;

const SELECT_PROJECT: &str = r#"
    SELECT project_id, project_key,
        COALESCE(max_session_duration, 7200000)::bigint AS max_session_duration,
        COALESCE(sample_rate, 100)::smallint AS sample_rate,
        save_request_payloads,
        metadata_1, metadata_2, metadata_3, metadata_4, metadata_5,
        metadata_6, metadata_7, metadata_8, metadata_9, metadata_10
    FROM projects
"#;

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Int(value) => query.bind(*value),
            SqlParam::Text(value) => query.bind(value.as_deref()),
            SqlParam::Bool(value) => query.bind(*value),
        };
    }
    query
}

#[async_trait]
impl Store for PgStore {
    async fn fetch_session(&self, session_id: u64) -> Result<Option<Session>, StoreError> {
        let row = self
            .timed(
                sqlx::query_as::<_, SessionRow>(SELECT_SESSION)
                    .bind(session_id as i64)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(Session::from))
    }

    async fn fetch_project(&self, project_id: u32) -> Result<Option<Project>, StoreError> {
        let sql = format!("{SELECT_PROJECT} WHERE project_id = $1 AND deleted_at IS NULL");
        let row = self
            .timed(
                sqlx::query_as::<_, ProjectRow>(&sql)
                    .bind(project_id as i32)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(Project::from))
    }

    async fn fetch_project_by_key(&self, project_key: &str) -> Result<Option<Project>, StoreError> {
        let sql = format!("{SELECT_PROJECT} WHERE project_key = $1 AND deleted_at IS NULL");
        let row = self
            .timed(
                sqlx::query_as::<_, ProjectRow>(&sql)
                    .bind(project_key)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(Project::from))
    }

    async fn insert_session(&self, session: &Session) -> Result<bool, StoreError> {
        let result = self
            .timed(
                sqlx::query(
                    r#"
                    INSERT INTO sessions (
                        session_id, project_id, start_ts,
                        user_uuid, user_device, user_device_type, user_country,
                        user_os, user_os_version,
                        rev_id,
                        tracker_version, issue_score,
                        platform,
                        user_agent, user_browser, user_browser_version,
                        user_device_memory_size, user_device_heap_size,
                        user_id
                    ) VALUES (
                        $1, $2, $3,
                        $4, $5, $6, $7,
                        $8, $9,
                        $10,
                        $11, $12,
                        $13,
                        $14, $15, $16,
                        NULLIF($17, 0), NULLIF($18, 0),
                        $19
                    )
                    ON CONFLICT (session_id) DO NOTHING
                    "#,
                )
                .bind(session.session_id as i64)
                .bind(session.project_id as i32)
                .bind(session.start_ts as i64)
                .bind(&session.user_uuid)
                .bind(&session.user_device)
                .bind(&session.user_device_type)
                .bind(&session.user_country)
                .bind(&session.user_os)
                .bind(session.user_os_version.as_deref())
                .bind(session.rev_id.as_deref())
                .bind(&session.tracker_version)
                .bind((session.start_ts / 1000) as i64)
                .bind(&session.platform)
                .bind(session.user_agent.as_deref())
                .bind(session.user_browser.as_deref())
                .bind(session.user_browser_version.as_deref())
                .bind(session.user_device_memory_size as i64)
                .bind(session.user_device_heap_size as i64)
                .bind(session.user_id.as_deref())
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn session_duration(&self, session_id: u64) -> Result<Option<u64>, StoreError> {
        let duration: Option<i64> = self
            .timed(
                sqlx::query_scalar(
                    "SELECT COALESCE(duration, 0)::bigint FROM sessions WHERE session_id = $1",
                )
                .bind(session_id as i64)
                .fetch_optional(&self.pool),
            )
            .await?;
        Ok(duration.map(|d| d.max(0) as u64))
    }

    async fn end_session(&self, session_id: u64, timestamp: u64) -> Result<Option<u64>, StoreError> {
        let duration: Option<i64> = self
            .timed(
                sqlx::query_scalar(
                    r#"
                    UPDATE sessions SET duration = $2 - start_ts
                    WHERE session_id = $1
                    RETURNING duration::bigint
                    "#,
                )
                .bind(session_id as i64)
                .bind(timestamp as i64)
                .fetch_optional(&self.pool),
            )
            .await?;
        Ok(duration.map(|d| d.max(0) as u64))
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        let result = self
            .timed(bind_params(sqlx::query(&statement.sql), &statement.params).execute(&self.pool))
            .await?;
        Ok(result.rows_affected())
    }

    async fn execute_transaction(&self, statements: &[Statement]) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        self.timed(async move {
            let mut tx = pool.begin().await?;
            for statement in statements {
                bind_params(sqlx::query(&statement.sql), &statement.params)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await
    }
}
