use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use replay_core::model::{Project, Session};

pub mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Positional parameter of a [`Statement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Int(i64),
    Text(Option<String>),
    Bool(bool),
}

impl SqlParam {
    /// Unsigned ids and timestamps are stored in BIGINT columns; values above
    /// `i64::MAX` keep their bit pattern.
    pub fn uint(value: u64) -> Self {
        SqlParam::Int(value as i64)
    }

    pub fn text(value: impl Into<String>) -> Self {
        SqlParam::Text(Some(value.into()))
    }

    pub fn null() -> Self {
        SqlParam::Text(None)
    }

    fn payload_size(&self) -> usize {
        match self {
            SqlParam::Int(_) => 8,
            SqlParam::Text(Some(value)) => value.len(),
            SqlParam::Text(None) => 0,
            SqlParam::Bool(_) => 1,
        }
    }
}

/// One SQL statement with its bound parameters, queued or executed as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: Cow<'static, str>,
    pub params: Vec<SqlParam>,
}

impl Statement {
    pub fn new(sql: impl Into<Cow<'static, str>>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Advisory byte size: statement text plus parameter payload.
    pub fn estimated_size(&self) -> usize {
        self.sql.len() + self.params.iter().map(SqlParam::payload_size).sum::<usize>()
    }
}

/// Relational store the pipeline writes to.
///
/// Every call is bounded by the store timeout; a timed-out call fails with
/// [`StoreError::Timeout`] instead of hanging the caller.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn fetch_session(&self, session_id: u64) -> Result<Option<Session>, StoreError>;

    async fn fetch_project(&self, project_id: u32) -> Result<Option<Project>, StoreError>;

    async fn fetch_project_by_key(&self, project_key: &str) -> Result<Option<Project>, StoreError>;

    /// Insert the session row. Returns false when a row for that id already exists.
    async fn insert_session(&self, session: &Session) -> Result<bool, StoreError>;

    /// Current duration of a stored session, 0 while unset. `None` when the row is missing.
    async fn session_duration(&self, session_id: u64) -> Result<Option<u64>, StoreError>;

    /// Set the duration from an end timestamp and return it. `None` when the row is missing.
    async fn end_session(&self, session_id: u64, timestamp: u64) -> Result<Option<u64>, StoreError>;

    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError>;

    /// Apply all statements atomically, in order.
    async fn execute_transaction(&self, statements: &[Statement]) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_size_counts_text_and_params() {
        let statement = Statement::new(
            "UPDATE sessions SET user_id = $1 WHERE session_id = $2",
            vec![SqlParam::text("user-7"), SqlParam::uint(42)],
        );
        assert_eq!(statement.estimated_size(), statement.sql.len() + 6 + 8);

        let statement = Statement::new("SELECT $1, $2", vec![SqlParam::null(), SqlParam::Bool(true)]);
        assert_eq!(statement.estimated_size(), "SELECT $1, $2".len() + 1);
    }

    #[test]
    fn uint_keeps_bit_pattern() {
        assert_eq!(SqlParam::uint(7), SqlParam::Int(7));
        assert_eq!(SqlParam::uint(u64::MAX), SqlParam::Int(-1));
    }
}
