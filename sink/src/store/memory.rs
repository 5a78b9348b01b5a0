use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use replay_core::model::{Project, Session};

use super::{Statement, Store, StoreError};

/// In-memory [`Store`] for tests. Records every committed write and can be
/// told to fail upcoming calls.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u64, Session>,
    projects: HashMap<u32, Project>,
    transactions: Vec<Vec<Statement>>,
    failing_writes: usize,
    failing_reads: usize,
    failing_sql: Option<String>,
    session_fetches: usize,
    project_fetches: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, project: Project) -> Self {
        self.put_project(project);
        self
    }

    pub fn put_project(&self, project: Project) {
        let mut inner = self.inner.lock().unwrap();
        inner.projects.insert(project.project_id, project);
    }

    pub fn put_session(&self, session: Session) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(session.session_id, session);
    }

    pub fn stored_session(&self, session_id: u64) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(&session_id).cloned()
    }

    /// The next `count` write calls fail.
    pub fn fail_writes(&self, count: usize) {
        self.inner.lock().unwrap().failing_writes = count;
    }

    /// The next `count` read calls fail.
    pub fn fail_reads(&self, count: usize) {
        self.inner.lock().unwrap().failing_reads = count;
    }

    /// Every write containing a statement with this SQL fragment fails until cleared.
    pub fn fail_sql_containing(&self, fragment: Option<&str>) {
        self.inner.lock().unwrap().failing_sql = fragment.map(str::to_string);
    }

    /// Committed units of work, in commit order. A single `execute` is a unit of one.
    pub fn transactions(&self) -> Vec<Vec<Statement>> {
        self.inner.lock().unwrap().transactions.clone()
    }

    /// Committed statements flattened in commit order.
    pub fn executed(&self) -> Vec<Statement> {
        self.transactions().into_iter().flatten().collect()
    }

    pub fn session_fetches(&self) -> usize {
        self.inner.lock().unwrap().session_fetches
    }

    pub fn project_fetches(&self) -> usize {
        self.inner.lock().unwrap().project_fetches
    }
}

impl Inner {
    fn take_read_failure(&mut self) -> Result<(), StoreError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }

    fn take_write_failure(&mut self, statements: &[Statement]) -> Result<(), StoreError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        if let Some(fragment) = &self.failing_sql
            && statements.iter().any(|s| s.sql.contains(fragment.as_str()))
        {
            return Err(StoreError::Unavailable(format!("injected failure on '{fragment}'")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_session(&self, session_id: u64) -> Result<Option<Session>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.session_fetches += 1;
        inner.take_read_failure()?;
        Ok(inner.sessions.get(&session_id).cloned())
    }

    async fn fetch_project(&self, project_id: u32) -> Result<Option<Project>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.project_fetches += 1;
        inner.take_read_failure()?;
        Ok(inner.projects.get(&project_id).cloned())
    }

    async fn fetch_project_by_key(&self, project_key: &str) -> Result<Option<Project>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.project_fetches += 1;
        inner.take_read_failure()?;
        Ok(inner
            .projects
            .values()
            .find(|p| p.project_key == project_key)
            .cloned())
    }

    async fn insert_session(&self, session: &Session) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure(&[])?;
        if inner.sessions.contains_key(&session.session_id) {
            return Ok(false);
        }
        inner.sessions.insert(session.session_id, session.clone());
        Ok(true)
    }

    async fn session_duration(&self, session_id: u64) -> Result<Option<u64>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_read_failure()?;
        Ok(inner
            .sessions
            .get(&session_id)
            .map(|s| s.duration.unwrap_or(0)))
    }

    async fn end_session(&self, session_id: u64, timestamp: u64) -> Result<Option<u64>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure(&[])?;
        Ok(inner.sessions.get_mut(&session_id).map(|session| {
            let duration = timestamp.saturating_sub(session.start_ts);
            session.duration = Some(duration);
            duration
        }))
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure(std::slice::from_ref(statement))?;
        inner.transactions.push(vec![statement.clone()]);
        Ok(1)
    }

    async fn execute_transaction(&self, statements: &[Statement]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure(statements)?;
        inner.transactions.push(statements.to_vec());
        Ok(())
    }
}
