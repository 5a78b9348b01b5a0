use replay_core::messages::{SessionEnd, SessionStart};
use replay_core::model::Session;

use super::{Saver, autocomplete_type};
use crate::error::PipelineError;
use crate::search::SearchIndexer;
use crate::store::{SqlParam, Statement, Store};

const ISSUE_TYPES_SQL: &str = r#"
    UPDATE sessions
    SET issue_types = (
        SELECT CASE WHEN errors_count > 0 THEN
            (COALESCE(ARRAY_AGG(DISTINCT ps.type), '{}') || 'js_exception'::issue_type)::issue_type[]
        ELSE
            (COALESCE(ARRAY_AGG(DISTINCT ps.type), '{}'))::issue_type[]
        END
        FROM events_common.issues
        INNER JOIN issues AS ps USING (issue_id)
        WHERE session_id = $1
    )
    WHERE session_id = $1
"#;

impl<S: Store, I: SearchIndexer> Saver<S, I> {
    pub(super) async fn session_start(
        &self,
        session_id: u64,
        start: &SessionStart,
    ) -> Result<(), PipelineError> {
        if self.cache.has_session(session_id).await {
            return Err(PipelineError::DuplicateSession { session_id });
        }

        let project = self.cache.get_project(start.project_id).await?;
        let mut session = Session::from_start(session_id, start);
        session.save_request_payload = project.save_request_payloads;

        if !self.cache.store().insert_session(&session).await? {
            tracing::debug!(session_id, "session row already stored; replayed start");
        }
        self.cache.add_session(session.clone()).await;

        let project_id = session.project_id;
        let platform = session.platform.as_str();
        self.autocomplete(session_id, project_id, &autocomplete_type("USEROS", platform), &session.user_os)
            .await;
        self.autocomplete(session_id, project_id, &autocomplete_type("USERDEVICE", platform), &session.user_device)
            .await;
        self.autocomplete(session_id, project_id, &autocomplete_type("USERCOUNTRY", platform), &session.user_country)
            .await;
        self.autocomplete(
            session_id,
            project_id,
            &autocomplete_type("REVID", platform),
            session.rev_id.as_deref().unwrap_or_default(),
        )
        .await;
        self.autocomplete(
            session_id,
            project_id,
            "USERBROWSER",
            session.user_browser.as_deref().unwrap_or_default(),
        )
        .await;
        Ok(())
    }

    /// Persist the end of a session, then evict it from the cache.
    pub(super) async fn session_end(&self, session_id: u64, end: &SessionEnd) -> Result<(), PipelineError> {
        // Pending writes must land before issue types are computed.
        if let Err(err) = self.batches.flush(session_id).await {
            tracing::warn!(session_id, error = %err, "flush before session end failed");
        }

        // Without the current duration a replayed end cannot be told apart from a new one.
        let store = self.cache.store();
        let previous = store.session_duration(session_id).await?.unwrap_or(0);

        let Some(duration) = store.end_session(session_id, end.timestamp).await? else {
            return Err(PipelineError::NotFound { session_id });
        };
        if duration == previous {
            self.cache.delete_session(session_id).await;
            return Err(PipelineError::DuplicateSessionEnd {
                session_id,
                duration,
            });
        }

        store
            .execute(&Statement::new(ISSUE_TYPES_SQL, vec![SqlParam::uint(session_id)]))
            .await?;
        self.cache.delete_session(session_id).await;
        tracing::debug!(session_id, duration, "session ended");
        Ok(())
    }

    pub(super) async fn user_id(&self, session_id: u64, user_id: &str) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        self.queue(
            session_id,
            Statement::new(
                "UPDATE sessions SET user_id = $1 WHERE session_id = $2",
                vec![SqlParam::text(user_id), SqlParam::uint(session_id)],
            ),
        )
        .await;
        self.cache
            .update_session(session_id, |s| s.user_id = Some(user_id.to_string()))
            .await?;
        self.autocomplete(session_id, session.project_id, "USERID", user_id)
            .await;
        Ok(())
    }

    pub(super) async fn user_anonymous_id(
        &self,
        session_id: u64,
        anonymous_id: &str,
    ) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        self.queue(
            session_id,
            Statement::new(
                "UPDATE sessions SET user_anonymous_id = $1 WHERE session_id = $2",
                vec![SqlParam::text(anonymous_id), SqlParam::uint(session_id)],
            ),
        )
        .await;
        self.cache
            .update_session(session_id, |s| {
                s.user_anonymous_id = Some(anonymous_id.to_string())
            })
            .await?;
        self.autocomplete(session_id, session.project_id, "USERANONYMOUSID", anonymous_id)
            .await;
        Ok(())
    }
}
