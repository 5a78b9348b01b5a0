use replay_core::hashid::{issue_id, web_error_id};
use replay_core::messages::{ErrorEvent, IssueEvent};

use super::{Saver, json_or_null, seq_index};
use crate::error::PipelineError;
use crate::search::SearchIndexer;
use crate::store::{SqlParam, Statement, Store};

const ISSUE_SQL: &str = r#"
    INSERT INTO issues (project_id, issue_id, type, context_string, context)
    (SELECT project_id, $2, $3, $4, CAST($5 AS jsonb)
        FROM sessions
        WHERE session_id = $1)
    ON CONFLICT DO NOTHING
"#;

const ISSUE_OCCURRENCE_SQL: &str = r#"
    INSERT INTO events_common.issues (session_id, issue_id, timestamp, seq_index, payload)
    VALUES ($1, $2, $3, $4, CAST($5 AS jsonb))
"#;

const ISSUE_SCORE_SQL: &str = "UPDATE sessions SET issue_score = issue_score + $2 WHERE session_id = $1";

const CUSTOM_ISSUE_SQL: &str = r#"
    INSERT INTO events_common.customs (session_id, seq_index, timestamp, name, payload, level)
    VALUES ($1, $2, $3, left($4, 2700), $5, 'error')
"#;

const ERROR_SQL: &str = r#"
    INSERT INTO errors (error_id, project_id, source, name, message, payload)
    VALUES ($1, $2, $3, $4, $5, $6::jsonb)
    ON CONFLICT DO NOTHING
"#;

const ERROR_OCCURRENCE_SQL: &str = r#"
    INSERT INTO events.errors (session_id, message_id, timestamp, error_id)
    VALUES ($1, $2, $3, $4)
"#;

const ERROR_COUNTERS_SQL: &str = r#"
    UPDATE sessions SET errors_count = errors_count + 1, issue_score = issue_score + 1000
    WHERE session_id = $1
"#;

/// Severity weight added to a session's issue score.
pub fn issue_score(issue_type: &str) -> i64 {
    match issue_type {
        "crash" | "dead_click" | "memory" | "cpu" => 1000,
        "bad_request" | "excessive_scrolling" | "click_rage" | "missing_resource" => 500,
        "slow_session" | "slow_page_load" => 100,
        _ => 0,
    }
}

impl<S: Store, I: SearchIndexer> Saver<S, I> {
    /// Issue definition, occurrence and score land together or not at all.
    pub(super) async fn issue(&self, session_id: u64, issue: &IssueEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        let id = issue_id(session.project_id, issue);
        let score = issue_score(&issue.kind);

        let mut statements = vec![
            Statement::new(
                ISSUE_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::text(id.as_str()),
                    SqlParam::text(issue.kind.as_str()),
                    SqlParam::text(issue.context_string.as_str()),
                    json_or_null(&issue.context),
                ],
            ),
            Statement::new(
                ISSUE_OCCURRENCE_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::text(id.as_str()),
                    SqlParam::uint(issue.timestamp),
                    seq_index(issue.message_id),
                    json_or_null(&issue.payload),
                ],
            ),
            Statement::new(
                ISSUE_SCORE_SQL,
                vec![SqlParam::uint(session_id), SqlParam::Int(score)],
            ),
        ];
        if issue.kind == "custom" {
            statements.push(Statement::new(
                CUSTOM_ISSUE_SQL,
                vec![
                    SqlParam::uint(session_id),
                    seq_index(issue.message_id),
                    SqlParam::uint(issue.timestamp),
                    SqlParam::text(issue.context_string.as_str()),
                    SqlParam::text(issue.payload.as_str()),
                ],
            ));
        }

        self.cache
            .store()
            .execute_transaction(&statements)
            .await
            .map_err(|source| PipelineError::Transaction { session_id, source })?;

        self.cache
            .update_session(session_id, |s| s.add_issue(&issue.kind, score))
            .await
    }

    /// Error definition, occurrence and session counters land together or not at all.
    pub(super) async fn error(&self, session_id: u64, error: &ErrorEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        let id = web_error_id(session.project_id, error);

        let statements = [
            Statement::new(
                ERROR_SQL,
                vec![
                    SqlParam::text(id.as_str()),
                    SqlParam::Int(i64::from(session.project_id)),
                    SqlParam::text(error.source.as_str()),
                    SqlParam::text(error.name.as_str()),
                    SqlParam::text(error.message.as_str()),
                    json_or_null(&error.payload),
                ],
            ),
            Statement::new(
                ERROR_OCCURRENCE_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::uint(error.message_id),
                    SqlParam::uint(error.timestamp),
                    SqlParam::text(id.as_str()),
                ],
            ),
            Statement::new(ERROR_COUNTERS_SQL, vec![SqlParam::uint(session_id)]),
        ];

        self.cache
            .store()
            .execute_transaction(&statements)
            .await
            .map_err(|source| PipelineError::Transaction { session_id, source })?;

        self.cache
            .update_session(session_id, |s| s.add_error())
            .await
    }
}
