use sha2::{Digest, Sha256};

use crate::messages::{ErrorEvent, IssueEvent};

/// Deterministic id of an issue definition.
///
/// Format: project id in hex, then the SHA-256 hex digest of the issue type and
/// context string. Replaying the same issue yields the same id, so the
/// definition insert stays idempotent.
pub fn issue_id(project_id: u32, issue: &IssueEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(issue.kind.as_bytes());
    hasher.update(b"\0");
    hasher.update(issue.context_string.as_bytes());
    format!("{:x}{}", project_id, hex::encode(hasher.finalize()))
}

/// Deterministic id of a web error definition, from its source, name and message.
pub fn web_error_id(project_id: u32, error: &ErrorEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error.source.as_bytes());
    hasher.update(b"\0");
    hasher.update(error.name.as_bytes());
    hasher.update(b"\0");
    hasher.update(error.message.as_bytes());
    format!("{:x}{}", project_id, hex::encode(hasher.finalize()))
}
