use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::messages::SessionStart;

/// Number of generic metadata slots a project can map.
pub const METADATA_SLOTS: usize = 10;

/// Live state of one recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: u64,
    pub project_id: u32,
    pub platform: String,
    /// Start timestamp in epoch milliseconds
    pub start_ts: u64,
    /// Set once the session has ended
    pub duration: Option<u64>,
    pub tracker_version: String,
    pub rev_id: Option<String>,
    pub user_uuid: String,
    pub user_agent: Option<String>,
    pub user_os: String,
    pub user_os_version: Option<String>,
    pub user_browser: Option<String>,
    pub user_browser_version: Option<String>,
    pub user_device: String,
    pub user_device_type: String,
    pub user_device_memory_size: u64,
    pub user_device_heap_size: u64,
    pub user_country: String,
    pub user_id: Option<String>,
    pub user_anonymous_id: Option<String>,
    pub referrer: Option<String>,
    /// Slot `n` (1..=10) lives at index `n - 1`
    pub metadata: [Option<String>; METADATA_SLOTS],
    pub pages_count: u64,
    pub events_count: u64,
    pub errors_count: u64,
    pub issue_score: i64,
    pub issue_types: BTreeSet<String>,
    /// Inherited from the project when the session is created or loaded
    pub save_request_payload: bool,
}

impl Session {
    /// Build the initial state of a session from its start message.
    pub fn from_start(session_id: u64, start: &SessionStart) -> Self {
        Session {
            session_id,
            project_id: start.project_id,
            platform: start.platform.clone(),
            start_ts: start.timestamp,
            tracker_version: start.tracker_version.clone(),
            rev_id: non_empty(&start.rev_id),
            user_uuid: start.user_uuid.clone(),
            user_agent: non_empty(&start.user_agent),
            user_os: start.user_os.clone(),
            user_os_version: non_empty(&start.user_os_version),
            user_browser: non_empty(&start.user_browser),
            user_browser_version: non_empty(&start.user_browser_version),
            user_device: start.user_device.clone(),
            user_device_type: start.user_device_type.clone(),
            user_device_memory_size: start.user_device_memory_size,
            user_device_heap_size: start.user_device_heap_size,
            user_country: start.user_country.clone(),
            user_id: non_empty(&start.user_id),
            ..Session::default()
        }
    }

    pub fn is_web(&self) -> bool {
        self.platform == "web"
    }

    /// Store a metadata value. Slots outside 1..=10 are ignored.
    pub fn set_metadata(&mut self, slot: u8, value: &str) {
        if let Some(entry) = slot
            .checked_sub(1)
            .and_then(|index| self.metadata.get_mut(usize::from(index)))
        {
            *entry = Some(value.to_string());
        }
    }

    pub fn metadata(&self, slot: u8) -> Option<&str> {
        let index = usize::from(slot.checked_sub(1)?);
        self.metadata.get(index)?.as_deref()
    }

    pub fn add_events(&mut self, pages: u64, events: u64) {
        self.pages_count += pages;
        self.events_count += events;
    }

    /// Issue scores only grow during the session's lifetime.
    pub fn add_issue(&mut self, issue_type: &str, score: i64) {
        self.issue_score += score.max(0);
        self.issue_types.insert(issue_type.to_string());
    }

    pub fn add_error(&mut self) {
        self.errors_count += 1;
        self.issue_score += 1000;
    }
}

/// Tenant configuration, read-only from the pipeline's side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: u32,
    pub project_key: String,
    /// Maximum session duration in milliseconds
    pub max_session_duration: i64,
    pub sample_rate: u8,
    pub save_request_payloads: bool,
    /// Human-readable name of metadata slot `n` lives at index `n - 1`
    pub metadata_names: [Option<String>; METADATA_SLOTS],
}

impl Project {
    /// Resolve a metadata key to its slot ordinal (1..=10). `None` means the key is unmapped.
    pub fn metadata_slot(&self, key: &str) -> Option<u8> {
        self.metadata_names
            .iter()
            .position(|name| name.as_deref() == Some(key))
            .and_then(|index| u8::try_from(index + 1).ok())
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
