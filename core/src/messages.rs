use serde::{Deserialize, Serialize};

/// One tracker event as carried on the bus.
///
/// The set of kinds is closed: every kind has a handler in the sink, and
/// adding a variant here without one fails to compile there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    SessionStart(SessionStart),
    SessionEnd(SessionEnd),
    UserId(UserId),
    UserAnonymousId(UserAnonymousId),
    Metadata(Metadata),
    IssueEvent(IssueEvent),
    CustomEvent(CustomEvent),
    ClickEvent(ClickEvent),
    InputEvent(InputEvent),
    PageEvent(PageEvent),
    ErrorEvent(ErrorEvent),
    FetchEvent(FetchEvent),
    #[serde(rename = "graphql_event")]
    GraphQlEvent(GraphQlEvent),
    IntegrationEvent(IntegrationEvent),
}

impl Message {
    /// Stable name of the kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SessionStart(_) => "session_start",
            Message::SessionEnd(_) => "session_end",
            Message::UserId(_) => "user_id",
            Message::UserAnonymousId(_) => "user_anonymous_id",
            Message::Metadata(_) => "metadata",
            Message::IssueEvent(_) => "issue_event",
            Message::CustomEvent(_) => "custom_event",
            Message::ClickEvent(_) => "click_event",
            Message::InputEvent(_) => "input_event",
            Message::PageEvent(_) => "page_event",
            Message::ErrorEvent(_) => "error_event",
            Message::FetchEvent(_) => "fetch_event",
            Message::GraphQlEvent(_) => "graphql_event",
            Message::IntegrationEvent(_) => "integration_event",
        }
    }

    /// Tracker-side timestamp in epoch milliseconds. Zero means the tracker did not set one.
    pub fn timestamp(&self) -> u64 {
        match self {
            Message::SessionStart(m) => m.timestamp,
            Message::SessionEnd(m) => m.timestamp,
            Message::UserId(m) => m.timestamp,
            Message::UserAnonymousId(m) => m.timestamp,
            Message::Metadata(m) => m.timestamp,
            Message::IssueEvent(m) => m.timestamp,
            Message::CustomEvent(m) => m.timestamp,
            Message::ClickEvent(m) => m.timestamp,
            Message::InputEvent(m) => m.timestamp,
            Message::PageEvent(m) => m.timestamp,
            Message::ErrorEvent(m) => m.timestamp,
            Message::FetchEvent(m) => m.timestamp,
            Message::GraphQlEvent(m) => m.timestamp,
            Message::IntegrationEvent(m) => m.timestamp,
        }
    }

    /// SessionStart and SessionEnd do not count as session activity.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Message::SessionStart(_) | Message::SessionEnd(_))
    }
}

/// First message of a recording. Creates the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub timestamp: u64,
    pub project_id: u32,
    #[serde(default = "default_platform")]
    pub platform: String,
    pub tracker_version: String,
    #[serde(default)]
    pub rev_id: String,
    pub user_uuid: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub user_os: String,
    #[serde(default)]
    pub user_os_version: String,
    #[serde(default)]
    pub user_browser: String,
    #[serde(default)]
    pub user_browser_version: String,
    #[serde(default)]
    pub user_device: String,
    #[serde(default)]
    pub user_device_type: String,
    #[serde(default)]
    pub user_device_memory_size: u64,
    #[serde(default)]
    pub user_device_heap_size: u64,
    #[serde(default)]
    pub user_country: String,
    #[serde(default)]
    pub user_id: String,
}

fn default_platform() -> String {
    "web".to_string()
}

/// End of a recording, either sent upstream or synthesized after inactivity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserId {
    #[serde(default)]
    pub timestamp: u64,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserAnonymousId {
    #[serde(default)]
    pub timestamp: u64,
    pub id: String,
}

/// A project-defined key/value pair attached to the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub timestamp: u64,
    pub key: String,
    pub value: String,
}

/// A detected problem (click rage, dead click, slow page load, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueEvent {
    pub message_id: u64,
    pub timestamp: u64,
    #[serde(rename = "issue_type")]
    pub kind: String,
    #[serde(default)]
    pub context_string: String,
    /// JSON text; empty or `{}` is stored as NULL
    #[serde(default)]
    pub context: String,
    /// JSON text; empty or `{}` is stored as NULL
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub name: String,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub message_id: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub label: String,
    pub selector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    pub message_id: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub value_masked: bool,
}

/// Page navigation with its navigation-timing breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub url: String,
    pub referrer: String,
    pub loaded: bool,
    pub request_start: u64,
    pub response_start: u64,
    pub response_end: u64,
    pub dom_content_loaded_event_start: u64,
    pub dom_content_loaded_event_end: u64,
    pub load_event_start: u64,
    pub load_event_end: u64,
    pub first_paint: u64,
    pub first_contentful_paint: u64,
    pub speed_index: u64,
    pub visually_complete: u64,
    pub time_to_interactive: u64,
}

impl PageEvent {
    /// Server response time; zero when the timing marks are out of order.
    pub fn response_time(&self) -> u64 {
        if self.response_start <= self.response_end {
            self.response_end - self.response_start
        } else {
            0
        }
    }

    /// Time spent building the DOM after the response; zero when out of order.
    pub fn dom_building_time(&self) -> u64 {
        if self.response_end <= self.dom_content_loaded_event_start {
            self.dom_content_loaded_event_start - self.response_end
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub source: String,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub response: String,
    pub status: u64,
    #[serde(default)]
    pub duration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub operation_kind: String,
    pub operation_name: String,
    #[serde(default)]
    pub variables: String,
    #[serde(default)]
    pub response: String,
}

/// An error reported by a third-party integration (Sentry, Datadog, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub source: String,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub payload: String,
}

impl From<&IntegrationEvent> for ErrorEvent {
    fn from(event: &IntegrationEvent) -> Self {
        ErrorEvent {
            message_id: event.message_id,
            timestamp: event.timestamp,
            source: event.source.clone(),
            name: event.name.clone(),
            message: event.message.clone(),
            payload: event.payload.clone(),
        }
    }
}

/// Encode one bus record: every message of the record belongs to the same session.
pub fn encode_batch(messages: &[Message]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(messages)
}

/// A decoded bus record. Elements that did not decode are listed in
/// `skipped` and do not stop the rest of the record.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub messages: Vec<Message>,
    pub skipped: Vec<SkippedMessage>,
}

#[derive(Debug)]
pub struct SkippedMessage {
    /// Raw `type` field, or `"unknown"` when the element has none.
    pub kind: String,
    pub error: serde_json::Error,
}

/// Decode one bus record. Only a payload that is not a JSON array fails as a whole.
pub fn decode_batch(payload: &[u8]) -> Result<DecodedBatch, serde_json::Error> {
    let elements: Vec<serde_json::Value> = serde_json::from_slice(payload)?;
    let mut batch = DecodedBatch::default();
    for element in elements {
        let kind = element
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        match serde_json::from_value::<Message>(element) {
            Ok(message) => batch.messages.push(message),
            Err(error) => batch.skipped.push(SkippedMessage { kind, error }),
        }
    }
    Ok(batch)
}
