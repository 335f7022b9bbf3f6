//! The canonical event model (spec.md §3): the nine event types every
//! backend is normalized into, plus the namespaced extension-event escape
//! hatch and the session-id generator.

use std::borrow::Cow;
use std::convert::Infallible;

use serde::{Deserialize, Serialize};

/// The `type` tag of a canonical [`Event`].
///
/// Canonical kinds serialize to their snake_case name. An `Extension` kind
/// serializes to `"<backend-id>:<name>"` and round-trips through any string
/// containing a colon that doesn't match one of the nine canonical names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Init,
    Text,
    TextDelta,
    Thinking,
    ToolUse,
    ToolResult,
    PermissionRequest,
    Error,
    Done,
    /// `<backend-id>:<name>` — never terminal, never synthesized by a driver.
    Extension(String),
}

impl EventType {
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            EventType::Init => Cow::Borrowed("init"),
            EventType::Text => Cow::Borrowed("text"),
            EventType::TextDelta => Cow::Borrowed("text_delta"),
            EventType::Thinking => Cow::Borrowed("thinking"),
            EventType::ToolUse => Cow::Borrowed("tool_use"),
            EventType::ToolResult => Cow::Borrowed("tool_result"),
            EventType::PermissionRequest => Cow::Borrowed("permission_request"),
            EventType::Error => Cow::Borrowed("error"),
            EventType::Done => Cow::Borrowed("done"),
            EventType::Extension(full) => Cow::Borrowed(full.as_str()),
        }
    }

    /// Build an extension event type `<backend_id>:<name>`.
    pub fn extension(backend_id: &str, name: &str) -> Self {
        EventType::Extension(format!("{backend_id}:{name}"))
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, EventType::Extension(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Done)
    }

    fn parse(s: &str) -> Self {
        match s {
            "init" => EventType::Init,
            "text" => EventType::Text,
            "text_delta" => EventType::TextDelta,
            "thinking" => EventType::Thinking,
            "tool_use" => EventType::ToolUse,
            "tool_result" => EventType::ToolResult,
            "permission_request" => EventType::PermissionRequest,
            "error" => EventType::Error,
            "done" => EventType::Done,
            other => EventType::Extension(other.to_string()),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().into_owned()
    }
}

impl TryFrom<String> for EventType {
    type Error = Infallible;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(EventType::parse(&value))
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::parse(&s))
    }
}

/// A single canonical event. See spec.md §3 for the field contract.
///
/// Wire field names follow the caller-facing shape from spec.md §6's
/// `is_event_shape` check (`agent`, `sessionId`) rather than this crate's
/// internal snake_case naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "agent")]
    pub backend_id: String,
    /// Milliseconds since the Unix epoch. Nondecreasing within a session.
    pub timestamp: i64,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Value>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Construct an event from its parts. `payload` is any `Serialize` type;
    /// conversion to `Value` is infallible for the plain-data payload structs
    /// this crate defines, so this never fails in practice.
    pub fn new(
        event_type: EventType,
        backend_id: impl Into<String>,
        session_id: impl Into<String>,
        timestamp: i64,
        payload: impl Serialize,
    ) -> Self {
        Event {
            event_type,
            backend_id: backend_id.into(),
            timestamp,
            session_id: session_id.into(),
            metadata: None,
            payload: serde_json::to_value(payload)
                .expect("event payload is plain serializable data"),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

/// Generate a globally-unique, opaque session id.
///
/// Per spec.md §1, the session-id generator itself is an external
/// collaborator whose uniqueness guarantee is assumed; this wraps `uuid` v4.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Runtime shape check for an arbitrary [`serde_json::Value`], per spec.md §6:
/// requires `type: string`, `agent: string`, `timestamp: number`,
/// `sessionId: string`, and the presence (any shape) of `payload`.
pub fn is_event_shape(value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("type").is_some_and(|v| v.is_string())
        && obj.get("agent").is_some_and(|v| v.is_string())
        && obj.get("timestamp").is_some_and(|v| v.is_number())
        && obj.get("sessionId").is_some_and(|v| v.is_string())
        && obj.contains_key("payload")
}

/// Error codes synthesized by the drivers and backends (spec.md §7).
pub mod codes {
    pub const ADAPTER_ERROR: &str = "ADAPTER_ERROR";
    pub const MISSING_DONE: &str = "MISSING_DONE";
    pub const NDJSON_PARSE_ERROR: &str = "NDJSON_PARSE_ERROR";
    pub const OPENCODE_SERVER_EXIT: &str = "OPENCODE_SERVER_EXIT";
    pub const MISSING_SESSION_IDLE: &str = "MISSING_SESSION_IDLE";
    pub const MISSING_TURN_DONE: &str = "MISSING_TURN_DONE";
    pub const MISSING_RESULT: &str = "MISSING_RESULT";
    pub const SDK_STREAM_ERROR: &str = "SDK_STREAM_ERROR";
    pub const GEMINI_STREAM_ERROR: &str = "GEMINI_STREAM_ERROR";
    pub const OPENCODE_STREAM_ERROR: &str = "OPENCODE_STREAM_ERROR";
}

// ─── Payload shapes (spec.md §3) ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPayload {
    pub model: String,
    pub working_directory: String,
    pub tool_list: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub capabilities: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDeltaPayload {
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingPayload {
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsePayload {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Error,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_use_id: String,
    pub tool_name: String,
    pub status: ToolResultStatus,
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequestPayload {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    Success,
    Error,
    Interrupted,
    MaxTurns,
    MaxBudget,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_uses: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_cost_usd: Option<f64>,
}

impl Usage {
    pub fn zeroed() -> Self {
        Usage::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonePayload {
    pub status: DoneStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_text: Option<String>,
    pub usage: Usage,
    pub duration_ms: u64,
}
