//! Wire protocol types for the tether session-sync engine.
//!
//! Every frame on the socket is one JSON document:
//!
//! ```json
//! {"type": "streamData", "requestId": "req-1", "timestamp": "2026-01-30T12:00:00.000Z", "data": {}}
//! ```
//!
//! `data` is decoded into a closed [`Payload`] through a type-tag dispatch
//! table. Frames with a tag missing from the table decode to
//! [`ProtocolError::UnknownType`] so callers can ignore them without
//! treating the connection as broken.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod fragment;
pub mod push;
pub mod value;

pub use fragment::{FragmentKind, FragmentMetadata, StreamFragment};
pub use push::PushPayload;
pub use value::AnyValue;

pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Event classes requested by every subscribe.
pub const SUBSCRIBED_EVENTS: [&str; 5] = [
    "streamData",
    "streamComplete",
    "toolUse",
    "toolResult",
    "assistantMessage",
];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a valid envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unrecognized message type: {0}")]
    UnknownType(String),

    #[error("invalid `{type_tag}` payload: {source}")]
    Payload {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload bodies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub events: Vec<String>,
    pub session_ids: Vec<String>,
}

impl SubscribeRequest {
    pub fn for_sessions(session_ids: Vec<String>) -> Self {
        Self {
            events: SUBSCRIBED_EVENTS.iter().map(|e| e.to_string()).collect(),
            session_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub session_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribed {
    #[serde(default)]
    pub session_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCommand {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: String,
    #[serde(default = "default_history_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn default_history_role() -> String {
    "assistant".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistory {
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamData {
    pub session_id: String,
    pub fragment: StreamFragment,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamComplete {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CompletionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub session_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub input: AnyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub output: AnyValue,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload sum type and dispatch table
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    // Client → server
    Ping,
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    ChatCommand(ChatCommand),
    AbortSession(SessionRef),
    ClientBackgrounding,
    GetSessionHistory(HistoryRequest),

    // Server → client
    Welcome(Welcome),
    Pong,
    Subscribed(Subscribed),
    SessionStarted(SessionStarted),
    SessionClosed(SessionRef),
    StreamData(StreamData),
    StreamComplete(StreamComplete),
    ToolUse(ToolUse),
    ToolResult(ToolResult),
    AssistantMessage(AssistantMessage),
    SessionHistory(SessionHistory),
    Error(ErrorInfo),
}

pub type PayloadDecoder = fn(Value) -> Result<Payload, serde_json::Error>;

const DECODERS: &[(&str, PayloadDecoder)] = &[
    ("ping", |_| Ok(Payload::Ping)),
    ("subscribe", |data| {
        serde_json::from_value(data).map(Payload::Subscribe)
    }),
    ("unsubscribe", |data| {
        serde_json::from_value(data).map(Payload::Unsubscribe)
    }),
    ("chatCommand", |data| {
        serde_json::from_value(data).map(Payload::ChatCommand)
    }),
    ("abortSession", |data| {
        serde_json::from_value(data).map(Payload::AbortSession)
    }),
    ("clientBackgrounding", |_| Ok(Payload::ClientBackgrounding)),
    ("getSessionHistory", |data| {
        serde_json::from_value(data).map(Payload::GetSessionHistory)
    }),
    ("welcome", |data| {
        serde_json::from_value(data).map(Payload::Welcome)
    }),
    ("pong", |_| Ok(Payload::Pong)),
    ("subscribed", |data| {
        serde_json::from_value(data).map(Payload::Subscribed)
    }),
    ("sessionStarted", |data| {
        serde_json::from_value(data).map(Payload::SessionStarted)
    }),
    ("sessionClosed", |data| {
        serde_json::from_value(data).map(Payload::SessionClosed)
    }),
    ("streamData", |data| {
        serde_json::from_value(data).map(Payload::StreamData)
    }),
    ("streamComplete", |data| {
        serde_json::from_value(data).map(Payload::StreamComplete)
    }),
    ("toolUse", |data| {
        serde_json::from_value(data).map(Payload::ToolUse)
    }),
    ("toolResult", |data| {
        serde_json::from_value(data).map(Payload::ToolResult)
    }),
    ("assistantMessage", |data| {
        serde_json::from_value(data).map(Payload::AssistantMessage)
    }),
    ("sessionHistory", |data| {
        serde_json::from_value(data).map(Payload::SessionHistory)
    }),
    ("error", |data| serde_json::from_value(data).map(Payload::Error)),
];

pub fn decoder_for(type_tag: &str) -> Option<PayloadDecoder> {
    DECODERS
        .iter()
        .find(|(tag, _)| *tag == type_tag)
        .map(|(_, decoder)| *decoder)
}

impl Payload {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Payload::Ping => "ping",
            Payload::Subscribe(_) => "subscribe",
            Payload::Unsubscribe(_) => "unsubscribe",
            Payload::ChatCommand(_) => "chatCommand",
            Payload::AbortSession(_) => "abortSession",
            Payload::ClientBackgrounding => "clientBackgrounding",
            Payload::GetSessionHistory(_) => "getSessionHistory",
            Payload::Welcome(_) => "welcome",
            Payload::Pong => "pong",
            Payload::Subscribed(_) => "subscribed",
            Payload::SessionStarted(_) => "sessionStarted",
            Payload::SessionClosed(_) => "sessionClosed",
            Payload::StreamData(_) => "streamData",
            Payload::StreamComplete(_) => "streamComplete",
            Payload::ToolUse(_) => "toolUse",
            Payload::ToolResult(_) => "toolResult",
            Payload::AssistantMessage(_) => "assistantMessage",
            Payload::SessionHistory(_) => "sessionHistory",
            Payload::Error(_) => "error",
        }
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Ping | Payload::Pong | Payload::ClientBackgrounding => {
                Ok(Value::Object(Map::new()))
            }
            Payload::Subscribe(body) => serde_json::to_value(body),
            Payload::Unsubscribe(body) => serde_json::to_value(body),
            Payload::ChatCommand(body) => serde_json::to_value(body),
            Payload::AbortSession(body) => serde_json::to_value(body),
            Payload::GetSessionHistory(body) => serde_json::to_value(body),
            Payload::Welcome(body) => serde_json::to_value(body),
            Payload::Subscribed(body) => serde_json::to_value(body),
            Payload::SessionStarted(body) => serde_json::to_value(body),
            Payload::SessionClosed(body) => serde_json::to_value(body),
            Payload::StreamData(body) => serde_json::to_value(body),
            Payload::StreamComplete(body) => serde_json::to_value(body),
            Payload::ToolUse(body) => serde_json::to_value(body),
            Payload::ToolResult(body) => serde_json::to_value(body),
            Payload::AssistantMessage(body) => serde_json::to_value(body),
            Payload::SessionHistory(body) => serde_json::to_value(body),
            Payload::Error(body) => serde_json::to_value(body),
        }
    }

    /// Remote session this payload belongs to, when it is session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Payload::AbortSession(body) | Payload::SessionClosed(body) => Some(&body.session_id),
            Payload::GetSessionHistory(body) => Some(&body.session_id),
            Payload::SessionStarted(body) => Some(&body.session_id),
            Payload::StreamData(body) => Some(&body.session_id),
            Payload::StreamComplete(body) => Some(&body.session_id),
            Payload::ToolUse(body) => Some(&body.session_id),
            Payload::ToolResult(body) => Some(&body.session_id),
            Payload::AssistantMessage(body) => Some(&body.session_id),
            Payload::SessionHistory(body) => Some(&body.session_id),
            Payload::ChatCommand(body) => body.session_id.as_deref(),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    type_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            correlation_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn type_tag(&self) -> &'static str {
        self.payload.type_tag()
    }

    /// Serializes to a single-line text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let frame = WireFrame {
            type_tag: self.type_tag().to_string(),
            request_id: self.correlation_id.clone(),
            timestamp: Some(format_timestamp(&self.timestamp)),
            data: self.payload.data().map_err(ProtocolError::Encode)?,
        };
        serde_json::to_string(&frame).map_err(ProtocolError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let frame: WireFrame = serde_json::from_str(raw).map_err(ProtocolError::Malformed)?;

        let decoder = decoder_for(&frame.type_tag)
            .ok_or_else(|| ProtocolError::UnknownType(frame.type_tag.clone()))?;

        let data = match frame.data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let payload = decoder(data).map_err(|source| ProtocolError::Payload {
            type_tag: frame.type_tag.clone(),
            source,
        })?;

        let timestamp = frame
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        Ok(Self {
            correlation_id: frame.request_id.filter(|id| !id.trim().is_empty()),
            timestamp,
            payload,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────────────────────────

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses RFC 3339 (with or without fractional seconds), falling back to a
/// zone-less `YYYY-MM-DDTHH:MM:SS[.f]` read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
}
