//! Core types shared between the engine and the presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Connection state plus the moment it was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub changed_at: DateTime<Utc>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            changed_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
    System,
}

impl Sender {
    /// Maps a history `role` string; unknown roles are treated as system text.
    pub fn from_role(role: &str) -> Self {
        match role.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Sender::User,
            "assistant" | "claude" => Sender::Assistant,
            _ => Sender::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_metadata: Option<MessageSessionMetadata>,
    pub streaming_state: StreamingState,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            content: content.into(),
            sender: Sender::User,
            timestamp: Utc::now(),
            session_metadata: None,
            streaming_state: StreamingState::Completed,
        }
    }

    pub fn assistant_pending(session_id: &str) -> Self {
        Self {
            id: new_id(),
            content: String::new(),
            sender: Sender::Assistant,
            timestamp: Utc::now(),
            session_metadata: Some(MessageSessionMetadata {
                session_id: Some(session_id.to_string()),
                ..MessageSessionMetadata::default()
            }),
            streaming_state: StreamingState::Pending,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_metadata
            .as_ref()
            .and_then(|metadata| metadata.session_id.as_deref())
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self.streaming_state,
            StreamingState::Completed | StreamingState::Failed | StreamingState::Cancelled
        )
    }
}

pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Projects & persisted session metadata
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    pub path: String,
}

impl ProjectDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
        }
    }

    /// Builds a descriptor keyed by the project path, named after its last
    /// component. Used when only a path is known (push payloads, CLI).
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.trim_end_matches('/');
        let name = trimmed
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(trimmed)
            .to_string();
        Self {
            id: path.to_string(),
            name: if name.is_empty() { path.to_string() } else { name },
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadataRecord {
    pub session_id: String,
    pub project_id: String,
    pub project_name: String,
    pub project_path: String,
    pub last_message_date: DateTime<Utc>,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine events
// ═══════════════════════════════════════════════════════════════════════════════

/// User-visible conditions. All are recoverable without a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "notice")]
pub enum UserNotice {
    ConnectionLost { reason: String },
    SendTimeout { correlation_id: String },
    NoActiveSession { project_id: String },
}

/// Everything the presentation layer can observe from the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "data")]
pub enum EngineEvent {
    Connection(ConnectionSnapshot),
    MessageUpdated(Message),
    MessageCompleted(Message),
    MessageCancelled(Message),
    SessionStarted {
        session_id: String,
        project_id: Option<String>,
    },
    SessionClosed {
        session_id: String,
    },
    ToolUse {
        session_id: String,
        tool_name: String,
        input: tether_protocol::AnyValue,
    },
    ToolResult {
        session_id: String,
        output: tether_protocol::AnyValue,
        is_error: bool,
    },
    Notice(UserNotice),
}
