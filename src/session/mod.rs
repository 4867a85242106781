mod manager;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use manager::{PermissionResolution, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Active,
    WaitingInput,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::WaitingInput => write!(f, "waiting_input"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    Thinking,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SessionMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// One tool the worker asked for and was refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPermission {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
}

/// Conversational state wrapping one worker subprocess invocation.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub status: SessionStatus,
    pub messages: Vec<SessionMessage>,
    pub pending_permissions: Vec<PendingPermission>,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            status: SessionStatus::Starting,
            messages: Vec::new(),
            pending_permissions: Vec::new(),
            working_dir: working_dir.into(),
            started_at: now,
            last_activity_at: now,
        }
    }

    /// Concatenation of assistant text, used as the session's result.
    pub fn assistant_transcript(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.kind == MessageKind::Assistant)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_assistant_message(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.kind == MessageKind::Assistant)
    }
}
