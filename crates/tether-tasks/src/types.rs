//! Task and notification types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::ids::{ConversationId, MessageId, TaskId};

/// Kind of server-side work a task represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Streaming chat completion.
    Chat,
    /// Image generation.
    Image,
    /// Video generation.
    Video,
}

impl TaskKind {
    /// Whether this kind is poll-only media work.
    #[must_use]
    pub fn is_media(self) -> bool {
        matches!(self, Self::Image | Self::Video)
    }
}

/// Client-side lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, no progress observed yet.
    Pending,
    /// Receiving live content over the push channel.
    Streaming,
    /// Being watched by the polling engine.
    Polling,
    /// Finished successfully (entry leaves the registry).
    Completed,
    /// Failed; retained briefly so the UI can show the error.
    Error,
}

impl TaskStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One tracked unit of asynchronous server work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Server-assigned task id.
    pub id: TaskId,
    /// Conversation the task belongs to.
    pub conversation_id: ConversationId,
    /// Chat or media.
    pub kind: TaskKind,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// When the task started (server time when resuming, local otherwise).
    pub started_at: DateTime<Utc>,
    /// Content accumulated so far (chat tasks).
    pub content: String,
    /// Id of the optimistic placeholder message rendered for this task.
    pub placeholder_id: MessageId,
    /// Failure description once the task errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a fresh pending task.
    #[must_use]
    pub fn new(
        id: TaskId,
        conversation_id: ConversationId,
        kind: TaskKind,
        placeholder_id: MessageId,
    ) -> Self {
        Self {
            id,
            conversation_id,
            kind,
            status: TaskStatus::Pending,
            started_at: Utc::now(),
            content: String::new(),
            placeholder_id,
            error: None,
        }
    }

    /// Override the start time (used when resuming so the task keeps its
    /// original position).
    #[must_use]
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }
}

/// A completion notification shown to the user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification id.
    pub id: String,
    /// Conversation whose task completed.
    pub conversation_id: ConversationId,
    /// Kind of the completed task.
    pub kind: TaskKind,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
    /// Whether the user has seen it.
    pub read: bool,
}

impl Notification {
    /// Create an unread notification stamped now.
    #[must_use]
    pub fn new(conversation_id: ConversationId, kind: TaskKind) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            conversation_id,
            kind,
            completed_at: Utc::now(),
            read: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_media_classification() {
        assert!(!TaskKind::Chat.is_media());
        assert!(TaskKind::Image.is_media());
        assert!(TaskKind::Video.is_media());
    }

    #[test]
    fn status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Streaming.is_terminal());
        assert!(!TaskStatus::Polling.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
    }

    #[test]
    fn new_task_is_pending_and_empty() {
        let task = Task::new(
            TaskId::from("t1"),
            ConversationId::from("c1"),
            TaskKind::Chat,
            MessageId::from("ph1"),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.content.is_empty());
        assert!(task.error.is_none());
    }

    #[test]
    fn with_started_at_overrides() {
        let original = chrono::DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let task = Task::new(
            TaskId::from("t1"),
            ConversationId::from("c1"),
            TaskKind::Image,
            MessageId::from("ph1"),
        )
        .with_started_at(original);
        assert_eq!(task.started_at, original);
    }

    #[test]
    fn notifications_start_unread_with_unique_ids() {
        let a = Notification::new(ConversationId::from("c1"), TaskKind::Image);
        let b = Notification::new(ConversationId::from("c1"), TaskKind::Image);
        assert!(!a.read);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn kind_wire_strings() {
        assert_eq!(serde_json::to_string(&TaskKind::Chat).unwrap(), "\"chat\"");
        assert_eq!(serde_json::to_string(&TaskKind::Video).unwrap(), "\"video\"");
    }
}
