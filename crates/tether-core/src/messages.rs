//! Persisted vs. optimistic message model.
//!
//! The UI timeline is assembled from two sources: *persisted* messages
//! fetched from the authoritative store, and *optimistic* messages the
//! client synthesized locally while a send or generation is in flight.
//! Reconciliation (in `tether-reconcile`) collapses the two sets into one
//! ordered view; these are the shared input types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Role of a message author.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Authored by the user.
    User,
    /// Authored by the assistant.
    Assistant,
}

/// An authoritative message from the durable store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    /// Server-assigned message id.
    pub id: MessageId,
    /// Author role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// Creation time recorded by the server.
    pub created_at: DateTime<Utc>,
    /// Idempotency token echoed back from the send request, when the
    /// server stores one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// What kind of local stand-in an optimistic message is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimisticKind {
    /// A user message whose send request has not been confirmed yet.
    PendingSend,
    /// The assistant message currently being streamed.
    Streaming,
    /// A "generating…" stand-in for an in-flight media task.
    MediaPlaceholder,
    /// A locally rendered error the store will never contain.
    LocalError,
}

/// A locally synthesized message not yet confirmed by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimisticMessage {
    /// Locally generated id (also used as the placeholder id for tasks).
    pub id: MessageId,
    /// Author role.
    pub role: MessageRole,
    /// Content so far. For media placeholders this is display text, never
    /// the final media content.
    pub content: String,
    /// Local creation time.
    pub created_at: DateTime<Utc>,
    /// Stand-in kind, which drives reconciliation matching.
    pub kind: OptimisticKind,
    /// Idempotency token attached to the send request, for pending sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl OptimisticMessage {
    /// A user message awaiting send confirmation.
    #[must_use]
    pub fn pending_send(
        content: impl Into<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::User,
            content: content.into(),
            created_at: Utc::now(),
            kind: OptimisticKind::PendingSend,
            idempotency_key,
        }
    }

    /// The assistant placeholder for an in-flight chat stream.
    #[must_use]
    pub fn streaming(id: MessageId) -> Self {
        Self {
            id,
            role: MessageRole::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            kind: OptimisticKind::Streaming,
            idempotency_key: None,
        }
    }

    /// A media-generation placeholder with display text.
    #[must_use]
    pub fn media_placeholder(id: MessageId, display: impl Into<String>) -> Self {
        Self {
            id,
            role: MessageRole::Assistant,
            content: display.into(),
            created_at: Utc::now(),
            kind: OptimisticKind::MediaPlaceholder,
            idempotency_key: None,
        }
    }

    /// A locally rendered error message.
    #[must_use]
    pub fn local_error(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            kind: OptimisticKind::LocalError,
            idempotency_key: None,
        }
    }

    /// Override the creation time (used when resuming a task so the
    /// placeholder keeps its original timeline position).
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_send_defaults() {
        let msg = OptimisticMessage::pending_send("hi", Some("key-1".into()));
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.kind, OptimisticKind::PendingSend);
        assert_eq!(msg.idempotency_key.as_deref(), Some("key-1"));
    }

    #[test]
    fn streaming_starts_empty() {
        let msg = OptimisticMessage::streaming(MessageId::from("stream-1"));
        assert_eq!(msg.id.as_str(), "stream-1");
        assert_eq!(msg.role, MessageRole::Assistant);
        assert!(msg.content.is_empty());
        assert_eq!(msg.kind, OptimisticKind::Streaming);
    }

    #[test]
    fn media_placeholder_display_text() {
        let msg = OptimisticMessage::media_placeholder(MessageId::from("ph-1"), "generating…");
        assert_eq!(msg.content, "generating…");
        assert_eq!(msg.kind, OptimisticKind::MediaPlaceholder);
    }

    #[test]
    fn local_error_is_assistant() {
        let msg = OptimisticMessage::local_error("service unavailable");
        assert_eq!(msg.role, MessageRole::Assistant);
        assert_eq!(msg.kind, OptimisticKind::LocalError);
    }

    #[test]
    fn with_created_at_overrides() {
        let original = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = OptimisticMessage::streaming(MessageId::new()).with_created_at(original);
        assert_eq!(msg.created_at, original);
    }

    #[test]
    fn role_wire_strings() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn persisted_message_serde_roundtrip() {
        let msg = PersistedMessage {
            id: MessageId::from("m1"),
            role: MessageRole::User,
            content: "hello".into(),
            created_at: Utc::now(),
            idempotency_key: Some("idem-1".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: PersistedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn persisted_message_key_optional() {
        let raw = r#"{
            "id": "m1",
            "role": "assistant",
            "content": "hi",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let msg: PersistedMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.idempotency_key.is_none());
    }

    #[test]
    fn optimistic_kind_wire_strings() {
        assert_eq!(
            serde_json::to_string(&OptimisticKind::PendingSend).unwrap(),
            "\"pending_send\""
        );
        assert_eq!(
            serde_json::to_string(&OptimisticKind::MediaPlaceholder).unwrap(),
            "\"media_placeholder\""
        );
    }
}
