//! Events the runtime surfaces to its consumer (the UI layer).

use tether_core::ids::{ConversationId, MessageId, TaskId};

/// Observable outcomes of routed frames and recovery.
///
/// Delivered over a broadcast channel; consumers that lag simply miss
/// events and catch up on the next reconciliation refresh.
#[derive(Clone, Debug)]
pub enum RuntimeEvent {
    /// A chat generation finished; the timeline should refresh.
    ChatCompleted {
        /// Conversation whose task completed.
        conversation_id: ConversationId,
        /// Persisted id of the assistant message.
        message_id: MessageId,
        /// Final content.
        content: String,
        /// Credits consumed.
        credits_consumed: i64,
    },
    /// A chat generation failed.
    ChatFailed {
        /// Conversation whose task failed.
        conversation_id: ConversationId,
        /// Failure description.
        error: String,
    },
    /// A media task finished.
    MediaCompleted {
        /// The finished task.
        task_id: TaskId,
        /// Conversation it belongs to.
        conversation_id: ConversationId,
        /// Result payload (urls etc.).
        result: serde_json::Value,
    },
    /// A media task failed.
    MediaFailed {
        /// The failed task.
        task_id: TaskId,
        /// Conversation it belongs to.
        conversation_id: ConversationId,
        /// Failure description.
        error: String,
    },
    /// The credit balance changed.
    CreditsChanged {
        /// Current balance.
        credits: i64,
        /// Signed change.
        delta: i64,
        /// Reason for the change.
        reason: String,
    },
    /// Authoritative state changed server-side; re-fetch and reconcile.
    RefreshNeeded {
        /// Conversation to refresh.
        conversation_id: ConversationId,
    },
}
