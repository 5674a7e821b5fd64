//! Push-channel wire frames.
//!
//! The push channel carries JSON frames of the shape
//! `{type, payload, timestamp, task_id?, conversation_id?}`. [`FrameType`]
//! enumerates the semantic vocabulary; the string values are part of the
//! wire contract and must not change.
//!
//! Typed payload structs cover each frame type. Payloads are decoded
//! lazily via [`Frame::decode_payload`] so the dispatch layer can route on
//! `type` alone without paying for full deserialization of frames it
//! ignores.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::{ConversationId, MessageId, TaskId};

/// Current Unix timestamp in milliseconds.
#[must_use]
pub fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Error raised while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The raw text was not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload did not match the expected shape for the frame type.
    #[error("invalid {frame_type:?} payload: {source}")]
    InvalidPayload {
        /// Frame type whose payload failed to decode.
        frame_type: FrameType,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame types
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic frame types carried by the push channel.
///
/// Inbound (server → client): everything except [`FrameType::Pong`],
/// [`FrameType::Subscribe`] and [`FrameType::Unsubscribe`], which are the
/// outbound vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    // ── Chat streaming ───────────────────────────────────────────────
    /// Generation started for a chat task.
    #[serde(rename = "chat_start")]
    ChatStart,
    /// Incremental content chunk for a streaming chat task.
    #[serde(rename = "chat_chunk")]
    ChatChunk,
    /// Chat task finished successfully.
    #[serde(rename = "chat_done")]
    ChatDone,
    /// Chat task failed.
    #[serde(rename = "chat_error")]
    ChatError,

    // ── Media tasks ──────────────────────────────────────────────────
    /// Image/video task status update.
    #[serde(rename = "task_status")]
    TaskStatus,

    // ── Account ──────────────────────────────────────────────────────
    /// The user's credit balance changed.
    #[serde(rename = "credits_changed")]
    CreditsChanged,

    // ── Connection ───────────────────────────────────────────────────
    /// Acknowledgement of a `subscribe`, carrying accumulated content.
    #[serde(rename = "subscribed")]
    Subscribed,
    /// Server heartbeat request.
    #[serde(rename = "ping")]
    Ping,
    /// Client heartbeat response.
    #[serde(rename = "pong")]
    Pong,
    /// Subscribe to a task's live stream.
    #[serde(rename = "subscribe")]
    Subscribe,
    /// Unsubscribe from a task's live stream.
    #[serde(rename = "unsubscribe")]
    Unsubscribe,

    // ── System ───────────────────────────────────────────────────────
    /// The server is about to restart; reconnect with jitter.
    #[serde(rename = "server_restarting")]
    ServerRestarting,
    /// Generic server-side error not tied to a task.
    #[serde(rename = "error")]
    Error,
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame
// ─────────────────────────────────────────────────────────────────────────────

/// A single JSON frame on the push channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    /// Semantic frame type.
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Type-specific payload. Defaults to an empty object.
    #[serde(default = "empty_payload")]
    pub payload: Value,
    /// Unix timestamp in milliseconds, stamped by the sender.
    pub timestamp: i64,
    /// Task this frame refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Conversation this frame refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Frame {
    /// Create a frame of the given type with a payload, stamped now.
    #[must_use]
    pub fn new(frame_type: FrameType, payload: Value) -> Self {
        Self {
            frame_type,
            payload,
            timestamp: epoch_ms(),
            task_id: None,
            conversation_id: None,
        }
    }

    /// Attach a task id.
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attach a conversation id.
    #[must_use]
    pub fn with_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Build an outbound heartbeat response.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, empty_payload())
    }

    /// Build an outbound subscription request.
    ///
    /// `last_index` is the cursor of the last frame already received for
    /// this task, `-1` to replay from the beginning.
    #[must_use]
    pub fn subscribe(task_id: TaskId, last_index: i64) -> Self {
        let payload = serde_json::json!({
            "task_id": task_id.as_str(),
            "last_index": last_index,
        });
        Self::new(FrameType::Subscribe, payload).with_task(task_id)
    }

    /// Build an outbound unsubscription request.
    #[must_use]
    pub fn unsubscribe(task_id: TaskId) -> Self {
        let payload = serde_json::json!({ "task_id": task_id.as_str() });
        Self::new(FrameType::Unsubscribe, payload).with_task(task_id)
    }

    /// Parse a frame from raw channel text.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize to channel text.
    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload into a typed payload struct.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| FrameError::InvalidPayload {
            frame_type: self.frame_type,
            source,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of a [`FrameType::ChatStart`] frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatStartPayload {
    /// Model handling the generation.
    pub model: String,
    /// Server-assigned id the finished assistant message will carry.
    pub assistant_message_id: MessageId,
}

/// Payload of a [`FrameType::ChatChunk`] frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatChunkPayload {
    /// Incremental text delta.
    pub text: String,
    /// Full content so far, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated: Option<String>,
}

/// Payload of a [`FrameType::ChatDone`] frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatDonePayload {
    /// Id of the persisted assistant message.
    pub message_id: MessageId,
    /// Final content.
    pub content: String,
    /// Credits consumed by the generation.
    #[serde(default)]
    pub credits_consumed: i64,
    /// Model that produced the content.
    #[serde(default)]
    pub model: String,
}

/// Payload of a [`FrameType::ChatError`] frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatErrorPayload {
    /// Human-readable error description.
    pub error: String,
    /// Machine-readable error code, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Server-side status of a media task, as carried by `task_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaTaskStatus {
    /// Queued server-side, not started.
    Pending,
    /// Generation in progress.
    Running,
    /// Finished with results.
    Completed,
    /// Failed terminally.
    Failed,
}

impl MediaTaskStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Payload of a [`FrameType::TaskStatus`] frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatusPayload {
    /// Server-side task status.
    pub status: MediaTaskStatus,
    /// `image` or `video`, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Result URLs on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// Credits consumed, on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_consumed: Option<i64>,
    /// Failure description, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Payload of a [`FrameType::CreditsChanged`] frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditsChangedPayload {
    /// Current balance.
    pub credits: i64,
    /// Signed change amount.
    pub delta: i64,
    /// Reason for the change.
    pub reason: String,
    /// Task that triggered the change, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Payload of a [`FrameType::Subscribed`] acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribedPayload {
    /// Task the subscription is for.
    pub task_id: TaskId,
    /// Content accumulated before the subscription was established.
    #[serde(default)]
    pub accumulated: String,
    /// Index of the last buffered frame, `-1` when none.
    #[serde(default = "default_index")]
    pub current_index: i64,
}

fn default_index() -> i64 {
    -1
}

/// Payload of a generic [`FrameType::Error`] frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error description.
    pub message: String,
    /// Machine-readable code, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
