//! HTTP collaborators: pending-tasks listing, poll endpoints, and the
//! resume event stream.
//!
//! All endpoints are pure request/response with no side effects, except
//! [`ApiClient::mark_task_failed`] which records a client-side terminal
//! outcome server-side. The resume stream replays a task's progress
//! since a given index as server-sent events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::frames::MediaTaskStatus;
use tether_core::ids::{ConversationId, MessageId, TaskId};
use tether_tasks::TaskKind;

use crate::errors::ApiError;

/// A task still open server-side, as reported by the pending listing.
///
/// Carries enough metadata to resume rendering without re-derivation:
/// the original placeholder id and start time keep the resumed message
/// at its original position in the timeline.
#[derive(Clone, Debug, Deserialize)]
pub struct PendingTask {
    /// Server task id.
    pub id: TaskId,
    /// Conversation the task belongs to.
    pub conversation_id: ConversationId,
    /// Task kind.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Server-side status at listing time.
    pub status: MediaTaskStatus,
    /// Original request parameters, for re-rendering.
    #[serde(default)]
    pub request_params: Option<Value>,
    /// Id of the placeholder message created at submission.
    #[serde(default)]
    pub placeholder_message_id: Option<MessageId>,
    /// When the task started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Status vocabulary of the poll endpoints.
///
/// Distinct from the push-frame vocabulary — the poll API predates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    /// Queued, not started.
    Pending,
    /// Generation in progress.
    Processing,
    /// Finished with a result.
    Success,
    /// Failed terminally.
    Failed,
}

impl PollStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Response of the status poll endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct TaskStatusResponse {
    /// Server-side status.
    pub status: PollStatus,
    /// Result payload on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Response of the accumulated-content poll endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct AccumulatedContent {
    /// Server-side status.
    pub status: PollStatus,
    /// Content generated so far.
    #[serde(default)]
    pub content: String,
    /// Failure description.
    #[serde(default)]
    pub error: Option<String>,
}

/// One event replayed by the resume stream.
#[derive(Clone, Debug)]
pub struct ResumeEvent {
    /// Buffer index of this event, for cursor tracking.
    pub index: i64,
    /// Event payload.
    pub kind: ResumeEventKind,
}

/// Semantic kinds on the resume stream.
#[derive(Clone, Debug)]
pub enum ResumeEventKind {
    /// Snapshot of everything generated before the subscription.
    Accumulated {
        /// Full content so far.
        content: String,
    },
    /// Incremental content delta.
    Content {
        /// Text delta.
        text: String,
    },
    /// The task finished.
    Done {
        /// Persisted assistant message id, when one was created.
        message_id: Option<MessageId>,
        /// Final content, when one was created.
        content: Option<String>,
        /// Credits consumed.
        credits_consumed: i64,
    },
    /// The task failed.
    Error {
        /// Failure description.
        message: String,
    },
}

#[derive(Deserialize)]
struct RawResumeEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(rename = "_index", default = "default_index")]
    index: i64,
}

fn default_index() -> i64 {
    -1
}

impl ResumeEvent {
    /// Parse one server-sent event's data field.
    ///
    /// Returns `Ok(None)` for event types the client does not consume
    /// (e.g. the `start` marker).
    pub fn parse(data: &str) -> Result<Option<Self>, ApiError> {
        let raw: RawResumeEvent = serde_json::from_str(data)?;
        let kind = match raw.kind.as_str() {
            "accumulated" => ResumeEventKind::Accumulated {
                content: raw.data["content"].as_str().unwrap_or_default().to_owned(),
            },
            "content" => ResumeEventKind::Content {
                text: raw.data["text"].as_str().unwrap_or_default().to_owned(),
            },
            "done" => {
                let message = &raw.data["assistant_message"];
                ResumeEventKind::Done {
                    message_id: message["id"].as_str().map(MessageId::from),
                    content: message["content"].as_str().map(str::to_owned),
                    credits_consumed: raw.data["credits_consumed"].as_i64().unwrap_or(0),
                }
            }
            "error" => ResumeEventKind::Error {
                message: raw.data["message"].as_str().unwrap_or("unknown error").to_owned(),
            },
            _ => return Ok(None),
        };
        Ok(Some(Self {
            index: raw.index,
            kind,
        }))
    }
}

/// Stream of resume events for one task.
pub type ResumeStream = BoxStream<'static, Result<ResumeEvent, ApiError>>;

/// The HTTP API surface the engine depends on.
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
    /// Every task still open server-side for this session.
    async fn pending_tasks(&self) -> Result<Vec<PendingTask>, ApiError>;

    /// Status poll for a media task.
    async fn task_status(&self, task_id: &TaskId) -> Result<TaskStatusResponse, ApiError>;

    /// Accumulated-content poll for a chat task.
    async fn accumulated_content(&self, task_id: &TaskId) -> Result<AccumulatedContent, ApiError>;

    /// Open the resume event stream for a task, replaying progress after
    /// `last_index`.
    async fn resume_stream(
        &self,
        task_id: &TaskId,
        last_index: i64,
    ) -> Result<ResumeStream, ApiError>;

    /// Record a client-observed terminal failure (timeout, cancel).
    async fn mark_task_failed(&self, task_id: &TaskId, reason: &str) -> Result<(), ApiError>;
}

/// `reqwest`-backed implementation against the product backend.
pub struct HttpApiClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct PendingTasksResponse {
    tasks: Vec<PendingTask>,
}

#[derive(Serialize)]
struct MarkFailedRequest<'a> {
    reason: &'a str,
}

impl HttpApiClient {
    /// Create a client for the given API base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ApiError::Status {
            code: status.as_u16(),
        })
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn pending_tasks(&self) -> Result<Vec<PendingTask>, ApiError> {
        let response = self.client.get(self.url("/tasks/pending")).send().await?;
        check_status(&response)?;
        let body: PendingTasksResponse = response.json().await?;
        Ok(body.tasks)
    }

    async fn task_status(&self, task_id: &TaskId) -> Result<TaskStatusResponse, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/tasks/{task_id}/status")))
            .send()
            .await?;
        check_status(&response)?;
        Ok(response.json().await?)
    }

    async fn accumulated_content(&self, task_id: &TaskId) -> Result<AccumulatedContent, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/tasks/{task_id}/content")))
            .send()
            .await?;
        check_status(&response)?;
        Ok(response.json().await?)
    }

    async fn resume_stream(
        &self,
        task_id: &TaskId,
        last_index: i64,
    ) -> Result<ResumeStream, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/tasks/{task_id}/stream")))
            .query(&[("last_index", last_index)])
            .send()
            .await?;
        check_status(&response)?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) => match ResumeEvent::parse(&event.data) {
                        Ok(Some(resume_event)) => Some(Ok(resume_event)),
                        Ok(None) => None,
                        Err(e) => Some(Err(e)),
                    },
                    Err(e) => Some(Err(ApiError::Stream(e.to_string()))),
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn mark_task_failed(&self, task_id: &TaskId, reason: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/tasks/{task_id}/fail")))
            .json(&MarkFailedRequest { reason })
            .send()
            .await?;
        check_status(&response)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
