//! Catalogue of active chat and media tasks.
//!
//! Chat tasks are keyed by conversation (at most one active per
//! conversation); media tasks are keyed by task id and may coexist
//! many-per-conversation. The registry also owns the concurrency
//! ceilings, the completion notification queue, and the time-boxed
//! "recently completed" highlight state.
//!
//! Mutation happens only from the message router and polling callbacks.
//! Completion removes the entry; failure retains it for a grace delay so
//! the UI can show the error state, then a delayed sweep removes it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use tether_core::ids::{ConversationId, MessageId, TaskId};
use tether_settings::TaskSettings;

use crate::errors::TaskError;
use crate::types::{Notification, Task, TaskKind, TaskStatus};

/// Outcome of a concurrency-ceiling check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartDecision {
    /// A new task may start.
    Allowed,
    /// A new task must not start.
    Denied {
        /// Human-readable reason for the denial.
        reason: String,
    },
}

impl StartDecision {
    /// Whether starting is allowed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// The denial reason, if denied.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Denied { reason } => Some(reason),
        }
    }
}

/// In-memory registry of in-flight tasks for one client instance.
pub struct TaskRegistry {
    chat: DashMap<ConversationId, Task>,
    media: DashMap<TaskId, Task>,
    notifications: Mutex<VecDeque<Notification>>,
    recently_completed: DashMap<ConversationId, Instant>,
    settings: TaskSettings,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(settings: TaskSettings) -> Self {
        Self {
            chat: DashMap::new(),
            media: DashMap::new(),
            notifications: Mutex::new(VecDeque::new()),
            recently_completed: DashMap::new(),
            settings,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Concurrency ceilings
    // ─────────────────────────────────────────────────────────────────────

    /// Number of non-terminal tasks across both kinds.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let chat = self
            .chat
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .count();
        let media = self
            .media
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .count();
        chat + media
    }

    /// Number of non-terminal tasks within one conversation.
    #[must_use]
    pub fn active_count_in(&self, conversation_id: &ConversationId) -> usize {
        let chat = usize::from(
            self.chat
                .get(conversation_id)
                .is_some_and(|entry| !entry.status.is_terminal()),
        );
        let media = self
            .media
            .iter()
            .filter(|entry| {
                entry.conversation_id == *conversation_id && !entry.status.is_terminal()
            })
            .count();
        chat + media
    }

    /// Check the global concurrency ceiling.
    #[must_use]
    pub fn can_start_task(&self) -> StartDecision {
        let active = self.active_count();
        if active >= self.settings.global_task_limit {
            return StartDecision::Denied {
                reason: format!(
                    "task queue full: {active} of {} tasks already running",
                    self.settings.global_task_limit
                ),
            };
        }
        StartDecision::Allowed
    }

    /// Check the global and per-conversation ceilings for a conversation.
    #[must_use]
    pub fn can_start_task_in(&self, conversation_id: &ConversationId) -> StartDecision {
        if let StartDecision::Denied { reason } = self.can_start_task() {
            return StartDecision::Denied { reason };
        }
        let active = self.active_count_in(conversation_id);
        if active >= self.settings.conversation_task_limit {
            return StartDecision::Denied {
                reason: format!(
                    "conversation queue full: {active} of {} tasks already running",
                    self.settings.conversation_task_limit
                ),
            };
        }
        StartDecision::Allowed
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chat tasks (keyed by conversation, one active at a time)
    // ─────────────────────────────────────────────────────────────────────

    /// Register a new chat task for a conversation.
    ///
    /// A terminal (errored, grace-retained) entry is replaced; an active
    /// one is a [`TaskError::ConversationBusy`] error.
    pub fn start_task(&self, task: Task) -> Result<(), TaskError> {
        debug_assert_eq!(task.kind, TaskKind::Chat);
        let conversation_id = task.conversation_id.clone();
        if let Some(existing) = self.chat.get(&conversation_id) {
            if !existing.status.is_terminal() {
                return Err(TaskError::ConversationBusy { conversation_id });
            }
        }
        let _ = self.chat.insert(conversation_id, task);
        Ok(())
    }

    /// Append a content delta to the conversation's active chat task.
    ///
    /// Returns `false` (a no-op) when no task is registered — a late or
    /// duplicate chunk after completion.
    pub fn update_content(&self, conversation_id: &ConversationId, delta: &str) -> bool {
        match self.chat.get_mut(conversation_id) {
            Some(mut entry) => {
                entry.content.push_str(delta);
                if entry.status == TaskStatus::Pending {
                    entry.status = TaskStatus::Streaming;
                }
                true
            }
            None => false,
        }
    }

    /// Complete the conversation's chat task.
    ///
    /// Removes the entry, enqueues a notification, and marks the
    /// conversation recently completed. Returns `None` (a no-op) when no
    /// task is registered — a duplicate completion frame.
    pub fn complete_task(&self, conversation_id: &ConversationId) -> Option<Task> {
        let (_, mut task) = self.chat.remove(conversation_id)?;
        task.status = TaskStatus::Completed;
        self.on_completed(conversation_id, task.kind);
        Some(task)
    }

    /// Mark the conversation's chat task failed.
    ///
    /// The entry is retained for the grace delay so the UI can show the
    /// error, then garbage-collected. Returns `false` when no task is
    /// registered.
    pub fn fail_task(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        error: impl Into<String>,
    ) -> bool {
        let failed_id = match self.chat.get_mut(conversation_id) {
            Some(mut entry) => {
                entry.status = TaskStatus::Error;
                entry.error = Some(error.into());
                entry.id.clone()
            }
            None => return false,
        };
        self.schedule_chat_gc(conversation_id.clone(), failed_id);
        true
    }

    /// Remove a chat task without completion side effects.
    pub fn remove_task(&self, conversation_id: &ConversationId) -> Option<Task> {
        self.chat.remove(conversation_id).map(|(_, task)| task)
    }

    /// The conversation's registered chat task, if any.
    #[must_use]
    pub fn chat_task(&self, conversation_id: &ConversationId) -> Option<Task> {
        self.chat.get(conversation_id).map(|entry| entry.clone())
    }

    /// Find the conversation owning a chat task id.
    ///
    /// Chunk and error frames carry only the task id; this resolves the
    /// conversation they belong to.
    #[must_use]
    pub fn conversation_for_chat_task(&self, task_id: &TaskId) -> Option<ConversationId> {
        self.chat
            .iter()
            .find(|entry| entry.id == *task_id)
            .map(|entry| entry.key().clone())
    }

    /// Replace the accumulated content wholesale (resume seeding from a
    /// server-reported snapshot). Returns `false` when no task is
    /// registered.
    pub fn reset_content(&self, conversation_id: &ConversationId, content: &str) -> bool {
        match self.chat.get_mut(conversation_id) {
            Some(mut entry) => {
                entry.content.clear();
                entry.content.push_str(content);
                if entry.status == TaskStatus::Pending {
                    entry.status = TaskStatus::Streaming;
                }
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Media tasks (keyed by task id, many per conversation)
    // ─────────────────────────────────────────────────────────────────────

    /// Register a new media task.
    pub fn start_media_task(&self, task: Task) -> Result<(), TaskError> {
        debug_assert!(task.kind.is_media());
        let task_id = task.id.clone();
        if let Some(existing) = self.media.get(&task_id) {
            if !existing.status.is_terminal() {
                return Err(TaskError::DuplicateMediaTask { task_id });
            }
        }
        let _ = self.media.insert(task_id, task);
        Ok(())
    }

    /// Mark a media task as being watched by the polling engine.
    pub fn mark_media_polling(&self, task_id: &TaskId) -> bool {
        match self.media.get_mut(task_id) {
            Some(mut entry) => {
                entry.status = TaskStatus::Polling;
                true
            }
            None => false,
        }
    }

    /// Complete a media task; same side effects as [`Self::complete_task`].
    pub fn complete_media_task(&self, task_id: &TaskId) -> Option<Task> {
        let (_, mut task) = self.media.remove(task_id)?;
        task.status = TaskStatus::Completed;
        self.on_completed(&task.conversation_id, task.kind);
        Some(task)
    }

    /// Mark a media task failed; grace-retained like chat failures.
    pub fn fail_media_task(self: &Arc<Self>, task_id: &TaskId, error: impl Into<String>) -> bool {
        match self.media.get_mut(task_id) {
            Some(mut entry) => {
                entry.status = TaskStatus::Error;
                entry.error = Some(error.into());
            }
            None => return false,
        }
        self.schedule_media_gc(task_id.clone());
        true
    }

    /// Remove a media task without completion side effects.
    pub fn remove_media_task(&self, task_id: &TaskId) -> Option<Task> {
        self.media.remove(task_id).map(|(_, task)| task)
    }

    /// A registered media task, if any.
    #[must_use]
    pub fn media_task(&self, task_id: &TaskId) -> Option<Task> {
        self.media.get(task_id).map(|entry| entry.clone())
    }

    /// Ids of all registered media tasks (any status).
    #[must_use]
    pub fn media_task_ids(&self) -> Vec<TaskId> {
        self.media.iter().map(|entry| entry.key().clone()).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Notifications and highlight state
    // ─────────────────────────────────────────────────────────────────────

    /// Snapshot of the notification queue, newest last.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().iter().cloned().collect()
    }

    /// Number of unread notifications.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.notifications.lock().iter().filter(|n| !n.read).count()
    }

    /// Mark one notification read. Returns `false` for unknown ids.
    pub fn mark_notification_read(&self, id: &str) -> bool {
        let mut queue = self.notifications.lock();
        match queue.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    /// Whether the conversation completed a task recently (highlight
    /// state, expires after the configured TTL).
    #[must_use]
    pub fn is_recently_completed(&self, conversation_id: &ConversationId) -> bool {
        match self.recently_completed.get(conversation_id) {
            Some(marked_at) => {
                marked_at.elapsed()
                    < Duration::from_millis(self.settings.recently_completed_ttl_ms)
            }
            None => false,
        }
    }

    /// Clear the highlight once the consumer viewed the conversation.
    pub fn clear_recently_completed(&self, conversation_id: &ConversationId) {
        let _ = self.recently_completed.remove(conversation_id);
    }

    fn on_completed(&self, conversation_id: &ConversationId, kind: TaskKind) {
        let mut queue = self.notifications.lock();
        queue.push_back(Notification::new(conversation_id.clone(), kind));
        while queue.len() > self.settings.notification_cap {
            let _ = queue.pop_front();
        }
        drop(queue);
        let _ = self
            .recently_completed
            .insert(conversation_id.clone(), Instant::now());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Grace-delay garbage collection
    // ─────────────────────────────────────────────────────────────────────

    fn schedule_chat_gc(self: &Arc<Self>, conversation_id: ConversationId, failed_id: TaskId) {
        let registry = Arc::clone(self);
        let grace = Duration::from_millis(self.settings.error_grace_ms);
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // Only collect the same errored task; a replacement started
            // during the grace window must survive.
            let stale = registry.chat.get(&conversation_id).is_some_and(|entry| {
                entry.id == failed_id && entry.status == TaskStatus::Error
            });
            if stale {
                let _ = registry.chat.remove(&conversation_id);
                debug!(%conversation_id, "collected errored chat task");
            }
        });
    }

    fn schedule_media_gc(self: &Arc<Self>, task_id: TaskId) {
        let registry = Arc::clone(self);
        let grace = Duration::from_millis(self.settings.error_grace_ms);
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let stale = registry
                .media
                .get(&task_id)
                .is_some_and(|entry| entry.status == TaskStatus::Error);
            if stale {
                let _ = registry.media.remove(&task_id);
                debug!(%task_id, "collected errored media task");
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
