//! Re-attachment to server-reported pending tasks after a reload.
//!
//! Recovery queries the pending-tasks listing, then re-enters each task:
//!
//! - **Chat** (push-capable): resume the live event stream keyed by task
//!   id; if the stream cannot be opened or breaks mid-flight, fall back
//!   to a bounded-interval accumulated-content poll that appends only
//!   the delta beyond a monotonically tracked length cursor.
//! - **Media** (poll-only): re-enter the polling engine behind the
//!   cross-tab coordinator exactly like a fresh task.
//!
//! Both paths reuse the original placeholder id and start time reported
//! by the server so the resumed message keeps its position in the
//! timeline. Reattachment is staggered (`fixed delay × index`) to avoid
//! a reconnection burst. A reload-scoped set of in-recovery ids,
//! reinforced by the advisory broadcast, keeps two instances (or two
//! re-invocations in one) from resuming the same task twice. Tasks
//! already terminal server-side short-circuit to a reconciliation
//! refresh with no live channel opened.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_coordination::{AdvisoryType, CrossTabCoordinator, TabBroadcaster};
use tether_core::ids::{ConversationId, MessageId, TaskId};
use tether_core::messages::OptimisticMessage;
use tether_settings::{PollingSettings, RecoverySettings};
use tether_tasks::{
    PollCallbacks, PollError, PollOptions, PollOutcome, PollingEngine, Task, TaskKind,
    TaskRegistry,
};

use crate::api::{ApiClient, PendingTask, PollStatus, ResumeEventKind, ResumeStream};
use crate::errors::RecoveryError;
use crate::events::RuntimeEvent;
use crate::state::RuntimeState;

/// Re-attaches pending tasks on session start.
pub struct RecoveryManager {
    api: Arc<dyn ApiClient>,
    registry: Arc<TaskRegistry>,
    state: Arc<RuntimeState>,
    polling: Arc<PollingEngine>,
    coordinator: Arc<CrossTabCoordinator>,
    broadcaster: Arc<TabBroadcaster>,
    events: broadcast::Sender<RuntimeEvent>,
    recovery_settings: RecoverySettings,
    polling_settings: PollingSettings,
    /// Reload-scoped guard: ids a resume attempt already exists for.
    recovering: DashMap<TaskId, ()>,
    /// Live lease-renewal loops, cancelled on teardown.
    renewals: DashMap<TaskId, CancellationToken>,
    cancel: CancellationToken,
}

impl RecoveryManager {
    /// Create a recovery manager for one client instance.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ApiClient>,
        registry: Arc<TaskRegistry>,
        state: Arc<RuntimeState>,
        polling: Arc<PollingEngine>,
        coordinator: Arc<CrossTabCoordinator>,
        broadcaster: Arc<TabBroadcaster>,
        events: broadcast::Sender<RuntimeEvent>,
        recovery_settings: RecoverySettings,
        polling_settings: PollingSettings,
    ) -> Self {
        Self {
            api,
            registry,
            state,
            polling,
            coordinator,
            broadcaster,
            events,
            recovery_settings,
            polling_settings,
            recovering: DashMap::new(),
            renewals: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the advisory listener that marks tasks other instances are
    /// already resuming.
    pub fn start_advisory_guard(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut subscription = self.broadcaster.subscribe();
        let cancel = self.cancel.clone();
        let _handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = subscription.recv() => match envelope {
                        Some(envelope) if envelope.event == AdvisoryType::TaskResumed => {
                            if let Some(task_id) = envelope.payload["task_id"].as_str() {
                                debug!(task_id, "task resumed elsewhere, guarding");
                                let _ = manager
                                    .recovering
                                    .insert(TaskId::from(task_id), ());
                            }
                        }
                        Some(_) => {}
                        None => return,
                    },
                    () = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Cancel every pending and in-flight recovery attempt (page
    /// unload / teardown), including lease-renewal heartbeats.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
        for entry in &self.renewals {
            entry.value().cancel();
        }
        self.renewals.clear();
    }

    /// Query the pending-tasks listing and re-attach each open task.
    ///
    /// Returns the number of resume attempts scheduled. Safe to call
    /// again: tasks already guarded (here or elsewhere) are skipped.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, RecoveryError> {
        let pending = self.api.pending_tasks().await?;
        info!(count = pending.len(), "recovering pending tasks");

        let mut scheduled = 0usize;
        for (index, task) in pending.into_iter().enumerate() {
            if self.recovering.insert(task.id.clone(), ()).is_some() {
                debug!(task_id = %task.id, "already recovering, skipping");
                continue;
            }
            self.broadcaster.publish(
                AdvisoryType::TaskResumed,
                serde_json::json!({ "task_id": task.id.as_str() }),
            );

            if task.status.is_terminal() {
                // Already settled server-side: nothing to attach, the
                // next reconciliation refresh picks it up.
                let _ = self.events.send(RuntimeEvent::RefreshNeeded {
                    conversation_id: task.conversation_id.clone(),
                });
                continue;
            }

            scheduled += 1;
            let manager = Arc::clone(self);
            let stagger = Duration::from_millis(
                self.recovery_settings
                    .stagger_delay_ms
                    .saturating_mul(u64::try_from(index).unwrap_or(u64::MAX)),
            );
            let _handle = tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(stagger) => {}
                    () = manager.cancel.cancelled() => return,
                }
                match task.kind {
                    TaskKind::Chat => manager.resume_chat(task).await,
                    TaskKind::Image | TaskKind::Video => manager.resume_media(task),
                }
            });
        }
        Ok(scheduled)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chat: push-resume with poll fallback
    // ─────────────────────────────────────────────────────────────────────

    async fn resume_chat(self: &Arc<Self>, task: PendingTask) {
        let conversation_id = task.conversation_id.clone();
        let placeholder_id = task
            .placeholder_message_id
            .clone()
            .unwrap_or_else(MessageId::new);
        let started_at = task.started_at.unwrap_or_else(Utc::now);

        let registry_task =
            Task::new(task.id.clone(), conversation_id.clone(), TaskKind::Chat, placeholder_id.clone())
                .with_started_at(started_at);
        if self.registry.start_task(registry_task).is_err() {
            debug!(task_id = %task.id, "conversation already active, skipping resume");
            return;
        }
        // Reuse the original placeholder id and timestamp so the resumed
        // message keeps its timeline position.
        self.state.begin_stream(
            &conversation_id,
            OptimisticMessage::streaming(placeholder_id).with_created_at(started_at),
        );

        match self.api.resume_stream(&task.id, -1).await {
            Ok(stream) => {
                if self.consume_resume_stream(&task, stream).await {
                    return;
                }
                warn!(task_id = %task.id, "resume stream broke, falling back to content poll");
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "resume stream unavailable, falling back to content poll");
            }
        }
        self.start_content_poll(&task.id, &conversation_id);
    }

    /// Drive the resume stream to a terminal event.
    ///
    /// Returns `true` when the task reached a terminal state (or
    /// recovery was cancelled), `false` when the stream failed and the
    /// poll fallback should take over.
    async fn consume_resume_stream(
        self: &Arc<Self>,
        task: &PendingTask,
        mut stream: ResumeStream,
    ) -> bool {
        let conversation_id = &task.conversation_id;
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                () = self.cancel.cancelled() => return true,
            };
            match event {
                Some(Ok(resume_event)) => match resume_event.kind {
                    ResumeEventKind::Accumulated { content } => {
                        let _ = self.registry.reset_content(conversation_id, &content);
                        let _ = self.state.set_streaming_content(conversation_id, &content);
                    }
                    ResumeEventKind::Content { text } => {
                        let _ = self.registry.update_content(conversation_id, &text);
                        let _ = self.state.append_streaming_content(conversation_id, &text);
                    }
                    ResumeEventKind::Done {
                        message_id,
                        content,
                        credits_consumed,
                    } => {
                        self.finish_chat_ok(conversation_id, message_id, content, credits_consumed);
                        return true;
                    }
                    ResumeEventKind::Error { message } => {
                        self.finish_chat_err(conversation_id, &message);
                        return true;
                    }
                },
                Some(Err(e)) => {
                    debug!(task_id = %task.id, error = %e, "resume stream error");
                    return false;
                }
                None => return false,
            }
        }
    }

    /// Accumulated-content poll fallback: content-so-far, appending only
    /// the delta beyond the length cursor.
    fn start_content_poll(self: &Arc<Self>, task_id: &TaskId, conversation_id: &ConversationId) {
        let cursor = Arc::new(Mutex::new(
            self.registry
                .chat_task(conversation_id)
                .map_or(0, |task| task.content.len()),
        ));

        let poll_fn = {
            let api = Arc::clone(&self.api);
            let registry = Arc::clone(&self.registry);
            let state = Arc::clone(&self.state);
            let task_id = task_id.clone();
            let conversation_id = conversation_id.clone();
            Arc::new(move || {
                let api = Arc::clone(&api);
                let registry = Arc::clone(&registry);
                let state = Arc::clone(&state);
                let cursor = Arc::clone(&cursor);
                let task_id = task_id.clone();
                let conversation_id = conversation_id.clone();
                let future: futures::future::BoxFuture<'static, Result<PollOutcome, String>> =
                    Box::pin(async move {
                        let body = api
                            .accumulated_content(&task_id)
                            .await
                            .map_err(|e| e.to_string())?;
                        {
                            let mut seen = cursor.lock();
                            // Never re-append already-seen content.
                            if body.content.len() > *seen {
                                let delta = body.content.get(*seen..).unwrap_or_default();
                                let _ = registry.update_content(&conversation_id, delta);
                                let _ = state.append_streaming_content(&conversation_id, delta);
                                *seen = body.content.len();
                            }
                        }
                        match body.status {
                            PollStatus::Success => Ok(PollOutcome::Done(serde_json::json!({
                                "content": body.content,
                            }))),
                            PollStatus::Failed => Ok(PollOutcome::Done(serde_json::json!({
                                "error": body.error.unwrap_or_else(|| "generation failed".to_owned()),
                            }))),
                            PollStatus::Pending | PollStatus::Processing => {
                                Ok(PollOutcome::Pending)
                            }
                        }
                    });
                future
            })
        };

        let on_success = {
            let manager = Arc::clone(self);
            let conversation_id = conversation_id.clone();
            move |result: serde_json::Value| match result["error"].as_str() {
                Some(error) => manager.finish_chat_err(&conversation_id, error),
                None => manager.finish_chat_ok(&conversation_id, None, None, 0),
            }
        };
        let on_error = {
            let manager = Arc::clone(self);
            let task_id = task_id.clone();
            let conversation_id = conversation_id.clone();
            move |error: PollError| {
                manager.finish_chat_err(&conversation_id, &error.to_string());
                manager.report_terminal_failure(task_id, error);
            }
        };

        let options = PollOptions {
            interval: Duration::from_millis(self.recovery_settings.fallback_poll_interval_ms),
            max_duration: Duration::from_millis(self.polling_settings.max_duration_ms),
            failure_threshold: self.polling_settings.failure_threshold,
        };
        let _ = self
            .polling
            .start(task_id.clone(), poll_fn, PollCallbacks::new(on_success, on_error), options);
    }

    fn finish_chat_ok(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<MessageId>,
        content: Option<String>,
        credits_consumed: i64,
    ) {
        let completed = self.registry.complete_task(conversation_id);
        let _ = self.state.end_stream(conversation_id);
        if let Some(task) = completed {
            if let Some(message_id) = message_id {
                let _ = self.events.send(RuntimeEvent::ChatCompleted {
                    conversation_id: conversation_id.clone(),
                    message_id,
                    content: content.unwrap_or_else(|| task.content.clone()),
                    credits_consumed,
                });
            }
            let _ = self.events.send(RuntimeEvent::RefreshNeeded {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    fn finish_chat_err(&self, conversation_id: &ConversationId, error: &str) {
        let owned = self.registry.fail_task(conversation_id, error);
        if self.state.end_stream(conversation_id).is_some() {
            self.state
                .push_optimistic(conversation_id, OptimisticMessage::local_error(error));
        }
        if owned {
            let _ = self.events.send(RuntimeEvent::ChatFailed {
                conversation_id: conversation_id.clone(),
                error: error.to_owned(),
            });
        }
    }

    /// Record a terminal client-side failure server-side, best-effort.
    fn report_terminal_failure(&self, task_id: TaskId, error: PollError) {
        let api = Arc::clone(&self.api);
        let _handle = tokio::spawn(async move {
            if let Err(e) = api.mark_task_failed(&task_id, &error.to_string()).await {
                debug!(%task_id, error = %e, "failed to report terminal failure");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Media: lease-gated status poll
    // ─────────────────────────────────────────────────────────────────────

    fn resume_media(self: &Arc<Self>, task: PendingTask) {
        let placeholder_id = task
            .placeholder_message_id
            .clone()
            .unwrap_or_else(MessageId::new);
        let started_at = task.started_at.unwrap_or_else(Utc::now);

        let registry_task = Task::new(
            task.id.clone(),
            task.conversation_id.clone(),
            task.kind,
            placeholder_id.clone(),
        )
        .with_started_at(started_at);
        if self.registry.start_media_task(registry_task).is_err() {
            debug!(task_id = %task.id, "media task already registered, skipping resume");
            return;
        }
        self.state.push_optimistic(
            &task.conversation_id,
            OptimisticMessage::media_placeholder(placeholder_id, "generating…")
                .with_created_at(started_at),
        );

        // Only the lease owner polls; every instance renders the
        // placeholder and waits for the advisory/refresh otherwise.
        match self.coordinator.can_start_polling(&task.id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task.id, "another instance owns the poll");
                return;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "lease check failed, not polling");
                return;
            }
        }
        let renewal = self.coordinator.spawn_renewal(task.id.clone());
        let _ = self.renewals.insert(task.id.clone(), renewal.clone());

        let _ = self.registry.mark_media_polling(&task.id);

        let poll_fn = {
            let api = Arc::clone(&self.api);
            let task_id = task.id.clone();
            Arc::new(move || {
                let api = Arc::clone(&api);
                let task_id = task_id.clone();
                let future: futures::future::BoxFuture<'static, Result<PollOutcome, String>> =
                    Box::pin(async move {
                        let status = api
                            .task_status(&task_id)
                            .await
                            .map_err(|e| e.to_string())?;
                        match status.status {
                            PollStatus::Success => Ok(PollOutcome::Done(
                                status.result.unwrap_or(serde_json::Value::Null),
                            )),
                            PollStatus::Failed => Ok(PollOutcome::Done(serde_json::json!({
                                "error": status
                                    .error_message
                                    .unwrap_or_else(|| "media generation failed".to_owned()),
                            }))),
                            PollStatus::Pending | PollStatus::Processing => {
                                Ok(PollOutcome::Pending)
                            }
                        }
                    });
                future
            })
        };

        let on_success = {
            let manager = Arc::clone(self);
            let task_id = task.id.clone();
            let renewal = renewal.clone();
            move |result: serde_json::Value| {
                renewal.cancel();
                let _ = manager.renewals.remove(&task_id);
                manager.release_lease(&task_id);
                match result["error"].as_str() {
                    Some(error) => manager.finish_media_err(&task_id, error),
                    None => manager.finish_media_ok(&task_id, result),
                }
            }
        };
        let on_error = {
            let manager = Arc::clone(self);
            let task_id = task.id.clone();
            move |error: PollError| {
                renewal.cancel();
                let _ = manager.renewals.remove(&task_id);
                manager.release_lease(&task_id);
                manager.finish_media_err(&task_id, &error.to_string());
                manager.report_terminal_failure(task_id, error);
            }
        };

        let _ = self.polling.start(
            task.id.clone(),
            poll_fn,
            PollCallbacks::new(on_success, on_error),
            PollOptions::from(self.polling_settings),
        );
    }

    fn release_lease(&self, task_id: &TaskId) {
        if let Err(e) = self.coordinator.release_polling(task_id) {
            warn!(%task_id, error = %e, "lease release failed");
        }
    }

    fn finish_media_ok(&self, task_id: &TaskId, result: serde_json::Value) {
        if let Some(task) = self.registry.complete_media_task(task_id) {
            let _ = self.events.send(RuntimeEvent::MediaCompleted {
                task_id: task_id.clone(),
                conversation_id: task.conversation_id.clone(),
                result,
            });
            let _ = self.events.send(RuntimeEvent::RefreshNeeded {
                conversation_id: task.conversation_id,
            });
        }
    }

    fn finish_media_err(&self, task_id: &TaskId, error: &str) {
        let conversation = self
            .registry
            .media_task(task_id)
            .map(|task| task.conversation_id);
        if self.registry.fail_media_task(task_id, error) {
            if let Some(conversation_id) = conversation {
                let _ = self.events.send(RuntimeEvent::MediaFailed {
                    task_id: task_id.clone(),
                    conversation_id,
                    error: error.to_owned(),
                });
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
