//! Translates push-channel frames into registry and state mutations.
//!
//! Delivery is at-least-once: chunk application is a pure append, and
//! `done`/`error` check the task is still registered before mutating, so
//! duplicate completion frames are silent no-ops. Frames for tasks this
//! instance never registered (started by another tab of the same
//! session) still drive the conversation's streaming state so every tab
//! renders live progress.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use tether_connection::{ConnectionManager, Subscription};
use tether_core::frames::{
    ChatChunkPayload, ChatDonePayload, ChatErrorPayload, ChatStartPayload,
    CreditsChangedPayload, Frame, FrameType, MediaTaskStatus, TaskStatusPayload,
};
use tether_core::ids::{ConversationId, TaskId};
use tether_core::messages::OptimisticMessage;
use tether_tasks::TaskRegistry;

use crate::events::RuntimeEvent;
use crate::state::RuntimeState;

/// Routes inbound frames to the registry and runtime state.
///
/// Holds the push-channel subscriptions; [`MessageRouter::detach`]
/// removes them all.
pub struct MessageRouter {
    subscriptions: Vec<Subscription>,
}

impl MessageRouter {
    /// Subscribe to the semantic event vocabulary on `connection`.
    #[must_use]
    pub fn attach(
        connection: &Arc<ConnectionManager>,
        registry: &Arc<TaskRegistry>,
        state: &Arc<RuntimeState>,
        events: broadcast::Sender<RuntimeEvent>,
    ) -> Self {
        // task id → conversation, for chunk/error frames that carry only
        // the task id. Covers streams this instance never registered.
        let streams: Arc<DashMap<TaskId, ConversationId>> = Arc::new(DashMap::new());
        let mut subscriptions = Vec::new();

        // ── chat_start ───────────────────────────────────────────────
        {
            let state = Arc::clone(state);
            let streams = Arc::clone(&streams);
            subscriptions.push(connection.subscribe(FrameType::ChatStart, move |frame| {
                let (Some(task_id), Some(conversation_id)) =
                    (frame.task_id.clone(), frame.conversation_id.clone())
                else {
                    return;
                };
                let payload: ChatStartPayload = match frame.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "bad chat_start payload");
                        return;
                    }
                };
                let _ = streams.insert(task_id, conversation_id.clone());
                state.begin_stream(
                    &conversation_id,
                    OptimisticMessage::streaming(payload.assistant_message_id),
                );
            }));
        }

        // ── chat_chunk ───────────────────────────────────────────────
        {
            let registry = Arc::clone(registry);
            let state = Arc::clone(state);
            let streams = Arc::clone(&streams);
            subscriptions.push(connection.subscribe(FrameType::ChatChunk, move |frame| {
                let Some(conversation_id) = resolve_conversation(frame, &streams, &registry)
                else {
                    debug!("chunk for unknown task, ignoring");
                    return;
                };
                let payload: ChatChunkPayload = match frame.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "bad chat_chunk payload");
                        return;
                    }
                };
                // Both are no-ops when the task/stream is already gone
                // (late chunk after completion).
                let _ = registry.update_content(&conversation_id, &payload.text);
                let _ = state.append_streaming_content(&conversation_id, &payload.text);
            }));
        }

        // ── chat_done ────────────────────────────────────────────────
        {
            let registry = Arc::clone(registry);
            let state = Arc::clone(state);
            let streams = Arc::clone(&streams);
            let events = events.clone();
            subscriptions.push(connection.subscribe(FrameType::ChatDone, move |frame| {
                let Some(conversation_id) = resolve_conversation(frame, &streams, &registry)
                else {
                    return;
                };
                let payload: ChatDonePayload = match frame.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "bad chat_done payload");
                        return;
                    }
                };
                if let Some(task_id) = &frame.task_id {
                    let _ = streams.remove(task_id);
                }
                let owned = registry.complete_task(&conversation_id).is_some();
                let ended = state.end_stream(&conversation_id).is_some();
                if owned || ended {
                    let _ = events.send(RuntimeEvent::ChatCompleted {
                        conversation_id: conversation_id.clone(),
                        message_id: payload.message_id,
                        content: payload.content,
                        credits_consumed: payload.credits_consumed,
                    });
                    let _ = events.send(RuntimeEvent::RefreshNeeded { conversation_id });
                }
            }));
        }

        // ── chat_error ───────────────────────────────────────────────
        {
            let registry = Arc::clone(registry);
            let state = Arc::clone(state);
            let streams = Arc::clone(&streams);
            let events = events.clone();
            subscriptions.push(connection.subscribe(FrameType::ChatError, move |frame| {
                let Some(conversation_id) = resolve_conversation(frame, &streams, &registry)
                else {
                    return;
                };
                let payload: ChatErrorPayload = match frame.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "bad chat_error payload");
                        return;
                    }
                };
                if let Some(task_id) = &frame.task_id {
                    let _ = streams.remove(task_id);
                }
                let owned = registry.fail_task(&conversation_id, payload.error.clone());
                let ended = state.end_stream(&conversation_id).is_some();
                if ended {
                    state.push_optimistic(
                        &conversation_id,
                        OptimisticMessage::local_error(payload.error.clone()),
                    );
                }
                if owned || ended {
                    let _ = events.send(RuntimeEvent::ChatFailed {
                        conversation_id,
                        error: payload.error,
                    });
                }
            }));
        }

        // ── task_status (media) ──────────────────────────────────────
        {
            let registry = Arc::clone(registry);
            let events = events.clone();
            subscriptions.push(connection.subscribe(FrameType::TaskStatus, move |frame| {
                let Some(task_id) = frame.task_id.clone() else {
                    return;
                };
                let payload: TaskStatusPayload = match frame.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "bad task_status payload");
                        return;
                    }
                };
                match payload.status {
                    MediaTaskStatus::Completed => {
                        if let Some(task) = registry.complete_media_task(&task_id) {
                            let _ = events.send(RuntimeEvent::MediaCompleted {
                                task_id,
                                conversation_id: task.conversation_id.clone(),
                                result: serde_json::json!({
                                    "urls": payload.urls,
                                    "media_type": payload.media_type,
                                    "credits_consumed": payload.credits_consumed,
                                }),
                            });
                            let _ = events.send(RuntimeEvent::RefreshNeeded {
                                conversation_id: task.conversation_id,
                            });
                        }
                    }
                    MediaTaskStatus::Failed => {
                        let conversation = registry
                            .media_task(&task_id)
                            .map(|task| task.conversation_id);
                        let error = payload
                            .error_message
                            .unwrap_or_else(|| "media generation failed".to_owned());
                        if registry.fail_media_task(&task_id, error.clone()) {
                            if let Some(conversation_id) = conversation {
                                let _ = events.send(RuntimeEvent::MediaFailed {
                                    task_id,
                                    conversation_id,
                                    error,
                                });
                            }
                        }
                    }
                    // Progress updates need no registry mutation.
                    MediaTaskStatus::Pending | MediaTaskStatus::Running => {}
                }
            }));
        }

        // ── credits_changed ──────────────────────────────────────────
        {
            let events = events.clone();
            subscriptions.push(connection.subscribe(FrameType::CreditsChanged, move |frame| {
                let payload: CreditsChangedPayload = match frame.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "bad credits_changed payload");
                        return;
                    }
                };
                let _ = events.send(RuntimeEvent::CreditsChanged {
                    credits: payload.credits,
                    delta: payload.delta,
                    reason: payload.reason,
                });
            }));
        }

        Self { subscriptions }
    }

    /// Remove every subscription.
    pub fn detach(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

fn resolve_conversation(
    frame: &Frame,
    streams: &DashMap<TaskId, ConversationId>,
    registry: &TaskRegistry,
) -> Option<ConversationId> {
    if let Some(conversation_id) = &frame.conversation_id {
        return Some(conversation_id.clone());
    }
    let task_id = frame.task_id.as_ref()?;
    if let Some(entry) = streams.get(task_id) {
        return Some(entry.clone());
    }
    registry.conversation_for_chat_task(task_id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tether_connection::testing::{LinkController, MockTransport};
    use tether_connection::{ConnectionState, Transport};
    use tether_core::ids::MessageId;
    use tether_settings::{ConnectionSettings, TaskSettings};
    use tether_tasks::{Task, TaskKind, TaskStatus};

    struct Harness {
        connection: Arc<ConnectionManager>,
        registry: Arc<TaskRegistry>,
        state: Arc<RuntimeState>,
        events: broadcast::Receiver<RuntimeEvent>,
        controller: LinkController,
        _router: MessageRouter,
    }

    async fn harness() -> Harness {
        let (transport, mut controllers) = MockTransport::new();
        let connection = ConnectionManager::new(
            transport as Arc<dyn Transport>,
            ConnectionSettings::default(),
        );
        let registry = Arc::new(TaskRegistry::new(TaskSettings::default()));
        let state = Arc::new(RuntimeState::new());
        let (events_tx, events_rx) = broadcast::channel(64);
        let router = MessageRouter::attach(&connection, &registry, &state, events_tx);

        assert!(connection.start());
        let controller = controllers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(connection.state(), ConnectionState::Connected);

        Harness {
            connection,
            registry,
            state,
            events: events_rx,
            controller,
            _router: router,
        }
    }

    fn conv() -> ConversationId {
        ConversationId::from("c1")
    }

    fn start_registered_task(harness: &Harness) {
        harness
            .registry
            .start_task(Task::new(
                TaskId::from("t1"),
                conv(),
                TaskKind::Chat,
                MessageId::from("ph-1"),
            ))
            .unwrap();
    }

    async fn push(harness: &Harness, frame: serde_json::Value) {
        harness.controller.push_frame(frame.to_string()).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn start_frame() -> serde_json::Value {
        json!({
            "type": "chat_start",
            "payload": {"model": "m", "assistant_message_id": "asst-1"},
            "timestamp": 1,
            "task_id": "t1",
            "conversation_id": "c1"
        })
    }

    fn chunk_frame(text: &str) -> serde_json::Value {
        json!({
            "type": "chat_chunk",
            "payload": {"text": text},
            "timestamp": 2,
            "task_id": "t1"
        })
    }

    fn done_frame() -> serde_json::Value {
        json!({
            "type": "chat_done",
            "payload": {
                "message_id": "asst-1",
                "content": "hello",
                "credits_consumed": 2,
                "model": "m"
            },
            "timestamp": 3,
            "task_id": "t1",
            "conversation_id": "c1"
        })
    }

    #[tokio::test(start_paused = true)]
    async fn full_chat_sequence_empties_registry_and_notifies_once() {
        let mut harness = harness().await;
        start_registered_task(&harness);

        push(&harness, start_frame()).await;
        push(&harness, chunk_frame("hel")).await;
        push(&harness, chunk_frame("lo")).await;
        push(&harness, done_frame()).await;

        // registry holds no entry afterward
        assert!(harness.registry.chat_task(&conv()).is_none());
        // exactly one notification
        assert_eq!(harness.registry.notifications().len(), 1);
        // streaming state cleared
        assert!(!harness.state.is_generating(&conv()));
        assert!(harness.state.streaming_id(&conv()).is_none());
        // the stream placeholder accumulated the chunks
        let (optimistic, _) = harness.state.snapshot(&conv());
        let stream = optimistic.iter().find(|m| m.id.as_str() == "asst-1").unwrap();
        assert_eq!(stream.content, "hello");

        let event = harness.events.recv().await.unwrap();
        assert_matches::assert_matches!(
            event,
            RuntimeEvent::ChatCompleted { content, credits_consumed: 2, .. } if content == "hello"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_done_is_noop() {
        let mut harness = harness().await;
        start_registered_task(&harness);

        push(&harness, start_frame()).await;
        push(&harness, done_frame()).await;
        push(&harness, done_frame()).await;

        assert_eq!(harness.registry.notifications().len(), 1);
        // exactly one completed + one refresh event
        let mut completed = 0;
        let mut refreshes = 0;
        while let Ok(event) = harness.events.try_recv() {
            match event {
                RuntimeEvent::ChatCompleted { .. } => completed += 1,
                RuntimeEvent::RefreshNeeded { .. } => refreshes += 1,
                _ => {}
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(refreshes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_chunk_after_done_is_ignored() {
        let harness = harness().await;
        start_registered_task(&harness);

        push(&harness, start_frame()).await;
        push(&harness, chunk_frame("hello")).await;
        push(&harness, done_frame()).await;
        push(&harness, chunk_frame(" extra")).await;

        let (optimistic, _) = harness.state.snapshot(&conv());
        let stream = optimistic.iter().find(|m| m.id.as_str() == "asst-1").unwrap();
        assert_eq!(stream.content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn chat_error_retains_task_and_pushes_local_error() {
        let mut harness = harness().await;
        start_registered_task(&harness);

        push(&harness, start_frame()).await;
        push(
            &harness,
            json!({
                "type": "chat_error",
                "payload": {"error": "provider unavailable"},
                "timestamp": 3,
                "task_id": "t1"
            }),
        )
        .await;

        // grace-retained with error status
        let task = harness.registry.chat_task(&conv()).unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        // generation flag dropped, local error rendered
        assert!(!harness.state.is_generating(&conv()));
        let (optimistic, _) = harness.state.snapshot(&conv());
        assert!(optimistic.iter().any(|m| m.content == "provider unavailable"));
        // no completion notification for failures
        assert!(harness.registry.notifications().is_empty());

        let event = harness.events.recv().await.unwrap();
        assert_matches::assert_matches!(event, RuntimeEvent::ChatFailed { error, .. } if error == "provider unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_stream_still_renders() {
        // Another tab owns the task; this tab only mirrors state.
        let harness = harness().await;

        push(&harness, start_frame()).await;
        push(&harness, chunk_frame("mirrored")).await;

        assert!(harness.state.is_generating(&conv()));
        let (optimistic, _) = harness.state.snapshot(&conv());
        assert_eq!(optimistic[0].content, "mirrored");
        // but no local registry entry and no notification on done
        assert!(harness.registry.chat_task(&conv()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn media_completion_notifies_and_emits() {
        let mut harness = harness().await;
        harness
            .registry
            .start_media_task(Task::new(
                TaskId::from("m1"),
                conv(),
                TaskKind::Image,
                MessageId::from("ph-m1"),
            ))
            .unwrap();

        push(
            &harness,
            json!({
                "type": "task_status",
                "payload": {
                    "status": "completed",
                    "media_type": "image",
                    "urls": ["https://cdn/a.png"],
                    "credits_consumed": 12
                },
                "timestamp": 5,
                "task_id": "m1",
                "conversation_id": "c1"
            }),
        )
        .await;

        assert!(harness.registry.media_task(&TaskId::from("m1")).is_none());
        assert_eq!(harness.registry.notifications().len(), 1);

        let event = harness.events.recv().await.unwrap();
        assert_matches::assert_matches!(
            event,
            RuntimeEvent::MediaCompleted { result, .. }
                if result["urls"][0] == "https://cdn/a.png"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn media_failure_marks_task_failed() {
        let mut harness = harness().await;
        harness
            .registry
            .start_media_task(Task::new(
                TaskId::from("m1"),
                conv(),
                TaskKind::Video,
                MessageId::from("ph-m1"),
            ))
            .unwrap();

        push(
            &harness,
            json!({
                "type": "task_status",
                "payload": {"status": "failed", "error_message": "nsfw rejected"},
                "timestamp": 5,
                "task_id": "m1"
            }),
        )
        .await;

        let task = harness.registry.media_task(&TaskId::from("m1")).unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some("nsfw rejected"));

        let event = harness.events.recv().await.unwrap();
        assert_matches::assert_matches!(event, RuntimeEvent::MediaFailed { error, .. } if error == "nsfw rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn credits_changed_forwarded() {
        let mut harness = harness().await;
        push(
            &harness,
            json!({
                "type": "credits_changed",
                "payload": {"credits": 88, "delta": -12, "reason": "image generation"},
                "timestamp": 6
            }),
        )
        .await;

        let event = harness.events.recv().await.unwrap();
        assert_matches::assert_matches!(
            event,
            RuntimeEvent::CreditsChanged { credits: 88, delta: -12, .. }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn detach_stops_routing() {
        let harness = harness().await;
        let Harness {
            connection,
            registry,
            state,
            controller,
            _router,
            ..
        } = harness;

        _router.detach();
        controller.push_frame(start_frame().to_string()).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!state.is_generating(&conv()));
        assert!(registry.chat_task(&conv()).is_none());
        drop(connection);
    }
}
