//! Per-conversation runtime state.
//!
//! Each conversation carries an ordered optimistic-message buffer, the
//! id of the message currently being streamed (if any), and a generating
//! flag. The reconciliation engine consumes snapshots of this state
//! together with the authoritative history.

use dashmap::DashMap;

use tether_core::ids::{ConversationId, MessageId};
use tether_core::messages::OptimisticMessage;

/// Mutable state of one conversation.
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    /// Ordered optimistic messages, oldest first.
    pub optimistic: Vec<OptimisticMessage>,
    /// Id of the message currently receiving streamed content.
    pub streaming_message_id: Option<MessageId>,
    /// Whether a generation is in flight for this conversation.
    pub generating: bool,
}

/// All conversation state for one client instance.
pub struct RuntimeState {
    conversations: DashMap<ConversationId, ConversationState>,
}

impl RuntimeState {
    /// Create empty runtime state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
        }
    }

    /// Append an optimistic message to a conversation's buffer.
    pub fn push_optimistic(&self, conversation_id: &ConversationId, message: OptimisticMessage) {
        self.conversations
            .entry(conversation_id.clone())
            .or_default()
            .optimistic
            .push(message);
    }

    /// Remove an optimistic message by id. Returns `false` if absent.
    pub fn remove_optimistic(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> bool {
        match self.conversations.get_mut(conversation_id) {
            Some(mut state) => {
                let before = state.optimistic.len();
                state.optimistic.retain(|m| m.id != *message_id);
                state.optimistic.len() < before
            }
            None => false,
        }
    }

    /// Swap an optimistic message in place (the external media-placeholder
    /// replace). Returns `false` if absent.
    pub fn replace_optimistic(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        replacement: OptimisticMessage,
    ) -> bool {
        match self.conversations.get_mut(conversation_id) {
            Some(mut state) => {
                match state.optimistic.iter_mut().find(|m| m.id == *message_id) {
                    Some(slot) => {
                        *slot = replacement;
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Begin a stream: push the placeholder, set it active, raise the
    /// generating flag.
    pub fn begin_stream(&self, conversation_id: &ConversationId, placeholder: OptimisticMessage) {
        let mut state = self.conversations.entry(conversation_id.clone()).or_default();
        state.streaming_message_id = Some(placeholder.id.clone());
        state.generating = true;
        state.optimistic.push(placeholder);
    }

    /// Append streamed content to the active streaming message.
    ///
    /// A no-op returning `false` when no stream is active — a late or
    /// duplicate chunk.
    pub fn append_streaming_content(&self, conversation_id: &ConversationId, delta: &str) -> bool {
        match self.conversations.get_mut(conversation_id) {
            Some(mut state) => {
                let Some(active_id) = state.streaming_message_id.clone() else {
                    return false;
                };
                match state.optimistic.iter_mut().find(|m| m.id == active_id) {
                    Some(message) => {
                        message.content.push_str(delta);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Replace the active streaming message's content wholesale (resume
    /// seeding from an accumulated snapshot).
    pub fn set_streaming_content(&self, conversation_id: &ConversationId, content: &str) -> bool {
        match self.conversations.get_mut(conversation_id) {
            Some(mut state) => {
                let Some(active_id) = state.streaming_message_id.clone() else {
                    return false;
                };
                match state.optimistic.iter_mut().find(|m| m.id == active_id) {
                    Some(message) => {
                        message.content.clear();
                        message.content.push_str(content);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// End the stream: clear the active id and the generating flag. The
    /// placeholder stays buffered until reconciliation drops it.
    ///
    /// Returns the previously active id, or `None` when no stream was
    /// active (a duplicate end).
    pub fn end_stream(&self, conversation_id: &ConversationId) -> Option<MessageId> {
        let mut state = self.conversations.get_mut(conversation_id)?;
        state.generating = false;
        state.streaming_message_id.take()
    }

    /// Whether a generation is in flight.
    #[must_use]
    pub fn is_generating(&self, conversation_id: &ConversationId) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|state| state.generating)
    }

    /// The active streaming message id, if any.
    #[must_use]
    pub fn streaming_id(&self, conversation_id: &ConversationId) -> Option<MessageId> {
        self.conversations
            .get(conversation_id)
            .and_then(|state| state.streaming_message_id.clone())
    }

    /// Snapshot for reconciliation: the optimistic buffer plus the
    /// active streaming id.
    #[must_use]
    pub fn snapshot(
        &self,
        conversation_id: &ConversationId,
    ) -> (Vec<OptimisticMessage>, Option<MessageId>) {
        match self.conversations.get(conversation_id) {
            Some(state) => (state.optimistic.clone(), state.streaming_message_id.clone()),
            None => (Vec::new(), None),
        }
    }

    /// Drop a conversation's state entirely.
    pub fn clear(&self, conversation_id: &ConversationId) {
        let _ = self.conversations.remove(conversation_id);
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::from("c1")
    }

    #[test]
    fn begin_stream_sets_active_and_generating() {
        let state = RuntimeState::new();
        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));

        assert!(state.is_generating(&conv()));
        assert_eq!(state.streaming_id(&conv()).as_deref(), Some("s1"));
        let (optimistic, active) = state.snapshot(&conv());
        assert_eq!(optimistic.len(), 1);
        assert_eq!(active.as_deref(), Some("s1"));
    }

    #[test]
    fn append_goes_to_active_stream_only() {
        let state = RuntimeState::new();
        state.push_optimistic(&conv(), OptimisticMessage::pending_send("hi", None));
        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));

        assert!(state.append_streaming_content(&conv(), "hel"));
        assert!(state.append_streaming_content(&conv(), "lo"));

        let (optimistic, _) = state.snapshot(&conv());
        let stream = optimistic.iter().find(|m| m.id.as_str() == "s1").unwrap();
        assert_eq!(stream.content, "hello");
        // the pending send was not touched
        let send = optimistic.iter().find(|m| m.content == "hi").unwrap();
        assert_eq!(send.content, "hi");
    }

    #[test]
    fn append_without_active_stream_is_noop() {
        let state = RuntimeState::new();
        assert!(!state.append_streaming_content(&conv(), "late"));

        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));
        let _ = state.end_stream(&conv());
        assert!(!state.append_streaming_content(&conv(), "late"));
    }

    #[test]
    fn end_stream_clears_flags_keeps_placeholder() {
        let state = RuntimeState::new();
        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));

        let ended = state.end_stream(&conv());
        assert_eq!(ended.as_deref(), Some("s1"));
        assert!(!state.is_generating(&conv()));
        assert!(state.streaming_id(&conv()).is_none());
        // placeholder survives until reconciliation
        let (optimistic, _) = state.snapshot(&conv());
        assert_eq!(optimistic.len(), 1);
    }

    #[test]
    fn duplicate_end_stream_is_noop() {
        let state = RuntimeState::new();
        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));
        assert!(state.end_stream(&conv()).is_some());
        assert!(state.end_stream(&conv()).is_none());
    }

    #[test]
    fn set_streaming_content_replaces() {
        let state = RuntimeState::new();
        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));
        assert!(state.append_streaming_content(&conv(), "partial"));

        assert!(state.set_streaming_content(&conv(), "accumulated snapshot"));
        let (optimistic, _) = state.snapshot(&conv());
        assert_eq!(optimistic[0].content, "accumulated snapshot");
    }

    #[test]
    fn remove_optimistic_by_id() {
        let state = RuntimeState::new();
        let message = OptimisticMessage::pending_send("hi", None);
        let id = message.id.clone();
        state.push_optimistic(&conv(), message);

        assert!(state.remove_optimistic(&conv(), &id));
        assert!(!state.remove_optimistic(&conv(), &id));
        let (optimistic, _) = state.snapshot(&conv());
        assert!(optimistic.is_empty());
    }

    #[test]
    fn replace_optimistic_swaps_in_place() {
        let state = RuntimeState::new();
        let placeholder =
            OptimisticMessage::media_placeholder(MessageId::from("ph-1"), "generating…");
        state.push_optimistic(&conv(), placeholder);
        state.push_optimistic(&conv(), OptimisticMessage::pending_send("after", None));

        let replacement =
            OptimisticMessage::media_placeholder(MessageId::from("ph-1"), "https://cdn/img.png");
        assert!(state.replace_optimistic(&conv(), &MessageId::from("ph-1"), replacement));

        let (optimistic, _) = state.snapshot(&conv());
        // position preserved
        assert_eq!(optimistic[0].content, "https://cdn/img.png");
        assert!(!state.replace_optimistic(
            &conv(),
            &MessageId::from("missing"),
            OptimisticMessage::pending_send("x", None),
        ));
    }

    #[test]
    fn conversations_are_independent() {
        let state = RuntimeState::new();
        let other = ConversationId::from("c2");
        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));

        assert!(!state.is_generating(&other));
        assert!(state.snapshot(&other).0.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let state = RuntimeState::new();
        state.begin_stream(&conv(), OptimisticMessage::streaming(MessageId::from("s1")));
        state.clear(&conv());
        assert!(!state.is_generating(&conv()));
        assert!(state.snapshot(&conv()).0.is_empty());
    }
}
