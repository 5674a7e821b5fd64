//! The reconciliation merge.
//!
//! Matching policy, in priority order:
//!
//! 1. Exact id match against the authoritative set → drop the optimistic
//!    copy.
//! 2. A pending send is matched primarily by its idempotency token; with
//!    no token, fall back to (same role, exact content, time delta under
//!    the window) — explicitly heuristic and lossy.
//! 3. The currently streaming placeholder is always retained; it has no
//!    authoritative counterpart yet by construction.
//! 4. A media placeholder is always retained until an external replace
//!    call swaps it.
//! 5. Any other leftover placeholder is matched by exact
//!    (role = assistant, content) equality with no time window.
//!
//! One linear pass over the authoritative list builds id/token/content
//! indexes; each optimistic entry then resolves in O(1) amortized.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use tether_core::ids::MessageId;
use tether_core::messages::{MessageRole, OptimisticKind, OptimisticMessage, PersistedMessage};

/// One entry of the merged timeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TimelineMessage {
    /// Authoritative entry from the durable store.
    Persisted(PersistedMessage),
    /// Surviving optimistic entry.
    Optimistic(OptimisticMessage),
}

impl TimelineMessage {
    /// The message id.
    #[must_use]
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Persisted(m) => &m.id,
            Self::Optimistic(m) => &m.id,
        }
    }

    /// The logical timestamp used for ordering.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Persisted(m) => m.created_at,
            Self::Optimistic(m) => m.created_at,
        }
    }

    /// The message content.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Persisted(m) => &m.content,
            Self::Optimistic(m) => &m.content,
        }
    }

    /// The author role.
    #[must_use]
    pub fn role(&self) -> MessageRole {
        match self {
            Self::Persisted(m) => m.role,
            Self::Optimistic(m) => m.role,
        }
    }

    /// Whether this entry is still optimistic.
    #[must_use]
    pub fn is_optimistic(&self) -> bool {
        matches!(self, Self::Optimistic(_))
    }
}

/// Merges authoritative and optimistic message sets.
pub struct ReconciliationEngine {
    match_window: Duration,
}

impl ReconciliationEngine {
    /// Create an engine with the given heuristic match window.
    #[must_use]
    pub fn new(match_window: Duration) -> Self {
        Self { match_window }
    }

    /// The configured heuristic match window.
    #[must_use]
    pub fn match_window(&self) -> Duration {
        self.match_window
    }

    /// Merge `persisted` (authoritative, any order) with `optimistic`
    /// into one de-duplicated timeline sorted ascending by timestamp.
    ///
    /// `active_stream_id` identifies the placeholder currently receiving
    /// live content; it is always retained.
    #[must_use]
    pub fn merge(
        &self,
        persisted: &[PersistedMessage],
        optimistic: &[OptimisticMessage],
        active_stream_id: Option<&MessageId>,
    ) -> Vec<TimelineMessage> {
        // One linear pass builds every index the matching rules need.
        let mut ids: HashSet<&str> = HashSet::with_capacity(persisted.len());
        let mut tokens: HashSet<&str> = HashSet::new();
        let mut by_role_content: HashMap<(MessageRole, &str), Vec<DateTime<Utc>>> = HashMap::new();
        for message in persisted {
            let _ = ids.insert(message.id.as_str());
            if let Some(token) = message.idempotency_key.as_deref() {
                let _ = tokens.insert(token);
            }
            by_role_content
                .entry((message.role, message.content.as_str()))
                .or_default()
                .push(message.created_at);
        }

        let mut merged: Vec<TimelineMessage> =
            persisted.iter().cloned().map(TimelineMessage::Persisted).collect();

        for message in optimistic {
            if self.survives(message, &ids, &tokens, &by_role_content, active_stream_id) {
                merged.push(TimelineMessage::Optimistic(message.clone()));
            }
        }

        // Stable: equal timestamps keep persisted-before-optimistic and
        // input order.
        merged.sort_by_key(TimelineMessage::timestamp);
        merged
    }

    fn survives(
        &self,
        message: &OptimisticMessage,
        ids: &HashSet<&str>,
        tokens: &HashSet<&str>,
        by_role_content: &HashMap<(MessageRole, &str), Vec<DateTime<Utc>>>,
        active_stream_id: Option<&MessageId>,
    ) -> bool {
        // Rule 1: the store already has this exact message.
        if ids.contains(message.id.as_str()) {
            return false;
        }

        match message.kind {
            OptimisticKind::PendingSend => {
                // Rule 2, primary: idempotency token.
                if let Some(token) = message.idempotency_key.as_deref() {
                    return !tokens.contains(token);
                }
                // Rule 2, fallback: role + content + time window.
                let candidates = by_role_content
                    .get(&(message.role, message.content.as_str()));
                let matched = candidates.is_some_and(|timestamps| {
                    timestamps.iter().any(|persisted_at| {
                        within_window(message.created_at, *persisted_at, self.match_window)
                    })
                });
                if matched {
                    debug!(
                        id = %message.id,
                        "heuristic content match collapsed a pending send"
                    );
                }
                !matched
            }
            // Rule 3: the in-flight stream has no counterpart yet.
            OptimisticKind::Streaming if active_stream_id == Some(&message.id) => true,
            // Rule 4: content equality will never hold for a media
            // placeholder; an external replace swaps it out.
            OptimisticKind::MediaPlaceholder => true,
            // Rule 5: leftover placeholders (a completed stream not yet
            // observed, a local error) match on exact assistant content.
            OptimisticKind::Streaming | OptimisticKind::LocalError => !by_role_content
                .contains_key(&(MessageRole::Assistant, message.content.as_str())),
        }
    }
}

fn within_window(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    let delta = (a - b).abs();
    delta.to_std().is_ok_and(|delta| delta < window)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
