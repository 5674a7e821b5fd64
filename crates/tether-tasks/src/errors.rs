//! Task and polling error types.

use std::time::Duration;

use thiserror::Error;

use tether_core::ids::{ConversationId, TaskId};

/// Errors raised by the task registry.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The conversation already has an active chat task.
    #[error("conversation {conversation_id} already has an active chat task")]
    ConversationBusy {
        /// The busy conversation.
        conversation_id: ConversationId,
    },

    /// A media task with this id is already registered.
    #[error("media task {task_id} is already registered")]
    DuplicateMediaTask {
        /// The duplicated task id.
        task_id: TaskId,
    },
}

/// Terminal polling failures delivered to `on_error`.
///
/// Both variants are final: the engine has already deleted the
/// registration and will not invoke the poll function again.
#[derive(Debug, Error)]
pub enum PollError {
    /// The consecutive-failure budget was exhausted; the task has most
    /// likely expired server-side.
    #[error("task likely expired after {failures} consecutive poll failures")]
    Expired {
        /// Number of consecutive failures observed.
        failures: u32,
    },

    /// The wall-clock budget was exceeded before the task finished.
    #[error("polling timed out after {elapsed:?} (budget {budget:?})")]
    TimedOut {
        /// Time elapsed since polling started.
        elapsed: Duration,
        /// The configured budget.
        budget: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_busy_display() {
        let err = TaskError::ConversationBusy {
            conversation_id: ConversationId::from("c1"),
        };
        assert!(err.to_string().contains("c1"));
        assert!(err.to_string().contains("active chat task"));
    }

    #[test]
    fn poll_error_variants_are_distinct() {
        let expired = PollError::Expired { failures: 5 };
        let timeout = PollError::TimedOut {
            elapsed: Duration::from_secs(601),
            budget: Duration::from_secs(600),
        };
        assert!(expired.to_string().contains("expired"));
        assert!(timeout.to_string().contains("timed out"));
    }
}
