//! # tether-tasks
//!
//! In-flight task tracking for the Tether client engine.
//!
//! - [`TaskRegistry`]: catalogue of active chat and media tasks, the
//!   global/per-conversation concurrency ceilings, the completion
//!   notification queue, and the "recently completed" highlight state.
//! - [`PollingEngine`]: generic task-id-keyed polling with a fixed
//!   interval, a wall-clock timeout, and a consecutive-failure budget.
//!   Registration presence is the single ownership token: callbacks fire
//!   exactly once because firing requires atomically removing the
//!   registration first.

#![deny(unsafe_code)]

pub mod errors;
pub mod polling;
pub mod registry;
pub mod types;

pub use errors::{PollError, TaskError};
pub use polling::{PollCallbacks, PollFn, PollFuture, PollOptions, PollOutcome, PollingEngine};
pub use registry::{StartDecision, TaskRegistry};
pub use types::{Notification, Task, TaskKind, TaskStatus};
