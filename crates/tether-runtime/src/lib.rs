//! # tether-runtime
//!
//! The per-session runtime of the Tether client engine.
//!
//! - [`RuntimeState`]: per-conversation optimistic message buffers, the
//!   active streaming id, and the generating flag.
//! - [`MessageRouter`]: translates push-channel frames into task
//!   registry and runtime-state mutations, tolerating at-least-once
//!   delivery.
//! - [`api::ApiClient`]: the HTTP collaborators (pending tasks, status
//!   and content polls, the resume event stream).
//! - [`RecoveryManager`]: re-attaches to server-reported pending tasks
//!   after a reload, via push-resume or poll fallback.
//! - [`SessionRuntime`]: the explicitly-owned service-object bundle with
//!   an initialize/teardown lifecycle — one instance per client
//!   instance, no ambient globals.

#![deny(unsafe_code)]

pub mod api;
pub mod errors;
pub mod events;
pub mod recovery;
pub mod router;
pub mod session;
pub mod state;

pub use api::{ApiClient, HttpApiClient, PendingTask, PollStatus};
pub use errors::{ApiError, RecoveryError};
pub use events::RuntimeEvent;
pub use recovery::RecoveryManager;
pub use router::MessageRouter;
pub use session::SessionRuntime;
pub use state::{ConversationState, RuntimeState};
