//! # tether-core
//!
//! Foundation types, errors, branded IDs, and utilities for the Tether
//! client engine.
//!
//! This crate provides the shared vocabulary that all other Tether crates
//! depend on:
//!
//! - **Branded IDs**: `TaskId`, `ConversationId`, `MessageId`, `ClientId`
//!   as newtypes for type safety
//! - **Wire frames**: `Frame` and `FrameType` for the push-channel JSON
//!   protocol, plus typed payloads
//! - **Messages**: persisted vs. optimistic message model used by runtime
//!   state and reconciliation
//! - **Backoff**: reconnect delay math with jitter
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod backoff;
pub mod constants;
pub mod frames;
pub mod ids;
pub mod logging;
pub mod messages;

pub use backoff::{ReconnectPolicy, reconnect_delay, restart_jitter_with_random};
pub use frames::{Frame, FrameError, FrameType, epoch_ms};
pub use ids::{ClientId, ConversationId, MessageId, TaskId};
pub use messages::{MessageRole, OptimisticKind, OptimisticMessage, PersistedMessage};
