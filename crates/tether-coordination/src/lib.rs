//! # tether-coordination
//!
//! Cross-tab coordination for the Tether client engine.
//!
//! Two primitives with very different guarantees:
//!
//! - [`LeaseStore`] + [`CrossTabCoordinator`]: a durable, time-bounded
//!   lease over a task id so at most one client instance polls or streams
//!   a given task. This is the only safety-critical cross-tab primitive.
//!   It is a best-effort, TTL-based approximation (heartbeat renewal,
//!   last-writer-wins), deliberately NOT a linearizable lock.
//! - [`TabBroadcaster`]: best-effort pub/sub for advisory notices (task
//!   started/completed/failed, credits changed, "already resumed
//!   elsewhere"). Loss or duplication here must never affect correctness.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod coordinator;
pub mod errors;
pub mod lease;

pub use broadcast::{AdvisoryType, BroadcastEnvelope, BroadcastSubscription, TabBroadcaster};
pub use coordinator::CrossTabCoordinator;
pub use errors::{CoordinationError, Result};
pub use lease::{Lease, LeaseStore};
