//! # tether-reconcile
//!
//! Merges the authoritative message history with locally synthesized
//! optimistic entries into one de-duplicated timeline, sorted ascending
//! by logical timestamp.
//!
//! Matching is heuristic by design in exactly one place (content plus a
//! time window, when a pending send carries no idempotency token); the
//! worst case is a transient visual duplicate or a too-early drop that
//! self-heals on the next authoritative refresh. Reconciliation itself
//! never fails.

#![deny(unsafe_code)]

pub mod engine;

pub use engine::{ReconciliationEngine, TimelineMessage};
