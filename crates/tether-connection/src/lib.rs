//! # tether-connection
//!
//! The one live push connection per client instance.
//!
//! [`ConnectionManager`] owns the lifecycle: connect, dispatch inbound
//! frames to per-type subscribers, answer heartbeats, reconnect with
//! exponential backoff after abnormal closes, and jitter-delay the
//! reconnect when the server announces a restart (so a fleet of clients
//! does not stampede back at once).
//!
//! Outbound [`ConnectionManager::send`] is fire-and-forget: frames are
//! dropped silently while not connected. There is deliberately no
//! outbound queue — a documented limitation of the protocol, not a gap.
//!
//! The wire transport is a trait seam: [`transport::WsTransport`] for
//! production, [`testing::MockTransport`] for deterministic tests.

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod testing;
pub mod transport;

pub use errors::ConnectionError;
pub use manager::{ConnectionManager, ConnectionState, Subscription};
pub use transport::{Transport, TransportEvent, TransportLink, WsTransport};
