//! HTTP and WebSocket transport for the Overseer engine.
//!
//! - [`GatewayServer`] builds the axum router: the observer socket at `/ws`, worker
//!   links at `/ws/agent/{agent_id}`, the REST API under `/api` and `/health`.
//! - [`ObserverSession`] is the client side of `/ws`, with a bounded reconnect policy.

/// REST handlers and error mapping.
pub mod api;
/// Reconnecting observer client.
pub mod observer;
/// Inbound frame decoding.
pub mod router;
/// Router construction and socket handlers.
pub mod server;

pub use observer::{ObservedState, ObserverSession, ReconnectPolicy};
pub use router::MessageRouter;
pub use server::GatewayServer;
