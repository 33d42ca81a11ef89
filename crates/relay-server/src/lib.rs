//! # relay-server
//!
//! Real-time WebSocket fan-out: every payload received from any connected
//! client is forwarded to every connected client, the sender included.
//!
//! - [`coordinator`]: the active set and the single dispatch loop that owns it
//! - [`connection`]: per-connection state and the inbound/outbound pumps
//! - [`ingress`]: the axum upgrade handler and WebSocket transport halves
//! - [`server`]: router, static files, `/health`, `/metrics`, listener
//!
//! Delivery is best-effort and at-most-once. A recipient that cannot keep up
//! is disconnected rather than allowed to slow everyone else down.

#![deny(unsafe_code)]

pub mod connection;
pub mod coordinator;
pub mod errors;
pub mod health;
pub mod ingress;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionState, Mailbox, Pumps, spawn_pumps,
};
pub use coordinator::{BroadcastReport, Coordinator, CoordinatorConfig, CoordinatorHandle};
pub use errors::RelayError;
pub use ingress::IngressError;
pub use server::{AppState, RelayServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
