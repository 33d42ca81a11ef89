//! # relay-core
//!
//! Types shared by every relay crate:
//!
//! - [`ConnectionId`]: opaque per-connection identity
//! - [`Payload`] / [`BroadcastMessage`]: immutable frames fanned out to peers
//! - [`FrameReader`] / [`FrameWriter`]: the duplex transport seam a
//!   connection's pumps run over, with an in-memory implementation in
//!   [`transport::memory`]

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod message;
pub mod transport;

pub use errors::TransportError;
pub use ids::ConnectionId;
pub use message::{BroadcastMessage, FrameKind, Payload};
pub use transport::{FrameReader, FrameWriter, Inbound};
