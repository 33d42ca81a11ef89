//! The duplex transport seam.
//!
//! A connection runs over two independently owned halves: a [`FrameReader`]
//! driven by the inbound pump and a [`FrameWriter`] driven by the outbound
//! pump. The WebSocket adapter lives in the server crate; [`memory`] provides
//! an in-process pair for tests.

pub mod memory;

use async_trait::async_trait;

use crate::errors::TransportError;
use crate::message::Payload;

/// One successful read from the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// An application payload to fan out.
    Frame(Payload),
    /// Protocol-level traffic (ping, pong) with nothing to relay. Still proof
    /// the peer is alive.
    KeepAlive,
}

/// Receiving half of a duplex frame stream.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// Sending half of a duplex frame stream.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Write one payload to the peer.
    async fn send(&mut self, payload: Payload) -> Result<(), TransportError>;

    /// Close the stream. Closing an already closed stream is not an error
    /// callers need to act on.
    async fn close(&mut self) -> Result<(), TransportError>;
}
