//! In-process duplex transport.
//!
//! [`duplex`] returns the server-side halves plus a [`MemoryPeer`] playing
//! the remote client. The peer can push frames or keepalives, inject read
//! errors, hang up, stop reading (to simulate a slow consumer), or make writes
//! fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{FrameReader, FrameWriter, Inbound};
use crate::errors::TransportError;
use crate::message::Payload;

/// Build a connected in-memory stream.
///
/// `capacity` bounds each direction. A peer that stops calling
/// [`MemoryPeer::recv`] blocks the writer once `capacity` frames are
/// buffered, like a TCP peer with a full receive window.
pub fn duplex(capacity: usize) -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let broken = Arc::new(AtomicBool::new(false));
    (
        MemoryReader { rx: inbound_rx },
        MemoryWriter {
            tx: Some(outbound_tx),
            broken: Arc::clone(&broken),
        },
        MemoryPeer {
            to_server: Some(inbound_tx),
            from_server: outbound_rx,
            broken,
        },
    )
}

/// Server-side receiving half.
pub struct MemoryReader {
    rx: mpsc::Receiver<Result<Inbound, TransportError>>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(inbound)) => Ok(Some(inbound)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Server-side sending half.
pub struct MemoryWriter {
    tx: Option<mpsc::Sender<Payload>>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, payload: Payload) -> Result<(), TransportError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer reset",
            )));
        }
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(payload).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        drop(self.tx.take());
        Ok(())
    }
}

/// The remote end of a [`duplex`] stream.
pub struct MemoryPeer {
    to_server: Option<mpsc::Sender<Result<Inbound, TransportError>>>,
    from_server: mpsc::Receiver<Payload>,
    broken: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Send a payload to the server. Returns `false` once the server side
    /// stopped reading or the peer hung up.
    pub async fn send(&self, payload: Payload) -> bool {
        self.push(Ok(Inbound::Frame(payload))).await
    }

    /// Send a ping-like frame that carries no payload.
    pub async fn keep_alive(&self) -> bool {
        self.push(Ok(Inbound::KeepAlive)).await
    }

    /// Make the server's next read fail with `error`.
    pub async fn inject_error(&self, error: TransportError) -> bool {
        self.push(Err(error)).await
    }

    async fn push(&self, item: Result<Inbound, TransportError>) -> bool {
        match &self.to_server {
            Some(tx) => tx.send(item).await.is_ok(),
            None => false,
        }
    }

    /// Close the peer's sending direction. The server reads end-of-stream
    /// after draining anything already sent.
    pub fn hang_up(&mut self) {
        drop(self.to_server.take());
    }

    /// Make every subsequent server write fail.
    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Next frame written by the server, or `None` once the server closed
    /// its writer and everything buffered was read.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.from_server.recv().await
    }

    /// Whether the server closed its writer (or dropped it).
    pub fn is_closed_by_server(&self) -> bool {
        self.from_server.is_closed() && self.from_server.is_empty()
    }
}
