//! Per-connection state and the two pumps that move frames.
//!
//! A connection is admitted into the active set as a [`Connection`]: a shared
//! [`ConnectionHandle`] plus the sending side of its bounded mailbox. The
//! receiving side ([`Mailbox`]) belongs to the outbound pump.
//!
//! Two tasks run per connection:
//! - the inbound pump reads frames and submits each one as a broadcast
//! - the outbound pump drains the mailbox and writes frames in order
//!
//! Whichever pump stops first cancels the handle, which stops the other one.
//! Exactly one leave request is issued per connection, by the pump that
//! observed the failure. When the coordinator removes a connection itself
//! (eviction, displacement, shutdown) it cancels the handle and no leave is
//! needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use relay_core::{
    BroadcastMessage, ConnectionId, FrameReader, FrameWriter, Inbound, Payload, TransportError,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::coordinator::CoordinatorHandle;

/// Upper bound on flushing and closing the writer once a connection ends.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Upgraded, join not yet processed.
    Pending = 0,
    /// Member of the active set.
    Active = 1,
    /// A pump stopped; leave requested.
    Closing = 2,
    /// Removed from the active set, mailbox closed.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection left the active set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the stream.
    PeerClosed,
    /// Reading from the client failed.
    ReadError,
    /// Writing to the client failed.
    WriteError,
    /// No frame of any kind, pings included, arrived within the idle timeout.
    IdleTimeout,
    /// The mailbox was full when a broadcast arrived.
    Evicted,
    /// The outbound pump stopped without requesting a leave.
    OutboundGone,
    /// Another connection joined with the same identity.
    Displaced,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::IdleTimeout => "idle_timeout",
            Self::Evicted => "evicted",
            Self::OutboundGone => "outbound_gone",
            Self::Displaced => "displaced",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, cheaply-clonable view of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    generation: u64,
    state: AtomicU8,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl ConnectionHandle {
    fn new(id: ConnectionId, generation: u64) -> Self {
        Self {
            id,
            generation,
            state: AtomicU8::new(ConnectionState::Pending as u8),
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
        }
    }

    /// Connection identity.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Distinguishes successive connections that share an identity.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Whether either pump has been told to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the connection starts closing.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `Pending -> Active`. Fails if the connection already started closing.
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Pending as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Pending | Active -> Closing`, and stop both pumps.
    pub(crate) fn begin_close(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            });
        self.cancel.cancel();
    }

    /// Terminal state.
    pub(crate) fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        self.cancel.cancel();
    }
}

/// Outcome of offering a frame to a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    Full,
    Closed,
}

/// Active-set entry: the handle plus the producer side of the mailbox.
#[derive(Debug)]
pub struct Connection {
    handle: Arc<ConnectionHandle>,
    mailbox: mpsc::Sender<Payload>,
}

impl Connection {
    /// Create a pending connection with a mailbox of `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(id: ConnectionId, generation: u64, capacity: usize) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(ConnectionHandle::new(id, generation));
        (
            Self {
                handle,
                mailbox: tx,
            },
            Mailbox { rx },
        )
    }

    /// Shared handle.
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Connection identity.
    pub fn id(&self) -> &ConnectionId {
        self.handle.id()
    }

    /// Non-blocking enqueue.
    pub(crate) fn offer(&self, frame: Payload) -> Delivery {
        match self.mailbox.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Consumer side of a connection's outbound queue.
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::Receiver<Payload>,
}

impl Mailbox {
    /// Next queued frame. `None` once the connection was removed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Next queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Whether the producer side is gone (connection removed).
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

/// Join handles for a connection's pump tasks.
#[derive(Debug)]
pub struct Pumps {
    /// Reads from the client and submits broadcasts.
    pub inbound: JoinHandle<()>,
    /// Drains the mailbox to the client.
    pub outbound: JoinHandle<()>,
}

impl Pumps {
    /// Wait for both pumps to finish.
    pub async fn join(self) {
        let _ = tokio::join!(self.inbound, self.outbound);
    }
}

/// Start both pumps for an admitted connection.
pub fn spawn_pumps<R, W>(
    handle: Arc<ConnectionHandle>,
    reader: R,
    writer: W,
    mailbox: Mailbox,
    coordinator: CoordinatorHandle,
    idle_timeout: Option<Duration>,
) -> Pumps
where
    R: FrameReader,
    W: FrameWriter,
{
    let inbound = tokio::spawn(run_inbound(
        Arc::clone(&handle),
        reader,
        coordinator.clone(),
        idle_timeout,
    ));
    let outbound = tokio::spawn(run_outbound(handle, writer, mailbox, coordinator));
    Pumps { inbound, outbound }
}

enum ReadFailure {
    Idle,
    Transport(TransportError),
}

/// Any frame, keepalives included, restarts the idle deadline.
async fn read_next<R: FrameReader>(
    reader: &mut R,
    idle_timeout: Option<Duration>,
) -> Result<Option<Inbound>, ReadFailure> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.recv()).await {
            Ok(result) => result.map_err(ReadFailure::Transport),
            Err(_) => Err(ReadFailure::Idle),
        },
        None => reader.recv().await.map_err(ReadFailure::Transport),
    }
}

async fn run_inbound<R: FrameReader>(
    handle: Arc<ConnectionHandle>,
    mut reader: R,
    coordinator: CoordinatorHandle,
    idle_timeout: Option<Duration>,
) {
    let cancel = handle.cancellation();
    let reason = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                trace!(conn_id = %handle.id(), "inbound pump cancelled");
                return;
            }
            next = read_next(&mut reader, idle_timeout) => next,
        };

        match next {
            Ok(Some(Inbound::KeepAlive)) => {
                trace!(conn_id = %handle.id(), "keepalive received");
            }
            Ok(Some(Inbound::Frame(payload))) => {
                trace!(conn_id = %handle.id(), bytes = payload.len(), "frame received");
                let message = BroadcastMessage::from_connection(handle.id().clone(), payload);
                if coordinator.broadcast(message).await.is_err() {
                    break CloseReason::Shutdown;
                }
            }
            Ok(None) => break CloseReason::PeerClosed,
            Err(ReadFailure::Idle) => break CloseReason::IdleTimeout,
            Err(ReadFailure::Transport(e)) => {
                debug!(conn_id = %handle.id(), kind = e.kind(), error = %e, "read failed");
                break CloseReason::ReadError;
            }
        }
    };

    handle.begin_close();
    if coordinator.leave(&handle, reason).is_err() {
        trace!(conn_id = %handle.id(), "coordinator gone, leave dropped");
    }
}

async fn run_outbound<W: FrameWriter>(
    handle: Arc<ConnectionHandle>,
    mut writer: W,
    mut mailbox: Mailbox,
    coordinator: CoordinatorHandle,
) {
    let cancel = handle.cancellation();
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = mailbox.recv() => frame,
        };
        // Sender dropped: the coordinator already removed this connection.
        let Some(frame) = frame else { break };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = writer.send(frame) => result,
        };
        if let Err(e) = result {
            debug!(conn_id = %handle.id(), kind = e.kind(), error = %e, "write failed");
            handle.begin_close();
            if coordinator.leave(&handle, CloseReason::WriteError).is_err() {
                trace!(conn_id = %handle.id(), "coordinator gone, leave dropped");
            }
            break;
        }
    }

    match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(conn_id = %handle.id(), error = %e, "close failed"),
        Err(_) => trace!(conn_id = %handle.id(), "close timed out"),
    }
}
