//! The active set and the dispatch loop that mutates it.
//!
//! Join and leave requests and broadcasts arrive on three queues owned by a
//! single [`Coordinator`] task. Joins and leaves are unbounded so a flood of
//! broadcasts can never starve membership changes; the broadcast queue is
//! bounded so a fast sender is slowed down instead of growing memory.
//!
//! A broadcast never waits on a recipient. Each frame is offered to every
//! mailbox with `try_send`; a connection whose mailbox is full is evicted on
//! the spot. A closed mailbox means the outbound pump is gone: the connection
//! is left to its pending leave, or removed directly if none was requested.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use relay_core::{BroadcastMessage, ConnectionId, Payload};
use relay_settings::ServerSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionState, Delivery, Mailbox,
};
use crate::errors::RelayError;
use crate::metrics;

/// Queue sizing for the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Frames each connection may have queued before it is evicted.
    pub mailbox_capacity: usize,
    /// Broadcasts buffered ahead of the dispatch loop.
    pub broadcast_queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            broadcast_queue_capacity: 1024,
        }
    }
}

impl From<&ServerSettings> for CoordinatorConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            mailbox_capacity: settings.mailbox_capacity,
            broadcast_queue_capacity: settings.broadcast_queue_capacity,
        }
    }
}

/// Result of one broadcast pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Mailboxes the frame was queued on.
    pub delivered: usize,
    /// Connections removed because their mailbox could not take the frame.
    pub evicted: Vec<ConnectionId>,
}

/// Connections currently eligible to receive broadcasts.
///
/// Reads take the shared lock; only the dispatch loop takes the exclusive
/// lock.
#[derive(Debug, Default)]
pub(crate) struct ActiveSet {
    members: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ActiveSet {
    fn len(&self) -> usize {
        self.members.read().len()
    }

    fn contains(&self, id: &str) -> bool {
        self.members.read().contains_key(id)
    }

    fn ids(&self) -> Vec<ConnectionId> {
        self.members.read().keys().cloned().collect()
    }

    fn insert(&self, connection: Connection) -> Option<Connection> {
        let id = connection.id().clone();
        self.members.write().insert(id, connection)
    }

    /// Remove `id` only if the current entry is the same generation.
    fn remove_if(&self, id: &ConnectionId, generation: u64) -> Option<Connection> {
        let mut members = self.members.write();
        match members.get(id) {
            Some(current) if current.handle().generation() == generation => members.remove(id),
            _ => None,
        }
    }

    fn offer(
        &self,
        id: &ConnectionId,
        frame: &Payload,
    ) -> Option<(Delivery, Arc<ConnectionHandle>)> {
        let members = self.members.read();
        members
            .get(id)
            .map(|c| (c.offer(frame.clone()), Arc::clone(c.handle())))
    }

    fn drain(&self) -> Vec<Connection> {
        self.members.write().drain().map(|(_, c)| c).collect()
    }
}

struct LeaveRequest {
    handle: Arc<ConnectionHandle>,
    reason: CloseReason,
}

/// Sole writer of the active set. Run it with [`Coordinator::run`].
pub struct Coordinator {
    active: Arc<ActiveSet>,
    join_rx: mpsc::UnboundedReceiver<Connection>,
    leave_rx: mpsc::UnboundedReceiver<LeaveRequest>,
    broadcast_rx: mpsc::Receiver<BroadcastMessage>,
}

impl Coordinator {
    /// Build a coordinator and the handle used to feed it.
    ///
    /// # Panics
    ///
    /// Panics if `broadcast_queue_capacity` is zero.
    pub fn new(config: CoordinatorConfig) -> (Self, CoordinatorHandle) {
        let active = Arc::new(ActiveSet::default());
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        let (leave_tx, leave_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_queue_capacity);

        let coordinator = Self {
            active: Arc::clone(&active),
            join_rx,
            leave_rx,
            broadcast_rx,
        };
        let handle = CoordinatorHandle {
            active,
            join_tx,
            leave_tx,
            broadcast_tx,
            next_generation: Arc::new(AtomicU64::new(1)),
            mailbox_capacity: config.mailbox_capacity,
        };
        (coordinator, handle)
    }

    /// Admit a connection. A member with the same identity is displaced and
    /// closed.
    pub fn join(&self, connection: Connection) {
        let handle = Arc::clone(connection.handle());
        if !handle.activate() {
            debug!(conn_id = %handle.id(), "connection closed before admission");
            handle.mark_closed();
            return;
        }

        if let Some(previous) = self.active.insert(connection) {
            warn!(
                conn_id = %handle.id(),
                previous_generation = previous.handle().generation(),
                "duplicate connection id, closing previous connection"
            );
            self.release(previous, CloseReason::Displaced);
        }
        let active = self.active.len();
        metrics::record_admitted(active);
        info!(conn_id = %handle.id(), active, "connection joined");
    }

    /// Remove a connection. Returns `false` (and changes nothing) if it is not
    /// a member, including when a newer connection now holds its identity.
    pub fn leave(&self, handle: &ConnectionHandle, reason: CloseReason) -> bool {
        match self.active.remove_if(handle.id(), handle.generation()) {
            Some(connection) => {
                self.release(connection, reason);
                true
            }
            None => {
                trace!(conn_id = %handle.id(), %reason, "leave for non-member ignored");
                false
            }
        }
    }

    /// Offer `message` to every member without waiting on any of them.
    pub fn broadcast(&self, message: &BroadcastMessage) -> BroadcastReport {
        let frame = message.to_frame();
        let recipients = self.active.ids();
        let mut report = BroadcastReport::default();

        for id in &recipients {
            // Removed since the snapshot.
            let Some((delivery, handle)) = self.active.offer(id, &frame) else {
                continue;
            };
            match delivery {
                Delivery::Queued => report.delivered += 1,
                Delivery::Full => {
                    if let Some(connection) = self.active.remove_if(id, handle.generation()) {
                        warn!(conn_id = %id, "mailbox full, evicting slow connection");
                        self.release(connection, CloseReason::Evicted);
                        report.evicted.push(id.clone());
                    }
                }
                // A closing connection already queued a leave with the real reason.
                Delivery::Closed if handle.state() == ConnectionState::Closing => {
                    trace!(conn_id = %id, "mailbox closed, leave pending");
                }
                Delivery::Closed => {
                    if let Some(connection) = self.active.remove_if(id, handle.generation()) {
                        debug!(conn_id = %id, "outbound pump gone, removing connection");
                        self.release(connection, CloseReason::OutboundGone);
                    }
                }
            }
        }

        metrics::record_broadcast(report.delivered, report.evicted.len());
        debug!(
            origin = ?message.origin().map(ConnectionId::as_str),
            queued_ms = (Utc::now() - message.received_at()).num_milliseconds(),
            bytes = frame.len(),
            recipients = recipients.len(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "broadcast dispatched"
        );
        report
    }

    /// Process events until `shutdown` fires, then close all remaining
    /// connections.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("dispatch loop started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(connection) = self.join_rx.recv() => self.join(connection),
                Some(request) = self.leave_rx.recv() => {
                    let _ = self.leave(&request.handle, request.reason);
                }
                Some(message) = self.broadcast_rx.recv() => {
                    let _ = self.broadcast(&message);
                }
                else => break,
            }
        }
        let closed = self.close_all();
        info!(closed, "dispatch loop stopped");
    }

    fn close_all(&self) -> usize {
        let remaining = self.active.drain();
        let count = remaining.len();
        for connection in remaining {
            self.release(connection, CloseReason::Shutdown);
        }
        count
    }

    fn release(&self, connection: Connection, reason: CloseReason) {
        let handle = connection.handle();
        handle.mark_closed();
        info!(
            conn_id = %handle.id(),
            reason = reason.as_str(),
            age_ms = u64::try_from(handle.age().as_millis()).unwrap_or(u64::MAX),
            "connection removed"
        );
        metrics::record_removed(reason.as_str(), self.active.len());
    }
}

/// Cloneable front door to a running [`Coordinator`].
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    active: Arc<ActiveSet>,
    join_tx: mpsc::UnboundedSender<Connection>,
    leave_tx: mpsc::UnboundedSender<LeaveRequest>,
    broadcast_tx: mpsc::Sender<BroadcastMessage>,
    next_generation: Arc<AtomicU64>,
    mailbox_capacity: usize,
}

impl CoordinatorHandle {
    /// Create a pending connection for `id` with a fresh generation.
    pub fn connect(&self, id: ConnectionId) -> (Connection, Mailbox) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        Connection::new(id, generation, self.mailbox_capacity)
    }

    /// Queue a join request.
    pub fn join(&self, connection: Connection) -> Result<(), RelayError> {
        self.join_tx.send(connection).map_err(|rejected| {
            rejected.0.handle().mark_closed();
            RelayError::CoordinatorGone
        })
    }

    /// Queue a leave request.
    pub fn leave(
        &self,
        handle: &Arc<ConnectionHandle>,
        reason: CloseReason,
    ) -> Result<(), RelayError> {
        self.leave_tx
            .send(LeaveRequest {
                handle: Arc::clone(handle),
                reason,
            })
            .map_err(|_| RelayError::CoordinatorGone)
    }

    /// Queue a broadcast, waiting while the broadcast queue is full.
    pub async fn broadcast(&self, message: BroadcastMessage) -> Result<(), RelayError> {
        self.broadcast_tx
            .send(message)
            .await
            .map_err(|_| RelayError::CoordinatorGone)
    }

    /// Current number of members.
    pub fn connection_count(&self) -> usize {
        self.active.len()
    }

    /// Whether `id` is currently a member.
    pub fn contains(&self, id: &str) -> bool {
        self.active.contains(id)
    }

    /// Snapshot of member identities.
    pub fn members(&self) -> Vec<ConnectionId> {
        self.active.ids()
    }

    /// Whether the dispatch loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.join_tx.is_closed()
    }
}
