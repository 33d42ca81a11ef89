//! Relay behaviour driven through the dispatch loop and both pumps, using the
//! in-memory transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relay_core::transport::memory::{MemoryPeer, duplex};
use relay_core::{BroadcastMessage, ConnectionId, FrameKind, Payload, TransportError};
use relay_server::{
    CloseReason, Coordinator, CoordinatorConfig, CoordinatorHandle, ConnectionHandle,
    ConnectionState, Pumps, spawn_pumps,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Relay {
    handle: CoordinatorHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Relay {
    fn start(mailbox_capacity: usize) -> Self {
        let (coordinator, handle) = Coordinator::new(CoordinatorConfig {
            mailbox_capacity,
            broadcast_queue_capacity: 64,
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));
        Self {
            handle,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap();
    }
}

struct Client {
    conn: Arc<ConnectionHandle>,
    peer: MemoryPeer,
    pumps: Pumps,
}

impl Client {
    async fn send_text(&self, text: &str) {
        assert!(self.peer.send(Payload::text(text)).await);
    }

    async fn recv_text(&mut self) -> String {
        let payload = timeout(TIMEOUT, self.peer.recv())
            .await
            .expect("timeout waiting for frame")
            .expect("stream closed");
        payload.as_text().expect("text frame").to_owned()
    }

    async fn expect_closed(&mut self) {
        loop {
            let next = timeout(TIMEOUT, self.peer.recv())
                .await
                .expect("timeout waiting for close");
            if next.is_none() {
                return;
            }
        }
    }

    /// Nothing else arrives within a short window.
    async fn expect_quiet(&mut self) {
        let next = timeout(Duration::from_millis(100), self.peer.recv()).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
    }
}

async fn connect_with(
    relay: &Relay,
    id: &str,
    transport_capacity: usize,
    idle_timeout: Option<Duration>,
) -> Client {
    let (reader, writer, peer) = duplex(transport_capacity);
    let (connection, mailbox) = relay.handle.connect(ConnectionId::from(id));
    let conn = Arc::clone(connection.handle());
    relay.handle.join(connection).unwrap();
    let pumps = spawn_pumps(
        Arc::clone(&conn),
        reader,
        writer,
        mailbox,
        relay.handle.clone(),
        idle_timeout,
    );
    wait_until(|| conn.state() != ConnectionState::Pending).await;
    Client { conn, peer, pumps }
}

async fn connect(relay: &Relay, id: &str) -> Client {
    connect_with(relay, id, 64, None).await
}

async fn wait_until(cond: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn member_set(handle: &CoordinatorHandle) -> HashSet<String> {
    handle
        .members()
        .into_iter()
        .map(|id| id.as_str().to_owned())
        .collect()
}

#[tokio::test]
async fn hello_world_scenario() {
    let relay = Relay::start(16);
    let mut a = connect(&relay, "A").await;
    let mut b = connect(&relay, "B").await;
    assert_eq!(relay.handle.connection_count(), 2);

    a.send_text("hello").await;
    assert_eq!(a.recv_text().await, "hello");
    assert_eq!(b.recv_text().await, "hello");
    a.expect_quiet().await;
    b.expect_quiet().await;

    b.peer.hang_up();
    wait_until(|| !relay.handle.contains("B")).await;
    b.expect_closed().await;
    b.pumps.join().await;
    assert_eq!(b.conn.state(), ConnectionState::Closed);

    a.send_text("world").await;
    assert_eq!(a.recv_text().await, "world");
    assert_eq!(member_set(&relay.handle), HashSet::from(["A".to_owned()]));

    relay.stop().await;
}

#[tokio::test]
async fn binary_frames_relayed_unchanged() {
    let relay = Relay::start(16);
    let a = connect(&relay, "a").await;
    let mut b = connect(&relay, "b").await;

    assert!(a.peer.send(Payload::binary(vec![0u8, 159, 146, 150])).await);
    let got = timeout(TIMEOUT, b.peer.recv()).await.unwrap().unwrap();
    assert_eq!(got.kind(), FrameKind::Binary);
    assert_eq!(got.as_bytes(), &[0u8, 159, 146, 150]);

    relay.stop().await;
}

#[tokio::test]
async fn server_originated_broadcast_reaches_everyone() {
    let relay = Relay::start(16);
    let mut a = connect(&relay, "a").await;
    let mut b = connect(&relay, "b").await;

    relay
        .handle
        .broadcast(BroadcastMessage::new(Payload::text("notice")))
        .await
        .unwrap();
    assert_eq!(a.recv_text().await, "notice");
    assert_eq!(b.recv_text().await, "notice");

    relay.stop().await;
}

#[tokio::test]
async fn per_sender_order_is_preserved() {
    let relay = Relay::start(64);
    let a = connect(&relay, "a").await;
    let mut b = connect(&relay, "b").await;

    for i in 0..20 {
        a.send_text(&format!("m{i}")).await;
    }
    for i in 0..20 {
        assert_eq!(b.recv_text().await, format!("m{i}"));
    }

    relay.stop().await;
}

#[tokio::test]
async fn slow_consumer_is_evicted_without_stalling_others() {
    let relay = Relay::start(2);
    let fast = connect_with(&relay, "fast", 64, None).await;
    let mut slow = connect_with(&relay, "slow", 1, None).await;
    let mut watcher = connect_with(&relay, "watcher", 64, None).await;

    // The slow peer never reads: one frame sits in its transport, the writer
    // blocks on the next, and its mailbox fills behind it.
    for i in 0..10 {
        fast.send_text(&format!("m{i}")).await;
    }

    wait_until(|| !relay.handle.contains("slow")).await;
    assert_eq!(slow.conn.state(), ConnectionState::Closed);

    for i in 0..10 {
        assert_eq!(watcher.recv_text().await, format!("m{i}"));
    }

    let mut received = 0;
    while let Some(frame) = timeout(TIMEOUT, slow.peer.recv()).await.unwrap() {
        assert!(frame.as_text().is_some());
        received += 1;
    }
    assert!(received < 10, "evicted consumer saw every frame");
    assert_eq!(
        member_set(&relay.handle),
        HashSet::from(["fast".to_owned(), "watcher".to_owned()])
    );

    relay.stop().await;
}

#[tokio::test]
async fn write_failure_removes_only_that_connection() {
    let relay = Relay::start(16);
    let a = connect(&relay, "a").await;
    let broken = connect(&relay, "broken").await;
    let mut c = connect(&relay, "c").await;

    broken.peer.break_writes();
    a.send_text("ping").await;

    wait_until(|| !relay.handle.contains("broken")).await;
    broken.pumps.join().await;
    assert_eq!(broken.conn.state(), ConnectionState::Closed);
    assert_eq!(c.recv_text().await, "ping");
    assert_eq!(relay.handle.connection_count(), 2);

    relay.stop().await;
}

#[tokio::test]
async fn read_error_removes_connection() {
    let relay = Relay::start(16);
    let mut a = connect(&relay, "a").await;
    let _b = connect(&relay, "b").await;

    assert!(
        a.peer
            .inject_error(TransportError::Protocol("bad frame".into()))
            .await
    );
    wait_until(|| !relay.handle.contains("a")).await;
    a.expect_closed().await;
    assert!(relay.handle.contains("b"));

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn idle_connection_is_closed() {
    let relay = Relay::start(16);
    let mut idle = connect_with(&relay, "idle", 16, Some(Duration::from_secs(1))).await;
    let _active = connect(&relay, "active").await;

    wait_until(|| !relay.handle.contains("idle")).await;
    idle.expect_closed().await;
    assert!(relay.handle.contains("active"));

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn keepalives_hold_off_idle_timeout() {
    let relay = Relay::start(16);
    let mut quiet = connect_with(&relay, "quiet", 16, Some(Duration::from_secs(1))).await;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(quiet.peer.keep_alive().await);
    }
    assert!(relay.handle.contains("quiet"));
    assert_eq!(quiet.conn.state(), ConnectionState::Active);

    // Keepalives are never relayed.
    quiet.expect_quiet().await;

    wait_until(|| !relay.handle.contains("quiet")).await;
    quiet.expect_closed().await;

    relay.stop().await;
}

#[tokio::test]
async fn duplicate_identity_displaces_earlier_connection() {
    let relay = Relay::start(16);
    let mut first = connect(&relay, "dup").await;
    let mut second = connect(&relay, "dup").await;
    let other = connect(&relay, "other").await;

    first.expect_closed().await;
    first.pumps.join().await;
    assert_eq!(first.conn.state(), ConnectionState::Closed);
    assert_eq!(second.conn.state(), ConnectionState::Active);
    assert_eq!(relay.handle.connection_count(), 2);

    other.send_text("after").await;
    assert_eq!(second.recv_text().await, "after");

    // A late leave from the displaced connection is ignored.
    relay
        .handle
        .leave(&first.conn, CloseReason::PeerClosed)
        .unwrap();
    other.send_text("again").await;
    assert_eq!(second.recv_text().await, "again");
    assert!(relay.handle.contains("dup"));

    relay.stop().await;
}

#[tokio::test]
async fn leave_for_non_member_changes_nothing() {
    let relay = Relay::start(16);
    let _a = connect(&relay, "a").await;
    let (stranger, _mailbox) = relay.handle.connect(ConnectionId::from("stranger"));

    relay
        .handle
        .leave(stranger.handle(), CloseReason::PeerClosed)
        .unwrap();
    relay
        .handle
        .broadcast(BroadcastMessage::new(Payload::text("sync")))
        .await
        .unwrap();
    wait_until(|| relay.handle.connection_count() == 1).await;
    assert_eq!(member_set(&relay.handle), HashSet::from(["a".to_owned()]));

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_then_one_broadcast() {
    const N: usize = 64;
    let relay = Relay::start(4);

    let joins: Vec<_> = (0..N)
        .map(|i| {
            let handle = relay.handle.clone();
            tokio::spawn(async move {
                let (connection, mailbox) = handle.connect(ConnectionId::from(format!("c{i}")));
                handle.join(connection).unwrap();
                mailbox
            })
        })
        .collect();
    let mut mailboxes = Vec::with_capacity(N);
    for join in joins {
        mailboxes.push(join.await.unwrap());
    }

    wait_until(|| relay.handle.connection_count() == N).await;
    relay
        .handle
        .broadcast(BroadcastMessage::new(Payload::text("all")))
        .await
        .unwrap();

    for mailbox in &mut mailboxes {
        let got = timeout(TIMEOUT, mailbox.recv()).await.unwrap().unwrap();
        assert_eq!(got.as_text(), Some("all"));
        assert!(mailbox.try_recv().is_none());
    }

    relay.stop().await;
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let relay = Relay::start(16);
    let mut a = connect(&relay, "a").await;
    let mut b = connect(&relay, "b").await;
    let handle = relay.handle.clone();

    relay.stop().await;
    assert_eq!(handle.connection_count(), 0);
    a.expect_closed().await;
    b.expect_closed().await;
    a.pumps.join().await;
    b.pumps.join().await;
    assert_eq!(a.conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn sender_gone_after_shutdown() {
    let relay = Relay::start(16);
    let a = connect(&relay, "a").await;
    relay.stop().await;
    // The inbound pump was cancelled; the peer side can no longer deliver.
    a.pumps.join().await;
    assert!(!a.peer.send(Payload::text("late")).await);
}
