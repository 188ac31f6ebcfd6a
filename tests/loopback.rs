//! End-to-end scenarios: two connections joined by an in-memory datagram link with
//!  configurable loss, driven by one network worker under a paused runtime so every protocol
//!  timer runs in virtual time.

use async_trait::async_trait;
use mudp::socket::DatagramSocket;
use mudp::{ConnectionConfig, ConnectionState, NetworkWorker, UdpMessageConnection};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const DATA_MSG: u32 = 100;

struct Endpoint {
    queue: Mutex<std::collections::VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl Endpoint {
    fn new() -> Arc<Endpoint> {
        Arc::new(Endpoint {
            queue: Mutex::new(std::collections::VecDeque::new()),
            notify: Notify::new(),
        })
    }
}

/// One side of an in-memory datagram link. Outbound datagrams land in the peer's queue unless
///  the drop decider claims them.
struct LinkSocket {
    peer: Arc<Endpoint>,
    local: Arc<Endpoint>,
    drop_decider: Box<dyn Fn(u64) -> bool + Send + Sync>,
    sent_count: AtomicU64,
    open: AtomicBool,
}

#[async_trait]
impl DatagramSocket for LinkSocket {
    async fn send_datagram(&self, payload: &[u8]) -> io::Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let index = self.sent_count.fetch_add(1, Ordering::Relaxed);
        if (self.drop_decider)(index) {
            return Ok(());
        }
        self.peer.queue.lock().unwrap().push_back(payload.to_vec());
        self.peer.notify.notify_one();
        Ok(())
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.local.queue.lock().unwrap().pop_front() {
            Some(datagram) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok(datagram.len())
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    async fn readable(&self) -> io::Result<()> {
        loop {
            let notified = self.local.notify.notified();
            if !self.local.queue.lock().unwrap().is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }

    fn max_send_size(&self) -> usize {
        1472
    }

    fn is_read_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_write_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

fn link_pair(
    drop_a_to_b: impl Fn(u64) -> bool + Send + Sync + 'static,
    drop_b_to_a: impl Fn(u64) -> bool + Send + Sync + 'static,
) -> (Arc<LinkSocket>, Arc<LinkSocket>) {
    let side_a = Endpoint::new();
    let side_b = Endpoint::new();

    let a = Arc::new(LinkSocket {
        peer: Arc::clone(&side_b),
        local: Arc::clone(&side_a),
        drop_decider: Box::new(drop_a_to_b),
        sent_count: AtomicU64::new(0),
        open: AtomicBool::new(true),
    });
    let b = Arc::new(LinkSocket {
        peer: side_a,
        local: side_b,
        drop_decider: Box::new(drop_b_to_a),
        sent_count: AtomicU64::new(0),
        open: AtomicBool::new(true),
    });
    (a, b)
}

async fn connected_pair(
    worker: &NetworkWorker,
    drop_a_to_b: impl Fn(u64) -> bool + Send + Sync + 'static,
    drop_b_to_a: impl Fn(u64) -> bool + Send + Sync + 'static,
) -> (UdpMessageConnection, UdpMessageConnection) {
    let (socket_a, socket_b) = link_pair(drop_a_to_b, drop_b_to_a);
    let a = UdpMessageConnection::with_socket(
        socket_a,
        ConnectionState::Ok,
        ConnectionConfig::default(),
        worker,
    )
    .await;
    let b = UdpMessageConnection::with_socket(
        socket_b,
        ConnectionState::Ok,
        ConnectionConfig::default(),
        worker,
    )
    .await;
    (a, b)
}

async fn collect_payloads(
    connection: &UdpMessageConnection,
    expected: usize,
    max_wait: Duration,
) -> Vec<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut payloads = Vec::new();
    while payloads.len() < expected && tokio::time::Instant::now() < deadline {
        if let Some(msg) = connection
            .receive_message(Some(Duration::from_millis(50)))
            .await
        {
            assert_eq!(msg.id, DATA_MSG);
            payloads.push(msg.payload);
        }
    }
    payloads
}

#[tokio::test(start_paused = true)]
async fn test_bulk_reliable_delivery_over_lossy_link() {
    let worker = NetworkWorker::new();
    worker.start();

    // every fifth datagram is lost, in both directions
    let (a, b) = connected_pair(&worker, |n| n % 5 == 4, |n| n % 5 == 4).await;

    const COUNT: usize = 10_000;
    for i in 0..COUNT as u32 {
        a.send_message(DATA_MSG, true, true, 0, 0, &i.to_le_bytes())
            .unwrap();
    }

    let payloads = collect_payloads(&b, COUNT, Duration::from_secs(600)).await;
    assert_eq!(payloads.len(), COUNT, "all reliable messages delivered");

    let distinct: HashSet<u32> = payloads
        .iter()
        .map(|p| u32::from_le_bytes(p.as_slice().try_into().unwrap()))
        .collect();
    assert_eq!(distinct.len(), COUNT, "no duplicates reached the application");

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fragmented_megabyte_is_reassembled_byte_identical() {
    let worker = NetworkWorker::new();
    worker.start();

    let (a, b) = connected_pair(&worker, |_| false, |_| false).await;

    let blob: Vec<u8> = (0..1024 * 1024u32).map(|i| (i * 31 + 7) as u8).collect();
    a.send_message(DATA_MSG, true, false, 0, 0, &blob).unwrap();
    assert_eq!(a.open_fragmented_transfers(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
    let received = loop {
        if let Some(msg) = b.receive_message(Some(Duration::from_millis(100))).await {
            break msg;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "fragmented transfer did not complete in time"
        );
        // one oversize message occupies exactly one transfer id while in flight
        assert!(a.open_fragmented_transfers() <= 1);
    };

    assert_eq!(received.id, DATA_MSG);
    assert_eq!(received.payload.len(), blob.len());
    assert_eq!(received.payload, blob);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_paused_content_id_coalescing_sends_only_newest() {
    let worker = NetworkWorker::new();
    worker.start();

    let (a, b) = connected_pair(&worker, |_| false, |_| false).await;

    a.pause_outbound_sends();
    a.send_message(7, false, false, 0, 42, b"a").unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    a.send_message(7, false, false, 0, 42, b"b").unwrap();

    // give the worker time to drain the accept queue while sends stay paused
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.resume_outbound_sends();

    // collect everything that arrives within a second; exactly the newer payload must
    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut received = Vec::new();
    while let Some(msg) = b.receive_message(None).await {
        received.push(msg);
    }
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, 7);
    assert_eq!(received[0].payload, b"b".to_vec());

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_measures_rtt() {
    let worker = NetworkWorker::new();
    worker.start();

    let (a, _b) = connected_pair(&worker, |_| false, |_| false).await;

    assert_eq!(a.rtt_ms(), 0.0);

    // the first ping goes out immediately; wait for its reply to be measured
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while a.rtt_ms() == 0.0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(a.rtt_ms() > 0.0, "ping reply never measured");

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_datagram_is_retransmitted_with_new_packet_id() {
    let worker = NetworkWorker::new();
    worker.start();

    // drop the first three datagrams from A outright; the reliable message must still arrive
    let (a, b) = connected_pair(&worker, |n| n < 3, |_| false).await;

    a.send_message(DATA_MSG, true, false, 0, 0, b"persistent")
        .unwrap();

    let payloads = collect_payloads(&b, 1, Duration::from_secs(60)).await;
    assert_eq!(payloads, vec![b"persistent".to_vec()]);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_handshake_closes_both_sides() {
    let worker = NetworkWorker::new();
    worker.start();

    let (a, b) = connected_pair(&worker, |_| false, |_| false).await;

    a.send_message(DATA_MSG, true, false, 0, 0, b"before close")
        .unwrap();
    assert_eq!(collect_payloads(&b, 1, Duration::from_secs(30)).await.len(), 1);

    a.disconnect(Duration::from_secs(5)).await;
    assert_eq!(a.state(), ConnectionState::Closed);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while b.state() != ConnectionState::Closed && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.state(), ConnectionState::Closed);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let worker = NetworkWorker::new();
    worker.start();

    let (a, b) = connected_pair(&worker, |_| false, |_| false).await;

    a.disconnect(Duration::from_secs(5)).await;
    a.disconnect(Duration::from_secs(1)).await;
    a.disconnect(Duration::from_secs(1)).await;
    assert_eq!(a.state(), ConnectionState::Closed);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while b.state() != ConnectionState::Closed && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_pending_connection_establishes_on_first_inbound_datagram() {
    let worker = NetworkWorker::new();
    worker.start();

    let (socket_a, socket_b) = link_pair(|_| false, |_| false);
    let a = UdpMessageConnection::with_socket(
        socket_a,
        ConnectionState::Pending,
        ConnectionConfig::default(),
        &worker,
    )
    .await;
    let _b = UdpMessageConnection::with_socket(
        socket_b,
        ConnectionState::Ok,
        ConnectionConfig::default(),
        &worker,
    )
    .await;

    // B's first ping establishes A
    assert!(a.wait_to_establish(Duration::from_secs(15)).await);
    assert_eq!(a.state(), ConnectionState::Ok);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_triggers_liveness_close() {
    let worker = NetworkWorker::new();
    worker.start();

    // everything A sends is dropped and B never speaks: A must close itself after the
    // liveness timeout
    let (socket_a, _socket_b) = link_pair(|_| true, |_| true);
    let a = UdpMessageConnection::with_socket(
        socket_a,
        ConnectionState::Ok,
        ConnectionConfig::default(),
        &worker,
    )
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while a.state() != ConnectionState::Closed && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(a.state(), ConnectionState::Closed);

    worker.stop().await;
}
