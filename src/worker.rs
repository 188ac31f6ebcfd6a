//! The network worker: one task driving the I/O and timers of every registered connection
//!  through the [`DriveConnection`](crate::driver::DriveConnection) interface. Connections are
//!  held in a registry under a mutex and snapshot-copied per iteration; between iterations the
//!  worker sleeps until it is signalled, a socket becomes readable, or the nearest pacing or
//!  timer deadline arrives (capped at one second).

use crate::clock::TICKS_PER_SEC;
use crate::driver::DriveConnection;
use crate::socket::DatagramSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lower bound for the worker's wait so a zero pacing deadline cannot spin the loop hot.
const MIN_WAIT_TICKS: u64 = 1_000;

type ConnectionSlot = Arc<tokio::sync::Mutex<Box<dyn DriveConnection>>>;

struct WorkerInner {
    connections: Mutex<Vec<ConnectionSlot>>,
    notify: Arc<Notify>,
    running: AtomicBool,
}

/// Owns the single worker task. Explicit lifecycle: [`start`](Self::start) spawns the loop,
///  [`stop`](Self::stop) asks it to finish and awaits it. Connections register themselves via
///  [`UdpMessageConnection::connect`](crate::UdpMessageConnection::connect) /
///  [`with_socket`](crate::UdpMessageConnection::with_socket).
pub struct NetworkWorker {
    inner: Arc<WorkerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkWorker {
    pub fn new() -> NetworkWorker {
        NetworkWorker {
            inner: Arc::new(WorkerInner {
                connections: Mutex::new(Vec::new()),
                notify: Arc::new(Notify::new()),
                running: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock().expect("worker handle lock poisoned");
        if handle.is_some() {
            warn!("network worker already started");
            return;
        }
        self.inner.running.store(true, Ordering::Release);
        *handle = Some(tokio::spawn(run_loop(Arc::clone(&self.inner))));
    }

    /// Asks the worker loop to finish and waits for it. Registered connections stay in the
    ///  registry and resume when the worker is started again.
    pub async fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .expect("worker handle lock poisoned")
            .take();
        let Some(handle) = handle else {
            return;
        };
        self.inner.running.store(false, Ordering::Release);
        self.inner.notify.notify_one();
        let _ = handle.await;
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .expect("worker registry lock poisoned")
            .len()
    }

    pub(crate) fn add_connection(&self, driver: Box<dyn DriveConnection>) {
        self.inner
            .connections
            .lock()
            .expect("worker registry lock poisoned")
            .push(Arc::new(tokio::sync::Mutex::new(driver)));
        self.inner.notify.notify_one();
        debug!("connection registered with the network worker");
    }

    /// The signal a connection uses to tell the worker that outbound messages are available.
    pub(crate) fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.notify)
    }
}

impl Default for NetworkWorker {
    fn default() -> Self {
        NetworkWorker::new()
    }
}

async fn run_loop(inner: Arc<WorkerInner>) {
    info!("network worker running");

    while inner.running.load(Ordering::Acquire) {
        let snapshot: Vec<ConnectionSlot> = inner
            .connections
            .lock()
            .expect("worker registry lock poisoned")
            .clone();

        let mut min_wait_ticks = TICKS_PER_SEC;
        let mut sockets: Vec<Arc<dyn DatagramSocket>> = Vec::with_capacity(snapshot.len());
        let mut closed: Vec<ConnectionSlot> = Vec::new();

        for slot in &snapshot {
            let mut connection = slot.lock().await;

            connection.update_connection().await;
            if connection.is_closed() {
                closed.push(Arc::clone(slot));
                continue;
            }

            connection.read_socket().await;
            connection.send_out_packets().await;

            if let Some(ticks) = connection.ticks_until_can_send() {
                min_wait_ticks = min_wait_ticks.min(ticks);
            }
            min_wait_ticks = min_wait_ticks.min(connection.ticks_until_next_timer());
            sockets.push(connection.socket());
        }

        if !closed.is_empty() {
            let mut connections = inner
                .connections
                .lock()
                .expect("worker registry lock poisoned");
            connections.retain(|slot| !closed.iter().any(|c| Arc::ptr_eq(slot, c)));
            debug!("dropped {} closed connections", closed.len());
        }

        let wait = Duration::from_micros(min_wait_ticks.clamp(MIN_WAIT_TICKS, TICKS_PER_SEC));
        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            _ = wait_any_readable(sockets) => {}
        }
    }

    info!("network worker stopped");
}

/// Resolves when any of the sockets has a datagram pending; pends forever on an empty set.
async fn wait_any_readable(sockets: Vec<Arc<dyn DatagramSocket>>) {
    if sockets.is_empty() {
        return futures::future::pending::<()>().await;
    }
    let readables: Vec<_> = sockets
        .into_iter()
        .map(|socket| {
            Box::pin(async move {
                let _ = socket.readable().await;
            })
        })
        .collect();
    futures::future::select_all(readables).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    struct IdleSocket;

    #[async_trait]
    impl DatagramSocket for IdleSocket {
        async fn send_datagram(&self, _payload: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn try_recv_datagram(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }

        async fn readable(&self) -> io::Result<()> {
            futures::future::pending().await
        }

        fn max_send_size(&self) -> usize {
            1472
        }

        fn is_read_open(&self) -> bool {
            true
        }

        fn is_write_open(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    struct StubConnection {
        updates: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        socket: Arc<dyn DatagramSocket>,
    }

    #[async_trait]
    impl DriveConnection for StubConnection {
        async fn update_connection(&mut self) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }

        async fn read_socket(&mut self) {}

        async fn send_out_packets(&mut self) {}

        fn ticks_until_can_send(&self) -> Option<u64> {
            None
        }

        fn ticks_until_next_timer(&self) -> u64 {
            TICKS_PER_SEC
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }

        fn socket(&self) -> Arc<dyn DatagramSocket> {
            Arc::clone(&self.socket)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_drives_registered_connections() {
        let worker = NetworkWorker::new();
        worker.start();

        let updates = Arc::new(AtomicUsize::new(0));
        worker.add_connection(Box::new(StubConnection {
            updates: Arc::clone(&updates),
            closed: Arc::new(AtomicBool::new(false)),
            socket: Arc::new(IdleSocket),
        }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(updates.load(Ordering::Relaxed) >= 2);

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_drops_closed_connections() {
        let worker = NetworkWorker::new();
        worker.start();

        let closed = Arc::new(AtomicBool::new(false));
        worker.add_connection(Box::new(StubConnection {
            updates: Arc::new(AtomicUsize::new(0)),
            closed: Arc::clone(&closed),
            socket: Arc::new(IdleSocket),
        }));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(worker.connection_count(), 1);

        closed.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(worker.connection_count(), 0);

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_restartable() {
        let worker = NetworkWorker::new();
        worker.start();
        worker.stop().await;
        worker.stop().await;

        worker.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.stop().await;
    }
}
