//! The application-facing side of a connection: message submission (including the fragmenting
//!  of oversize messages), inbound pickup, pause/resume, the connection state cell and the
//!  graceful shutdown entry points. The wire engine itself lives in `driver`; exactly two
//!  actors ever touch a connection - the application through this handle and the worker
//!  through the driver.

use crate::config::{ConnectionConfig, SEND_HEADER_UPPER_BOUND};
use crate::driver::UdpConnectionDriver;
use crate::error::NetError;
use crate::fragment::FragmentedSendManager;
use crate::message::{msg_id, FragmentInfo, MessageId, MessagePool, NetworkMessage, MAX_PRIORITY};
use crate::socket::{ConnectedUdpSocket, DatagramSocket};
use crate::stats::{ConnectionRates, ConnectionStatistics};
use crate::worker::NetworkWorker;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client-initiated connection waiting for the first inbound datagram.
    Pending,
    Ok,
    /// A disconnect was sent locally or received from the peer; waiting for the handshake to
    ///  finish.
    Disconnecting,
    /// The peer will not send any more data.
    PeerClosed,
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Ok,
            2 => ConnectionState::Disconnecting,
            3 => ConnectionState::PeerClosed,
            _ => ConnectionState::Closed,
        }
    }
}

/// Lock-free state cell shared between the application handle and the worker.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> StateCell {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Receives decoded application messages, and optionally assigns them a content id for
///  latest-state-wins coalescing on the receive side.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync {
    /// A non-zero key makes this message supersede earlier messages with the same
    ///  (message id, content id). The default disables coalescing.
    fn content_id(&self, message_id: MessageId, payload: &[u8]) -> u32 {
        let _ = (message_id, payload);
        0
    }

    fn on_message(&self, message_id: MessageId, payload: &[u8]);
}

/// A decoded application message popped via [`UdpMessageConnection::receive_message`].
#[derive(Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// State shared between the handle and the driver.
pub(crate) struct ConnectionShared {
    pub config: ConnectionConfig,
    pub state: StateCell,
    pub outbound_sends_paused: AtomicBool,
    pub disconnect_sent: AtomicBool,
    pub worker_notify: Arc<Notify>,
    pub stats: Mutex<ConnectionStatistics>,
    pub fragmented_sends: Mutex<FragmentedSendManager>,
    pub handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    pub pool: MessagePool,
    pub rates: Mutex<ConnectionRates>,
    pub rtt_ms: Mutex<f64>,
    pub last_heard_age_ms: AtomicU32,
    message_number: AtomicU32,
    reliable_message_number: AtomicU32,
}

impl ConnectionShared {
    pub fn new(
        config: ConnectionConfig,
        initial_state: ConnectionState,
        worker_notify: Arc<Notify>,
    ) -> ConnectionShared {
        ConnectionShared {
            config,
            state: StateCell::new(initial_state),
            outbound_sends_paused: AtomicBool::new(false),
            disconnect_sent: AtomicBool::new(false),
            worker_notify,
            stats: Mutex::new(ConnectionStatistics::new()),
            fragmented_sends: Mutex::new(FragmentedSendManager::new()),
            handler: RwLock::new(None),
            pool: MessagePool::new(1024),
            rates: Mutex::new(ConnectionRates::default()),
            rtt_ms: Mutex::new(0.0),
            last_heard_age_ms: AtomicU32::new(0),
            message_number: AtomicU32::new(0),
            reliable_message_number: AtomicU32::new(0),
        }
    }

    pub fn next_message_number(&self) -> u32 {
        self.message_number.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_reliable_message_number(&self) -> u32 {
        self.reliable_message_number.fetch_add(1, Ordering::Relaxed)
    }

    pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().expect("handler lock poisoned").clone()
    }

    pub fn is_paused(&self) -> bool {
        self.outbound_sends_paused.load(Ordering::Acquire)
    }

    /// Wakes the worker unless outbound sends are paused - a paused connection keeps
    ///  accepting enqueues but stops signalling.
    pub fn signal_outbound_available(&self) {
        if !self.is_paused() {
            self.worker_notify.notify_one();
        }
    }

    /// Smooths a new ping round-trip measurement into the connection RTT estimate.
    pub fn feed_rtt_sample(&self, rtt_ms: f64) {
        let mut rtt = self.rtt_ms.lock().expect("rtt lock poisoned");
        *rtt = 0.5 * rtt_ms + 0.5 * *rtt;
    }
}

/// A bidirectional message connection over UDP.
///
/// The handle is the application's side: it never blocks inside the engine, all waiting entry
///  points poll in short sleeps. All I/O and protocol work happens on the [`NetworkWorker`]
///  the connection was registered with.
pub struct UdpMessageConnection {
    shared: Arc<ConnectionShared>,
    accept_tx: mpsc::Sender<NetworkMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<NetworkMessage>>,
}

impl UdpMessageConnection {
    /// Binds a local UDP socket, connects it to `peer` and registers the connection with the
    ///  worker. The connection starts out `Pending` and becomes `Ok` when the first datagram
    ///  arrives from the peer; use [`wait_to_establish`](Self::wait_to_establish) to block on
    ///  that.
    pub async fn connect(
        bind_addr: SocketAddr,
        peer: SocketAddr,
        config: ConnectionConfig,
        worker: &NetworkWorker,
    ) -> anyhow::Result<UdpMessageConnection> {
        config.validate()?;
        let socket =
            Arc::new(ConnectedUdpSocket::connect(bind_addr, peer, config.max_send_size).await?);
        info!("connecting to {}", peer);
        Ok(Self::with_socket(socket, ConnectionState::Pending, config, worker).await)
    }

    /// Builds a connection on an externally provided socket - an accepted server-side socket
    ///  (state `Ok`) or a custom [`DatagramSocket`] implementation.
    pub async fn with_socket(
        socket: Arc<dyn DatagramSocket>,
        initial_state: ConnectionState,
        config: ConnectionConfig,
        worker: &NetworkWorker,
    ) -> UdpMessageConnection {
        let (accept_tx, accept_rx) = mpsc::channel(config.outbound_accept_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);

        let shared = Arc::new(ConnectionShared::new(
            config,
            initial_state,
            worker.notify_handle(),
        ));

        let driver = UdpConnectionDriver::new(Arc::clone(&shared), socket, accept_rx, inbound_tx);
        worker.add_connection(Box::new(driver));

        UdpMessageConnection {
            shared,
            accept_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.shared.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    /// Submits a message. The payload is copied; the call never blocks.
    ///
    /// With the accept queue full, a reliable submission fails loudly with
    ///  [`NetError::QueueFull`] while an unreliable one is dropped silently. A message whose
    ///  wire size cannot fit one datagram is split into fragments here, under the
    ///  fragmented-send lock; fragments are always reliable.
    pub fn send_message(
        &self,
        id: MessageId,
        reliable: bool,
        in_order: bool,
        priority: u32,
        content_id: u32,
        payload: &[u8],
    ) -> Result<(), NetError> {
        match self.state() {
            ConnectionState::Pending | ConnectionState::Ok => {}
            _ => return Err(NetError::SocketClosed),
        }

        if payload.len() + SEND_HEADER_UPPER_BOUND > self.shared.config.max_send_size {
            self.split_and_enqueue(id, reliable, in_order, priority, content_id, payload)?;
        } else {
            let mut msg = self.shared.pool.allocate();
            msg.id = id;
            msg.reliable = reliable;
            msg.in_order = in_order;
            msg.priority = priority;
            msg.content_id = content_id;
            msg.message_number = self.shared.next_message_number();
            msg.reliable_message_number = if reliable {
                self.shared.next_reliable_message_number()
            } else {
                0
            };
            msg.payload.extend_from_slice(payload);

            self.enqueue_for_accept(msg)?;
        }

        self.shared.signal_outbound_available();
        Ok(())
    }

    fn enqueue_for_accept(&self, msg: NetworkMessage) -> Result<(), NetError> {
        match self.accept_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) | Err(mpsc::error::TrySendError::Closed(msg)) => {
                let reliable = msg.reliable;
                self.shared.pool.free(msg);
                if reliable {
                    error!("outbound accept queue is full - rejecting a reliable message");
                    debug_assert!(false, "reliable message lost to a full accept queue");
                    Err(NetError::QueueFull)
                } else {
                    debug!("outbound accept queue is full - dropping an unreliable message");
                    Ok(())
                }
            }
        }
    }

    /// Splits an oversize message into roughly equal reliable fragments sharing one
    ///  fragmented transfer and one reliable message number.
    fn split_and_enqueue(
        &self,
        id: MessageId,
        reliable: bool,
        in_order: bool,
        priority: u32,
        content_id: u32,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let max_fragment_size = self.shared.config.max_fragment_size();
        let total_fragments = payload.len().div_ceil(max_fragment_size);

        if !reliable {
            debug!(
                "upgrading an unreliable message of {} bytes to reliable: it has to be fragmented \
                 and a lost fragment would waste the whole transfer",
                payload.len()
            );
        }

        let reliable_message_number = self.shared.next_reliable_message_number();
        let transfer = self
            .shared
            .fragmented_sends
            .lock()
            .expect("fragmented sends lock poisoned")
            .allocate_transfer(total_fragments as u32);

        debug!(
            "splitting a message of {} bytes into {} fragments of at most {} bytes",
            payload.len(),
            total_fragments,
            max_fragment_size
        );

        for (index, chunk) in payload.chunks(max_fragment_size).enumerate() {
            let mut msg = self.shared.pool.allocate();
            msg.id = id;
            msg.reliable = true;
            msg.in_order = in_order;
            msg.priority = priority;
            msg.content_id = content_id;
            msg.message_number = self.shared.next_message_number();
            msg.reliable_message_number = reliable_message_number;
            msg.fragment = Some(FragmentInfo {
                transfer,
                index: index as u32,
                total_fragments: total_fragments as u32,
            });
            msg.payload.extend_from_slice(chunk);

            if let Err(e) = self.enqueue_for_accept(msg) {
                // the transfer can still complete from the fragments that made it in; the
                // ones that did not must not keep the transfer id pinned
                let mut sends = self
                    .shared
                    .fragmented_sends
                    .lock()
                    .expect("fragmented sends lock poisoned");
                for _ in index..total_fragments {
                    sends.fragment_done(transfer);
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Pops inbound messages and dispatches them to the registered handler, at most
    ///  `max_messages` per call (zero means everything currently queued). Returns the number
    ///  dispatched.
    pub async fn process_messages(&self, max_messages: usize) -> usize {
        let Some(handler) = self.shared.handler() else {
            warn!("cannot process messages: no message handler registered");
            return 0;
        };

        let mut inbound = self.inbound_rx.lock().await;
        let mut dispatched = 0;
        while max_messages == 0 || dispatched < max_messages {
            match inbound.try_recv() {
                Ok(msg) => {
                    handler.on_message(msg.id, &msg.payload);
                    self.shared.pool.free(msg);
                    dispatched += 1;
                }
                Err(_) => break,
            }
        }
        dispatched
    }

    /// Pops one inbound message, waiting up to `max_wait` for one to arrive (`None` means do
    ///  not wait). Returns `None` when nothing arrived in time or the connection closed.
    pub async fn receive_message(&self, max_wait: Option<Duration>) -> Option<ReceivedMessage> {
        if let Some(max_wait) = max_wait {
            self.wait_for_message(max_wait).await;
        }

        let mut inbound = self.inbound_rx.lock().await;
        let mut msg = inbound.try_recv().ok()?;
        let payload = std::mem::take(&mut msg.payload);
        let id = msg.id;
        self.shared.pool.free(msg);
        Some(ReceivedMessage { id, payload })
    }

    /// Polls in one-millisecond sleeps until an inbound message is queued, the connection
    ///  leaves the `Ok`/`Pending` states, or `max_wait` elapses.
    pub async fn wait_for_message(&self, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            {
                let inbound = self.inbound_rx.lock().await;
                if !inbound.is_empty() {
                    return;
                }
            }
            match self.state() {
                ConnectionState::Pending | ConnectionState::Ok => {}
                _ => return,
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Polls until the pending connection is established. Returns true iff the connection
    ///  reached `Ok` within the window.
    pub async fn wait_to_establish(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            match self.state() {
                ConnectionState::Ok => return true,
                ConnectionState::Pending => {}
                _ => return false,
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Stops the worker from sending for this connection. Submissions are still accepted and
    ///  queued - and coalesced by content id - until
    ///  [`resume_outbound_sends`](Self::resume_outbound_sends) is called.
    pub fn pause_outbound_sends(&self) {
        self.shared.outbound_sends_paused.store(true, Ordering::Release);
    }

    pub fn resume_outbound_sends(&self) {
        self.shared.outbound_sends_paused.store(false, Ordering::Release);
        self.shared.worker_notify.notify_one();
    }

    /// Starts the graceful disconnect handshake and polls up to `max_wait` for the state
    ///  machine to reach `Closed`. Safe to call repeatedly; at most one `Disconnect` message
    ///  is ever sent.
    pub async fn disconnect(&self, max_wait: Duration) {
        match self.state() {
            ConnectionState::Pending | ConnectionState::Ok => {
                self.send_disconnect_message();
                self.shared.state.set(ConnectionState::Disconnecting);
            }
            ConnectionState::Disconnecting => {
                debug!("disconnect called while already disconnecting");
            }
            ConnectionState::PeerClosed => {
                // the peer is gone; nothing to hand-shake with
                self.shared.state.set(ConnectionState::Closed);
            }
            ConnectionState::Closed => return,
        }
        self.shared.worker_notify.notify_one();

        let deadline = tokio::time::Instant::now() + max_wait;
        while self.state() != ConnectionState::Closed && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        if self.state() != ConnectionState::Closed {
            debug!("disconnect handshake did not finish in time - forcing close");
            self.close();
        }
    }

    fn send_disconnect_message(&self) {
        if self.shared.disconnect_sent.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut msg = self.shared.pool.allocate();
        msg.id = msg_id::DISCONNECT;
        msg.reliable = true;
        msg.priority = MAX_PRIORITY;
        msg.message_number = self.shared.next_message_number();
        msg.reliable_message_number = self.shared.next_reliable_message_number();

        if self.enqueue_for_accept(msg).is_err() {
            warn!("could not enqueue the disconnect message - closing without handshake");
            self.shared.state.set(ConnectionState::Closed);
        }
    }

    /// Non-blocking close: forces the state machine to `Closed`; the worker tears the
    ///  connection down on its next pass.
    pub fn close(&self) {
        if self.state() != ConnectionState::Closed {
            info!("closing connection");
            self.shared.state.set(ConnectionState::Closed);
        }
        self.shared.worker_notify.notify_one();
    }

    /// Smoothed ping round-trip time in milliseconds; zero before the first ping reply.
    pub fn rtt_ms(&self) -> f64 {
        *self.shared.rtt_ms.lock().expect("rtt lock poisoned")
    }

    /// Traffic rates over the statistics window, refreshed about once per second.
    pub fn rates(&self) -> ConnectionRates {
        *self.shared.rates.lock().expect("rates lock poisoned")
    }

    /// Milliseconds since the last inbound byte, as of the last stats refresh.
    pub fn last_heard_age_ms(&self) -> u32 {
        self.shared.last_heard_age_ms.load(Ordering::Relaxed)
    }

    /// Number of fragmented transfers currently in flight on the send side. The transfer id
    ///  space is 8 bits, so this never exceeds 256 plus the transfers still waiting for an id.
    pub fn open_fragmented_transfers(&self) -> usize {
        self.shared
            .fragmented_sends
            .lock()
            .expect("fragmented sends lock poisoned")
            .open_transfers()
    }
}
