use anyhow::bail;
use std::time::Duration;

/// Reserved per-datagram overhead when deciding whether a message must be fragmented: an
///  approximate upper bound for the datagram header plus one message header.
pub const SEND_HEADER_UPPER_BOUND: usize = 32;

/// Per-connection configuration: queue bounds, the protocol timer table and the pacing
///  parameters. The defaults reproduce the protocol's nominal behaviour; deployments mostly
///  only ever touch `max_send_size`.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The largest datagram payload this connection will hand to the socket. The protocol does
    ///  not probe the path MTU - choosing this too big silently loses datagrams on routes with
    ///  smaller frames, choosing it too small wastes bandwidth. The default assumes full
    ///  Ethernet frames with IPv4 and no optional headers (`1500 - 20 - 8`).
    pub max_send_size: usize,

    /// Capacity of the outbound accept queue (application to worker). A full queue rejects
    ///  reliable submissions loudly and drops unreliable ones silently.
    pub outbound_accept_capacity: usize,

    /// Capacity of the inbound message queue (worker to application). When fewer than
    ///  [`crate::config::MIN_INBOUND_SLACK`] slots are left, whole incoming datagrams are
    ///  dropped rather than partially applied.
    pub inbound_queue_capacity: usize,

    /// How many recently received packet ids are remembered for duplicate suppression.
    pub received_packet_id_capacity: usize,

    /// Width of the sliding window of reliable message numbers remembered for duplicate
    ///  suppression, measured backwards from the highest number seen.
    pub reliable_number_window: u32,

    /// Messages drained from the accept queue into the send priority queue per worker tick.
    pub max_accepts_per_tick: usize,

    /// Datagrams read from the socket per worker tick before the read loop is throttled to
    ///  leave room for sending.
    pub max_datagrams_per_read: usize,

    /// Datagrams packed and sent per worker tick (additionally gated by the pacing controller).
    pub max_sends_per_tick: usize,

    pub ping_interval: Duration,
    pub stats_refresh_interval: Duration,

    /// Silence on the inbound path longer than this closes the connection.
    pub liveness_timeout: Duration,

    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,

    /// Interval of the engine's internal update timer (timeout processing, flow control
    ///  frames, ack emission).
    pub update_tick: Duration,

    /// The longest a received reliable datagram waits for its ack to be emitted.
    pub max_ack_delay: Duration,

    /// Pending-ack count that triggers immediate ack emission (one base id plus a 32-bit
    ///  bitfield fills exactly this many).
    pub max_pending_acks: usize,

    pub min_rto: Duration,
    pub max_rto: Duration,
    pub initial_rto: Duration,

    /// Datagrams per second right after connect, before the AIMD loop has adapted.
    pub initial_datagram_rate: f64,

    /// The AIMD loop's additive increase saturates at this rate (datagrams per second).
    pub target_datagram_rate: f64,
}

/// Minimum free inbound-queue slots required to start parsing a datagram.
pub const MIN_INBOUND_SLACK: usize = 64;

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            max_send_size: 1472,
            outbound_accept_capacity: 256 * 1024,
            inbound_queue_capacity: 512 * 1024,
            received_packet_id_capacity: 64 * 1024,
            reliable_number_window: 64 * 1024,
            max_accepts_per_tick: 500,
            max_datagrams_per_read: 2048,
            max_sends_per_tick: 50,
            ping_interval: Duration::from_millis(3500),
            stats_refresh_interval: Duration::from_millis(1000),
            liveness_timeout: Duration::from_millis(15_000),
            connect_timeout: Duration::from_millis(15_000),
            disconnect_timeout: Duration::from_millis(5_000),
            update_tick: Duration::from_millis(10),
            max_ack_delay: Duration::from_millis(33),
            max_pending_acks: 33,
            min_rto: Duration::from_millis(1000),
            max_rto: Duration::from_millis(5000),
            initial_rto: Duration::from_millis(3000),
            initial_datagram_rate: 70.0,
            target_datagram_rate: 50.0,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_send_size < 4 * SEND_HEADER_UPPER_BOUND {
            bail!(
                "max_send_size of {} leaves no room for fragment payloads",
                self.max_send_size
            );
        }
        if self.max_send_size > 2048 {
            // the per-message header encodes content lengths in 11 bits
            bail!(
                "max_send_size of {} exceeds what the message framing can express",
                self.max_send_size
            );
        }
        if self.inbound_queue_capacity <= MIN_INBOUND_SLACK {
            bail!("inbound_queue_capacity must exceed the parser's required slack");
        }
        if self.initial_datagram_rate < 1.0 || self.target_datagram_rate < 1.0 {
            bail!("datagram rates below one per second are not supported");
        }
        if self.min_rto > self.max_rto {
            bail!("min_rto must not exceed max_rto");
        }
        if self.max_pending_acks > 33 {
            bail!("an ack message can carry at most 33 packet ids");
        }
        Ok(())
    }

    /// Fragment payload bound: messages whose wire size would exceed the socket's send size
    ///  are split into fragments no bigger than a quarter datagram, less header room.
    pub fn max_fragment_size(&self) -> usize {
        self.max_send_size / 4 - SEND_HEADER_UPPER_BOUND
    }
}
