//! Message-oriented transport over UDP. Applications submit *messages* (defined-length chunks
//!  of data, each with an application-level message id) and choose per message whether it is
//!  delivered reliably and whether it should be applied in order. The transport takes care of
//!  packing messages into datagrams, acknowledging and retransmitting reliable datagrams,
//!  splitting oversize messages into fragments and reassembling them, pacing the outbound
//!  datagram rate, suppressing duplicates, and cancelling queued messages that were superseded
//!  by a newer update to the same logical item.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, not a stream of bytes
//! * Reliability is a per-message property: a position update can be fire-and-forget while the
//!   inventory change right next to it in the same datagram is retransmitted until acked
//! * Latest-state-wins semantics via *content ids*: when two queued messages share
//!   (message id, content id), only the newer one goes on the wire
//! * Big messages are sent without IP-level fragmentation - the transport chunks them into
//!   fragments of bounded size and reassembles on the receiver
//! * Outbound datagrams are paced by an AIMD rate controller rather than a congestion window -
//!   this is a datagram protocol, not a general-purpose reliable byte pipe
//! * A single worker task drives the I/O and timers of any number of connections
//!
//! Explicitly *not* goals: in-sequence delivery across datagrams (TCP style), path MTU
//!  discovery, cryptographic protection, NAT traversal.
//!
//! ## Datagram layout
//!
//! All multi-byte fields are little-endian.
//!
//! ```ascii
//! 0:  bits 0..5 = packet id low 6 bits; bit 6 = reliable; bit 7 = in-order
//! 1:  u16 = packet id bits 6..21 (packet ids are 22-bit wrap-around sequence numbers)
//! 3:  VLE16/32 smallest reliable message number of the batch - present iff 'reliable'
//! *:  messages, back to back
//! ```
//!
//! Each message inside a datagram:
//!
//! ```ascii
//! 0:  u16: bits 0..10 = content length (>= 1); bit 12 = reliable; bit 13 = in-order;
//!      bit 14 = fragment; bit 15 = first fragment (bit 11 reserved)
//! 2:  VLE8/16 delta of the reliable message number from the datagram's base - iff reliable
//! *:  VLE8/16/32 total number of fragments - iff first fragment
//! *:  u8 transfer id - iff fragment
//! *:  VLE8/16/32 fragment index - iff fragment and not first
//! *:  VLE8/16/32 message id - iff not a fragment, or first fragment
//! *:  payload bytes, exactly 'content length' of them
//! ```
//!
//! ## Acknowledgement
//!
//! The receiver buffers the packet id of every reliable datagram it sees and periodically
//!  flushes them as `PacketAck` messages carrying one base id (3 bytes) plus a 32-bit field
//!  where bit i acknowledges `base + i + 1`. An ack message is emitted as soon as the oldest
//!  pending entry is older than the maximum ack delay or enough entries accumulated to fill a
//!  whole ack. The sender drops the corresponding retransmission tracks and, for datagrams that
//!  were sent exactly once, feeds the observed round-trip time into the RFC 2988 RTO estimator.
//!
//! ## Liveness
//!
//! Connections ping each other periodically (1-byte ping id, echoed back in the reply); the
//!  measured round-trip time is smoothed into the connection's RTT estimate. A connection that
//!  has not received a single byte for the liveness timeout closes itself. Graceful shutdown is
//!  a two-message handshake: `Disconnect` (reliable), answered by `DisconnectAck`, after which
//!  both sides converge to the closed state.

mod ack_track;
mod clock;
mod connection;
pub mod config;
mod content_id;
mod driver;
mod error;
mod fragment;
mod message;
mod packet_id;
mod pacing;
pub mod socket;
mod stats;
mod vle;
pub mod worker;
mod wire;

pub use config::ConnectionConfig;
pub use connection::{ConnectionState, MessageHandler, ReceivedMessage, UdpMessageConnection};
pub use error::{NetError, WireError};
pub use message::{msg_id, MessageId, MAX_PRIORITY};
pub use stats::ConnectionRates;
pub use worker::NetworkWorker;
