use std::cmp::Ordering;
use std::sync::Mutex;
use tracing::trace;

/// Application-level message opcode, VLE-encoded on the wire (at most 30 bits).
pub type MessageId = u32;

pub const MAX_PRIORITY: u32 = u32::MAX;

/// Message ids consumed by the transport itself. Everything else is application traffic.
pub mod msg_id {
    use super::MessageId;

    pub const PING_REQUEST: MessageId = 1;
    pub const PING_REPLY: MessageId = 2;
    pub const FLOW_CONTROL_REQUEST: MessageId = 3;
    pub const PACKET_ACK: MessageId = 4;
    pub const DISCONNECT: MessageId = 0x3FFF_FFFF;
    pub const DISCONNECT_ACK: MessageId = 0x3FFF_FFFE;

    pub fn is_control(id: MessageId) -> bool {
        matches!(
            id,
            PING_REQUEST | PING_REPLY | FLOW_CONTROL_REQUEST | PACKET_ACK | DISCONNECT
                | DISCONNECT_ACK
        )
    }
}

/// Fragment linkage of a message that is part of an oversize transfer. The on-wire 8-bit
///  transfer id lives in the fragmented-send manager and is only assigned when the first
///  fragment is about to be serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Key into the sender's fragmented-transfer table.
    pub transfer: u64,
    pub index: u32,
    pub total_fragments: u32,
}

impl FragmentInfo {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }
}

/// The unit of application data moving through the connection.
///
/// Once a message has left the outbound accept queue, only the worker touches it.
#[derive(Debug)]
pub struct NetworkMessage {
    pub id: MessageId,
    pub reliable: bool,
    pub in_order: bool,
    pub priority: u32,
    /// `0` means no coalescing; otherwise newer messages with the same (id, content id)
    ///  supersede older queued ones.
    pub content_id: u32,
    /// Per-connection monotonic, assigned at enqueue time.
    pub message_number: u32,
    /// Per-connection monotonic over reliable messages only; fragments share their parent's.
    pub reliable_message_number: u32,
    pub send_count: u32,
    pub obsolete: bool,
    pub fragment: Option<FragmentInfo>,
    pub payload: Vec<u8>,
}

impl NetworkMessage {
    fn empty() -> NetworkMessage {
        NetworkMessage {
            id: 0,
            reliable: false,
            in_order: false,
            priority: 0,
            content_id: 0,
            message_number: 0,
            reliable_message_number: 0,
            send_count: 0,
            obsolete: false,
            fragment: None,
            payload: Vec::new(),
        }
    }

    /// Upper bound for this message's on-wire size inside a datagram: two header bytes, the
    ///  reliable delta (bounded by two bytes), fragment metadata, the message id and the
    ///  payload itself.
    pub fn wire_size(&self) -> usize {
        let header = 2;
        let reliable_delta = if self.reliable { 2 } else { 0 };
        let (id_len, fragment_len) = match &self.fragment {
            None => (crate::vle::len_vle8_16_32(self.id), 0),
            Some(f) if f.is_first() => (
                crate::vle::len_vle8_16_32(self.id),
                1 + crate::vle::len_vle8_16_32(f.total_fragments),
            ),
            Some(f) => (0, 1 + crate::vle::len_vle8_16_32(f.index)),
        };
        header + reliable_delta + id_len + fragment_len + self.payload.len()
    }
}

/// Wrap-aware "was assigned later": message numbers are monotonic per connection but wrap at
///  the u32 boundary.
pub fn message_number_is_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

/// Heap entry for the send priority queue: highest priority first, oldest message number
///  breaking ties so equal-priority messages leave in submission order.
#[derive(Debug)]
pub struct QueuedMessage(pub NetworkMessage);

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| {
                if self.0.message_number == other.0.message_number {
                    Ordering::Equal
                } else if message_number_is_newer(other.0.message_number, self.0.message_number) {
                    // self is older and therefore leaves the heap first
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            })
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedMessage {}

/// Recycles message shells so payload allocations are reused across the connection's
///  lifetime. Returned messages keep their payload capacity; the pool caps how many it holds.
pub struct MessagePool {
    free: Mutex<Vec<NetworkMessage>>,
    max_pooled: usize,
}

impl MessagePool {
    pub fn new(max_pooled: usize) -> MessagePool {
        MessagePool {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    pub fn allocate(&self) -> NetworkMessage {
        let recycled = self.free.lock().expect("message pool poisoned").pop();
        match recycled {
            Some(mut msg) => {
                let payload = std::mem::take(&mut msg.payload);
                let mut msg = NetworkMessage::empty();
                msg.payload = payload;
                msg
            }
            None => {
                trace!("message pool empty: allocating a new message");
                NetworkMessage::empty()
            }
        }
    }

    pub fn free(&self, mut msg: NetworkMessage) {
        msg.payload.clear();
        let mut free = self.free.lock().expect("message pool poisoned");
        if free.len() < self.max_pooled {
            free.push(msg);
        }
    }
}
