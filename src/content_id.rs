//! Content-keyed obsolescence. A non-zero content id marks a message as the current state of
//!  some logical item; of two queued messages with the same (message id, content id) only the
//!  newer one is worth bandwidth, and on the receive side a message older than the last
//!  accepted state under its key is discarded.

use crate::clock::{self, Tick, TICKS_PER_SEC};
use crate::message::{message_number_is_newer, MessageId, NetworkMessage};
use crate::packet_id::PacketId;
use rustc_hash::FxHashMap;

/// An inbound stamp older than this loses its veto - a peer restarting its packet id sequence
///  (or an id-space wrap during a long pause) must not block a key forever.
const STAMP_STALE_AFTER_TICKS: u64 = 5 * TICKS_PER_SEC;

type Key = (MessageId, u32);

/// Sender side: the newest queued message number per content key. Fragments are exempt - the
///  fragments of one transfer all share their parent's key and must never supersede each
///  other.
pub struct OutboundContentMap {
    newest: FxHashMap<Key, u32>,
}

impl OutboundContentMap {
    pub fn new() -> OutboundContentMap {
        OutboundContentMap {
            newest: FxHashMap::default(),
        }
    }

    /// Called when a message is accepted into the send queue. Returns false iff the message is
    ///  already superseded by a queued newer one (the caller marks it obsolete).
    pub fn check_and_save(&mut self, msg: &NetworkMessage) -> bool {
        if msg.content_id == 0 || msg.fragment.is_some() {
            return true;
        }

        let slot = self.newest.entry((msg.id, msg.content_id)).or_insert(msg.message_number);
        if *slot == msg.message_number || message_number_is_newer(msg.message_number, *slot) {
            *slot = msg.message_number;
            true
        } else {
            false
        }
    }

    /// Is this message still the newest under its key? Checked right before serialization;
    ///  a superseded message is freed instead of sent.
    pub fn is_current(&self, msg: &NetworkMessage) -> bool {
        if msg.content_id == 0 || msg.fragment.is_some() {
            return true;
        }
        self.newest.get(&(msg.id, msg.content_id)) == Some(&msg.message_number)
    }

    /// Called whenever a tracked message is released (sent, acked or discarded) so the key
    ///  does not pin a stale number.
    pub fn clear_on_release(&mut self, msg: &NetworkMessage) {
        if msg.content_id == 0 || msg.fragment.is_some() {
            return;
        }
        if self.newest.get(&(msg.id, msg.content_id)) == Some(&msg.message_number) {
            self.newest.remove(&(msg.id, msg.content_id));
        }
    }

    pub fn clear(&mut self) {
        self.newest.clear();
    }
}

impl Default for OutboundContentMap {
    fn default() -> Self {
        OutboundContentMap::new()
    }
}

/// Receiver side: per content key, the packet id and arrival tick of the last accepted
///  message. A message is accepted iff its packet id is newer (wrap-aware) than the stored
///  one or the stored stamp has gone stale.
pub struct InboundContentStamps {
    stamps: FxHashMap<Key, (PacketId, Tick)>,
}

impl InboundContentStamps {
    pub fn new() -> InboundContentStamps {
        InboundContentStamps {
            stamps: FxHashMap::default(),
        }
    }

    pub fn check_and_save(
        &mut self,
        message_id: MessageId,
        content_id: u32,
        packet_id: PacketId,
        now: Tick,
    ) -> bool {
        debug_assert_ne!(content_id, 0);

        match self.stamps.get_mut(&(message_id, content_id)) {
            None => {
                self.stamps.insert((message_id, content_id), (packet_id, now));
                true
            }
            Some(stamp) => {
                if packet_id.is_newer_than(stamp.0)
                    || clock::ticks_in_between(now, stamp.1) > STAMP_STALE_AFTER_TICKS
                {
                    *stamp = (packet_id, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
    }
}

impl Default for InboundContentStamps {
    fn default() -> Self {
        InboundContentStamps::new()
    }
}
