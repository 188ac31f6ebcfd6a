//! Bookkeeping around reliable datagrams: what we sent and still wait on an ack for, which
//!  packet ids we have already seen, which acks we owe the peer, and which reliable message
//!  numbers have already been delivered.

use crate::clock::{self, Tick};
use crate::message::{message_number_is_newer, NetworkMessage};
use crate::packet_id::PacketId;
use crate::wire::PacketAckPayload;
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, VecDeque};

/// One reliable datagram in flight: the messages it carried (owned - they go back into the
///  send queue if the datagram times out), when it was sent, when it expires, and the datagram
///  send rate at send time (the smallest such rate observed at a loss seeds the multiplicative
///  decrease).
pub struct PacketAckTrack {
    pub packet_id: PacketId,
    pub messages: Vec<NetworkMessage>,
    pub sent_tick: Tick,
    pub timeout_tick: Tick,
    pub send_count: u32,
    pub datagram_send_rate: f64,
}

/// Tracks of reliable datagrams in send order. Because the retransmission timeout is a
///  property of the connection, not of the datagram, entries expire in the order they were
///  sent - expiry only ever needs to look at the front.
pub struct OutboundAckTracker {
    tracks: VecDeque<PacketAckTrack>,
}

impl OutboundAckTracker {
    pub fn new() -> OutboundAckTracker {
        OutboundAckTracker {
            tracks: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, track: PacketAckTrack) {
        debug_assert!(self
            .tracks
            .back()
            .map(|b| track.packet_id.is_newer_than(b.packet_id))
            .unwrap_or(true));
        self.tracks.push_back(track);
    }

    /// Pops the front track iff it has expired at `now`.
    pub fn pop_expired(&mut self, now: Tick) -> Option<PacketAckTrack> {
        let front = self.tracks.front()?;
        if clock::is_newer(front.timeout_tick, now) {
            return None;
        }
        self.tracks.pop_front()
    }

    /// Removes the track for `packet_id` if one is in flight. Ids are normalized to their
    ///  distance from the queue head before the binary search, so id wrap-around cannot
    ///  produce a mis-ordered search domain.
    pub fn remove(&mut self, packet_id: PacketId) -> Option<PacketAckTrack> {
        let front_id = self.tracks.front()?.packet_id;
        let target = packet_id.distance_from(front_id);

        let index = self
            .tracks
            .binary_search_by_key(&target, |track| track.packet_id.distance_from(front_id))
            .ok()?;
        self.tracks.remove(index)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PacketAckTrack> + '_ {
        self.tracks.drain(..)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl Default for OutboundAckTracker {
    fn default() -> Self {
        OutboundAckTracker::new()
    }
}

/// Bounded sliding window of recently received packet ids, for duplicate suppression. When
///  the window is full the oldest id is forgotten - a datagram delayed for longer than the
///  window covers is accepted again, which duplicate suppression on the message level catches.
pub struct ReceivedPacketIdSet {
    capacity: usize,
    order: VecDeque<PacketId>,
    ids: FxHashSet<u32>,
}

impl ReceivedPacketIdSet {
    pub fn new(capacity: usize) -> ReceivedPacketIdSet {
        ReceivedPacketIdSet {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: FxHashSet::default(),
        }
    }

    pub fn contains(&self, packet_id: PacketId) -> bool {
        self.ids.contains(&packet_id.to_raw())
    }

    pub fn add(&mut self, packet_id: PacketId) {
        if !self.ids.insert(packet_id.to_raw()) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest.to_raw());
            }
        }
        self.order.push_back(packet_id);
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

/// Packet ids of received reliable datagrams that still owe the peer an ack, with the tick
///  they arrived at. Flushed as base-plus-bitfield ack messages.
pub struct InboundAckQueue {
    pending: BTreeMap<u32, Tick>,
}

impl InboundAckQueue {
    pub fn new() -> InboundAckQueue {
        InboundAckQueue {
            pending: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, packet_id: PacketId, now: Tick) {
        self.pending.entry(packet_id.to_raw()).or_insert(now);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True once an ack message should go out: the oldest pending entry has waited longer
    ///  than the maximum ack delay, or enough entries accumulated to fill a whole ack.
    pub fn should_emit(&self, now: Tick, max_delay_ticks: u64, max_pending: usize) -> bool {
        if self.pending.len() >= max_pending {
            return true;
        }
        self.pending
            .values()
            .any(|&received| clock::ticks_in_between(now, received) >= max_delay_ticks)
    }

    /// Greedily packs all pending ids into ack payloads: each takes the smallest remaining id
    ///  as its base and absorbs every pending id within the following 32.
    pub fn drain_into_payloads(&mut self) -> Vec<PacketAckPayload> {
        let mut payloads = Vec::new();

        while let Some((&base_raw, _)) = self.pending.first_key_value() {
            self.pending.remove(&base_raw);
            let base = PacketId::from_raw(base_raw);

            let mut bitfield = 0u32;
            for i in 0..32u32 {
                let id = base.plus(i + 1);
                if self.pending.remove(&id.to_raw()).is_some() {
                    bitfield |= 1 << i;
                }
            }

            payloads.push(PacketAckPayload { base, bitfield });
        }

        payloads
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for InboundAckQueue {
    fn default() -> Self {
        InboundAckQueue::new()
    }
}

/// Reliable message numbers already delivered, for dropping duplicates carried by
///  retransmitted datagrams. Bounded by a sliding window below the highest number seen:
///  numbers that fall out of the window count as duplicates, which is safe because a live
///  sender's in-flight window is far narrower than this one.
pub struct ReceivedReliableSet {
    window: u32,
    highest: Option<u32>,
    seen: FxHashSet<u32>,
}

impl ReceivedReliableSet {
    pub fn new(window: u32) -> ReceivedReliableSet {
        ReceivedReliableSet {
            window,
            highest: None,
            seen: FxHashSet::default(),
        }
    }

    /// Records a reliable message number. Returns false iff the number counts as a duplicate
    ///  (seen before, or so far below the window that it cannot be a live message).
    pub fn insert(&mut self, number: u32) -> bool {
        match self.highest {
            None => {
                self.highest = Some(number);
                self.seen.insert(number);
                true
            }
            Some(highest) => {
                if message_number_is_newer(number, highest) {
                    self.highest = Some(number);
                } else if number != highest && highest.wrapping_sub(number) > self.window {
                    return false;
                }

                let fresh = self.seen.insert(number);

                if self.seen.len() > 2 * self.window as usize {
                    let highest = self.highest.expect("set to Some above");
                    let window = self.window;
                    self.seen
                        .retain(|&n| highest.wrapping_sub(n) <= window);
                }

                fresh
            }
        }
    }

    pub fn clear(&mut self) {
        self.highest = None;
        self.seen.clear();
    }
}
