//! Fragmented-transfer bookkeeping for both directions.
//!
//! A message too big for one datagram is split into fragments that travel as individual
//!  reliable messages. All fragments of one message belong to a *transfer*, identified on the
//!  wire by a scarce 8-bit id. The id is only assigned when the first fragment is about to be
//!  serialized, so a backlog of queued oversize messages cannot exhaust the id space - a
//!  transfer that cannot get an id yet is simply re-queued.

use crate::message::message_number_is_newer;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Upper bound on fragments per transfer accepted from the wire. Bounds reassembly memory
///  against senders declaring absurd fragment counts.
pub const MAX_FRAGMENTS_PER_TRANSFER: u32 = 1 << 16;

const NUM_WIRE_IDS: usize = 256;

struct SendTransfer {
    wire_id: Option<u8>,
    outstanding: u32,
}

/// Sender side: tracks which fragments of each transfer are still unacked and owns the 8-bit
///  wire id space (at most 256 transfers in flight; running out throttles, it never fails).
pub struct FragmentedSendManager {
    transfers: FxHashMap<u64, SendTransfer>,
    next_handle: u64,
    id_in_use: [bool; NUM_WIRE_IDS],
    next_wire_id: u8,
}

impl FragmentedSendManager {
    pub fn new() -> FragmentedSendManager {
        FragmentedSendManager {
            transfers: FxHashMap::default(),
            next_handle: 0,
            id_in_use: [false; NUM_WIRE_IDS],
            next_wire_id: 0,
        }
    }

    /// Registers a new transfer with the given fragment count and returns its handle. No wire
    ///  id is assigned yet.
    pub fn allocate_transfer(&mut self, total_fragments: u32) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.transfers.insert(
            handle,
            SendTransfer {
                wire_id: None,
                outstanding: total_fragments,
            },
        );
        handle
    }

    /// The transfer's wire id, assigning one from the free list if it has none yet. `None`
    ///  means all 256 ids are in flight and the caller should re-queue the fragment.
    pub fn ensure_wire_id(&mut self, handle: u64) -> Option<u8> {
        let transfer = self.transfers.get_mut(&handle)?;
        if let Some(id) = transfer.wire_id {
            return Some(id);
        }

        // round-robin scan so recently released ids are not reused immediately
        for offset in 0..NUM_WIRE_IDS {
            let candidate = self.next_wire_id.wrapping_add(offset as u8);
            if !self.id_in_use[usize::from(candidate)] {
                self.id_in_use[usize::from(candidate)] = true;
                self.next_wire_id = candidate.wrapping_add(1);
                transfer.wire_id = Some(candidate);
                return Some(candidate);
            }
        }

        debug!("all fragmented-transfer ids in flight - throttling");
        None
    }

    /// Marks one fragment of the transfer as no longer outstanding (acked, superseded or
    ///  discarded). Releases the transfer and its wire id once nothing is outstanding.
    pub fn fragment_done(&mut self, handle: u64) {
        let Some(transfer) = self.transfers.get_mut(&handle) else {
            return;
        };

        transfer.outstanding = transfer.outstanding.saturating_sub(1);
        if transfer.outstanding == 0 {
            let transfer = self.transfers.remove(&handle).expect("just looked it up");
            if let Some(id) = transfer.wire_id {
                self.id_in_use[usize::from(id)] = false;
            }
        }
    }

    pub fn open_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
        self.id_in_use = [false; NUM_WIRE_IDS];
    }
}

impl Default for FragmentedSendManager {
    fn default() -> Self {
        FragmentedSendManager::new()
    }
}

struct ReassemblyBuffer {
    /// The reliable message number all fragments of the transfer share. Since transfer ids
    ///  are reused, this is what distinguishes a new transfer under an old id from late
    ///  fragments of the previous one.
    reliable_number: u32,
    /// Known once the first fragment arrived - fragments can arrive before it.
    total_fragments: Option<u32>,
    fragments: BTreeMap<u32, Vec<u8>>,
}

impl ReassemblyBuffer {
    fn is_complete(&self) -> bool {
        self.total_fragments
            .map(|total| self.fragments.len() as u32 == total)
            .unwrap_or(false)
    }
}

/// Receiver side: buffers incoming fragments keyed by transfer id until all of them arrived,
///  then hands out the reassembled payload. Fragments of one transfer can arrive in any
///  order and arbitrarily duplicated; the first fragment may well arrive last.
pub struct FragmentedReceiveManager {
    active: FxHashMap<u8, ReassemblyBuffer>,
    /// Per transfer id, the reliable number of the transfer most recently assembled under it;
    ///  late retransmitted fragments of that transfer are dropped against this.
    completed: FxHashMap<u8, u32>,
}

impl FragmentedReceiveManager {
    pub fn new() -> FragmentedReceiveManager {
        FragmentedReceiveManager {
            active: FxHashMap::default(),
            completed: FxHashMap::default(),
        }
    }

    /// Resolves the buffer a fragment with this (transfer id, reliable number) belongs to.
    ///  `None` means the fragment is a leftover of an already assembled or abandoned transfer.
    fn buffer_for(&mut self, transfer_id: u8, reliable_number: u32) -> Option<&mut ReassemblyBuffer> {
        if let Some(&completed_number) = self.completed.get(&transfer_id) {
            // anything not strictly newer than the last assembled transfer under this id is a
            // late duplicate of it or of an even earlier one
            if !message_number_is_newer(reliable_number, completed_number) {
                return None;
            }
        }

        let replaces_unfinished = match self.active.get(&transfer_id) {
            None => false,
            Some(buffer) if buffer.reliable_number == reliable_number => false,
            Some(buffer) if message_number_is_newer(reliable_number, buffer.reliable_number) => {
                true
            }
            Some(_) => {
                debug!(
                    "late fragment of an abandoned transfer under id {} - dropping",
                    transfer_id
                );
                return None;
            }
        };
        if replaces_unfinished {
            warn!(
                "fragmented transfer {} restarted under its id - dropping the unfinished one",
                transfer_id
            );
            self.active.remove(&transfer_id);
        }

        Some(self.active.entry(transfer_id).or_insert_with(|| ReassemblyBuffer {
            reliable_number,
            total_fragments: None,
            fragments: BTreeMap::new(),
        }))
    }

    /// Handles the first fragment of a transfer, which also announces the fragment count.
    ///  Returns true when the transfer is now complete (fragments may have arrived earlier).
    pub fn start(
        &mut self,
        transfer_id: u8,
        reliable_number: u32,
        total_fragments: u32,
        payload: &[u8],
    ) -> bool {
        let Some(buffer) = self.buffer_for(transfer_id, reliable_number) else {
            return false;
        };

        buffer.total_fragments = Some(total_fragments);
        buffer.fragments.entry(0).or_insert_with(|| payload.to_vec());
        // fragments beyond the announced count cannot belong to this transfer
        buffer.fragments.retain(|&index, _| index < total_fragments);

        buffer.is_complete()
    }

    /// Handles a non-first fragment. Returns true when this completed the transfer.
    pub fn fragment_received(
        &mut self,
        transfer_id: u8,
        reliable_number: u32,
        index: u32,
        payload: &[u8],
    ) -> bool {
        if index >= MAX_FRAGMENTS_PER_TRANSFER {
            warn!("fragment index {} beyond the supported bound - dropping", index);
            return false;
        }

        let Some(buffer) = self.buffer_for(transfer_id, reliable_number) else {
            return false;
        };

        if let Some(total) = buffer.total_fragments {
            if index >= total {
                warn!(
                    "fragment index {} out of range for transfer {} with {} fragments",
                    index, transfer_id, total
                );
                return false;
            }
        }

        buffer.fragments.entry(index).or_insert_with(|| payload.to_vec());
        buffer.is_complete()
    }

    /// Concatenates the completed transfer's fragments, releases the buffer and remembers the
    ///  transfer so late duplicates of it are dropped.
    pub fn assemble(&mut self, transfer_id: u8) -> Option<Vec<u8>> {
        if !self
            .active
            .get(&transfer_id)
            .map(ReassemblyBuffer::is_complete)
            .unwrap_or(false)
        {
            return None;
        }
        let buffer = self.active.remove(&transfer_id).expect("checked above");
        self.completed.insert(transfer_id, buffer.reliable_number);

        let total_len: usize = buffer.fragments.values().map(Vec::len).sum();
        let mut assembled = Vec::with_capacity(total_len);
        for (_, fragment) in buffer.fragments {
            assembled.extend_from_slice(&fragment);
        }
        Some(assembled)
    }

    pub fn open_transfers(&self) -> usize {
        self.active.len()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.completed.clear();
    }
}

impl Default for FragmentedReceiveManager {
    fn default() -> Self {
        FragmentedReceiveManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_id_assigned_lazily() {
        let mut sends = FragmentedSendManager::new();
        let handle = sends.allocate_transfer(3);

        let id = sends.ensure_wire_id(handle).unwrap();
        // repeated calls return the same id
        assert_eq!(sends.ensure_wire_id(handle), Some(id));
    }

    #[test]
    fn test_wire_ids_exhaust_at_256_and_recover() {
        let mut sends = FragmentedSendManager::new();

        let handles: Vec<u64> = (0..256).map(|_| sends.allocate_transfer(2)).collect();
        for &handle in &handles {
            assert!(sends.ensure_wire_id(handle).is_some());
        }

        let throttled = sends.allocate_transfer(2);
        assert_eq!(sends.ensure_wire_id(throttled), None);

        // release one transfer completely, its id becomes available again
        sends.fragment_done(handles[17]);
        sends.fragment_done(handles[17]);
        assert!(sends.ensure_wire_id(throttled).is_some());
    }

    #[test]
    fn test_transfer_released_when_all_fragments_done() {
        let mut sends = FragmentedSendManager::new();
        let handle = sends.allocate_transfer(2);
        sends.ensure_wire_id(handle).unwrap();

        sends.fragment_done(handle);
        assert_eq!(sends.open_transfers(), 1);
        sends.fragment_done(handle);
        assert_eq!(sends.open_transfers(), 0);
    }

    #[test]
    fn test_distinct_transfers_get_distinct_ids() {
        let mut sends = FragmentedSendManager::new();
        let a = sends.allocate_transfer(2);
        let b = sends.allocate_transfer(2);
        assert_ne!(sends.ensure_wire_id(a), sends.ensure_wire_id(b));
    }

    #[test]
    fn test_reassembly_in_order() {
        let mut receives = FragmentedReceiveManager::new();
        assert!(!receives.start(9, 40, 3, b"aa"));
        assert!(!receives.fragment_received(9, 40, 1, b"bb"));
        assert!(receives.fragment_received(9, 40, 2, b"cc"));

        assert_eq!(receives.assemble(9).unwrap(), b"aabbcc");
        assert_eq!(receives.open_transfers(), 0);
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let mut receives = FragmentedReceiveManager::new();
        assert!(!receives.start(4, 40, 3, b"one"));
        assert!(!receives.fragment_received(4, 40, 2, b"three"));
        assert!(receives.fragment_received(4, 40, 1, b"two"));

        assert_eq!(receives.assemble(4).unwrap(), b"onetwothree");
    }

    #[test]
    fn test_first_fragment_arriving_last_still_completes() {
        let mut receives = FragmentedReceiveManager::new();
        assert!(!receives.fragment_received(4, 40, 1, b"two"));
        assert!(!receives.fragment_received(4, 40, 2, b"three"));
        // the datagram carrying the first fragment was retransmitted and arrives last
        assert!(receives.start(4, 40, 3, b"one"));

        assert_eq!(receives.assemble(4).unwrap(), b"onetwothree");
    }

    #[test]
    fn test_duplicate_fragments_are_idempotent() {
        let mut receives = FragmentedReceiveManager::new();
        assert!(!receives.start(2, 40, 2, b"x"));
        assert!(!receives.start(2, 40, 2, b"x"));
        assert!(receives.fragment_received(2, 40, 1, b"y"));
        assert_eq!(receives.assemble(2).unwrap(), b"xy");

        // a retransmitted fragment after assembly is recognized as stale
        assert!(!receives.fragment_received(2, 40, 1, b"y"));
        assert!(!receives.start(2, 40, 2, b"x"));
        assert_eq!(receives.open_transfers(), 0);
    }

    #[test]
    fn test_assemble_requires_completion() {
        let mut receives = FragmentedReceiveManager::new();
        assert!(!receives.start(2, 40, 3, b"x"));
        assert!(receives.assemble(2).is_none());
        assert_eq!(receives.open_transfers(), 1);
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let mut receives = FragmentedReceiveManager::new();
        assert!(!receives.start(1, 40, 2, b"x"));
        assert!(!receives.fragment_received(1, 40, 5, b"y"));
        assert!(receives.fragment_received(1, 40, 1, b"y"));
    }

    #[test]
    fn test_id_reuse_with_newer_number_replaces_abandoned_transfer() {
        let mut receives = FragmentedReceiveManager::new();
        assert!(!receives.start(3, 40, 3, b"stale"));

        // the sender gave up on transfer 40 and reused the id for number 41
        assert!(!receives.start(3, 41, 2, b"fresh"));
        assert!(receives.fragment_received(3, 41, 1, b"!"));
        assert_eq!(receives.assemble(3).unwrap(), b"fresh!");

        // stragglers of the abandoned transfer find no buffer
        assert!(!receives.fragment_received(3, 40, 1, b"stale"));
        assert_eq!(receives.open_transfers(), 0);
    }
}
