use std::fmt::{Display, Formatter};

/// 22-bit wrap-around sequence number assigned by the sender to each outbound datagram.
///
/// Packet ids are not totally ordered - after roughly four million datagrams the counter wraps
///  back to zero, so "newer" is defined by the half-range rule: `a` is newer than `b` iff
///  walking forward from `b` reaches `a` in less than half the id space. This gives e.g.
///  `PacketId(0)` newer than `PacketId(MAX)`, which is exactly what duplicate detection and
///  content-id stamping need. Because of this there is deliberately no `Ord` impl.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketId(u32);

impl PacketId {
    pub const BITS: u32 = 22;
    const MASK: u32 = (1 << Self::BITS) - 1;
    const HALF_RANGE: u32 = 1 << (Self::BITS - 1);

    pub const ZERO: PacketId = PacketId(0);

    pub fn from_raw(value: u32) -> PacketId {
        PacketId(value & Self::MASK)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> PacketId {
        self.plus(1)
    }

    pub fn plus(self, offset: u32) -> PacketId {
        PacketId(self.0.wrapping_add(offset) & Self::MASK)
    }

    /// Wrap-aware distance walking forward from `other` to `self`.
    pub fn distance_from(self, other: PacketId) -> u32 {
        self.0.wrapping_sub(other.0) & Self::MASK
    }

    pub fn is_newer_than(self, other: PacketId) -> bool {
        self != other && self.distance_from(other) < Self::HALF_RANGE
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
