//! Datagram and message header codecs. Layouts are documented at the crate level; everything
//!  here is little-endian.

use crate::error::WireError;
use crate::packet_id::PacketId;
use crate::vle;
use bytes::{Buf, BufMut};

/// Three leading bytes of every datagram, plus the reliable message number base iff the
///  datagram carries any reliable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramHeader {
    pub packet_id: PacketId,
    pub reliable: bool,
    pub in_order: bool,
    /// Smallest reliable message number of the batch; per-message numbers are encoded as
    ///  deltas from this. Only meaningful when `reliable` is set.
    pub reliable_base: u32,
}

impl DatagramHeader {
    pub const MIN_LEN: usize = 3;

    pub fn ser(&self, buf: &mut impl BufMut) {
        let raw = self.packet_id.to_raw();
        buf.put_u8(
            (raw & 0x3F) as u8
                | (u8::from(self.reliable) << 6)
                | (u8::from(self.in_order) << 7),
        );
        buf.put_u16_le((raw >> 6) as u16);
        if self.reliable {
            vle::put_vle16_32(buf, self.reliable_base);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<DatagramHeader, WireError> {
        let flags = buf
            .try_get_u8()
            .map_err(|_| WireError::Truncated("datagram header"))?;
        let high = buf
            .try_get_u16_le()
            .map_err(|_| WireError::Truncated("datagram header"))?;

        let reliable = flags & (1 << 6) != 0;
        let in_order = flags & (1 << 7) != 0;
        let packet_id = PacketId::from_raw(u32::from(flags & 0x3F) | (u32::from(high) << 6));

        let reliable_base = if reliable { vle::get_vle16_32(buf)? } else { 0 };

        Ok(DatagramHeader {
            packet_id,
            reliable,
            in_order,
            reliable_base,
        })
    }
}

pub const MAX_MESSAGE_CONTENT_LEN: usize = (1 << 11) - 1;

/// Two-byte header in front of every message inside a datagram. `first_fragment` implies
///  `fragment`; bit 11 is reserved and written as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub content_length: u16,
    pub reliable: bool,
    pub in_order: bool,
    pub fragment: bool,
    pub first_fragment: bool,
}

impl MessageHeader {
    pub const LEN: usize = 2;

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(usize::from(self.content_length) <= MAX_MESSAGE_CONTENT_LEN);
        debug_assert!(self.fragment || !self.first_fragment);

        buf.put_u16_le(
            self.content_length
                | (u16::from(self.reliable) << 12)
                | (u16::from(self.in_order) << 13)
                | (u16::from(self.fragment) << 14)
                | (u16::from(self.first_fragment) << 15),
        );
    }

    pub fn deser(buf: &mut impl Buf) -> Result<MessageHeader, WireError> {
        let raw = buf
            .try_get_u16_le()
            .map_err(|_| WireError::Truncated("message header"))?;

        let first_fragment = raw & (1 << 15) != 0;
        let content_length = raw & ((1 << 11) - 1);
        if content_length == 0 {
            return Err(WireError::ZeroContentLength);
        }

        Ok(MessageHeader {
            content_length,
            reliable: raw & (1 << 12) != 0,
            in_order: raw & (1 << 13) != 0,
            // a first fragment is always also a fragment, whether or not the sender set bit 14
            fragment: raw & (1 << 14) != 0 || first_fragment,
            first_fragment,
        })
    }
}

/// Payload of a `PacketAck` control message: one base packet id (three bytes) and a bitfield
///  where bit `i` acknowledges `base + i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketAckPayload {
    pub base: PacketId,
    pub bitfield: u32,
}

impl PacketAckPayload {
    pub const LEN: usize = 7;

    pub fn ser(&self, buf: &mut impl BufMut) {
        let raw = self.base.to_raw();
        buf.put_u8((raw & 0xFF) as u8);
        buf.put_u16_le((raw >> 8) as u16);
        buf.put_u32_le(self.bitfield);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PacketAckPayload, WireError> {
        let low = buf
            .try_get_u8()
            .map_err(|_| WireError::Truncated("packet ack"))?;
        let high = buf
            .try_get_u16_le()
            .map_err(|_| WireError::Truncated("packet ack"))?;
        let bitfield = buf
            .try_get_u32_le()
            .map_err(|_| WireError::Truncated("packet ack"))?;

        Ok(PacketAckPayload {
            base: PacketId::from_raw(u32::from(low) | (u32::from(high) << 8)),
            bitfield,
        })
    }

    /// The acked ids beyond the base, from the set bits.
    pub fn acked_beyond_base(&self) -> impl Iterator<Item = PacketId> + '_ {
        let base = self.base;
        let bitfield = self.bitfield;
        (0..32u32)
            .filter(move |i| bitfield & (1 << i) != 0)
            .map(move |i| base.plus(i + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::plain(5, false, false, 0, vec![0x05, 0x00, 0x00])]
    #[case::reliable(5, true, false, 9, vec![0x45, 0x00, 0x00, 0x09, 0x00])]
    #[case::in_order(5, false, true, 0, vec![0x85, 0x00, 0x00])]
    #[case::high_bits((3 << 6) | 2, false, false, 0, vec![0x02, 0x03, 0x00])]
    #[case::max_id((1 << 22) - 1, false, false, 0, vec![0x3F, 0xFF, 0xFF])]
    #[case::reliable_wide_base(1, true, true, 0x12345, vec![0xC1, 0x00, 0x00, 0x45, 0xA3, 0x02, 0x00])]
    fn test_datagram_header(
        #[case] packet_id: u32,
        #[case] reliable: bool,
        #[case] in_order: bool,
        #[case] reliable_base: u32,
        #[case] expected: Vec<u8>,
    ) {
        let original = DatagramHeader {
            packet_id: PacketId::from_raw(packet_id),
            reliable,
            in_order,
            reliable_base,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(DatagramHeader::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }

    #[test]
    fn test_datagram_header_too_short() {
        let mut b: &[u8] = &[0x01, 0x02];
        assert_eq!(
            DatagramHeader::deser(&mut b),
            Err(WireError::Truncated("datagram header"))
        );
    }

    #[rstest]
    #[case::plain(3, false, false, false, false, vec![0x03, 0x00])]
    #[case::reliable(3, true, false, false, false, vec![0x03, 0x10])]
    #[case::in_order(3, false, true, false, false, vec![0x03, 0x20])]
    #[case::fragment(3, false, false, true, false, vec![0x03, 0x40])]
    #[case::first_fragment(3, true, false, true, true, vec![0x03, 0xD0])]
    #[case::max_len(2047, false, false, false, false, vec![0xFF, 0x07])]
    fn test_message_header(
        #[case] content_length: u16,
        #[case] reliable: bool,
        #[case] in_order: bool,
        #[case] fragment: bool,
        #[case] first_fragment: bool,
        #[case] expected: Vec<u8>,
    ) {
        let original = MessageHeader {
            content_length,
            reliable,
            in_order,
            fragment,
            first_fragment,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(MessageHeader::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }

    #[test]
    fn test_message_header_first_fragment_implies_fragment() {
        // bit 15 without bit 14
        let mut b: &[u8] = &[0x03, 0x80];
        let header = MessageHeader::deser(&mut b).unwrap();
        assert!(header.fragment);
        assert!(header.first_fragment);
    }

    #[test]
    fn test_message_header_zero_length_rejected() {
        let mut b: &[u8] = &[0x00, 0x10];
        assert_eq!(
            MessageHeader::deser(&mut b),
            Err(WireError::ZeroContentLength)
        );
    }

    #[rstest]
    #[case::no_bits(0x123456, 0, vec![0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00], vec![])]
    #[case::low_bit(5, 0x1, vec![0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00], vec![6])]
    #[case::several(5, 0b1001, vec![0x05, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00], vec![6, 9])]
    #[case::high_bit(5, 1 << 31, vec![0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80], vec![37])]
    fn test_packet_ack_payload(
        #[case] base: u32,
        #[case] bitfield: u32,
        #[case] expected: Vec<u8>,
        #[case] expected_beyond: Vec<u32>,
    ) {
        let original = PacketAckPayload {
            base: PacketId::from_raw(base),
            bitfield,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), PacketAckPayload::LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(PacketAckPayload::deser(&mut b).unwrap(), original);

        let beyond: Vec<u32> = original.acked_beyond_base().map(PacketId::to_raw).collect();
        assert_eq!(beyond, expected_beyond);
    }

    #[test]
    fn test_packet_ack_wraps_around_id_space() {
        let payload = PacketAckPayload {
            base: PacketId::from_raw((1 << 22) - 2),
            bitfield: 0b11,
        };
        let beyond: Vec<u32> = payload.acked_beyond_base().map(PacketId::to_raw).collect();
        assert_eq!(beyond, vec![(1 << 22) - 1, 0]);
    }
}
