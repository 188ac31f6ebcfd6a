//! Variable-length unsigned integer codec used in datagram headers.
//!
//! Three schemes, named by the byte widths they can occupy. The leading unit carries the width
//!  flags in its top bits; the remaining bits hold the low bits of the value and any further
//!  units hold the higher bits. The four-byte scheme has one flag combination that no encoder
//!  produces - decoders reject it with [`WireError::InvalidVle`] and callers abort the datagram.
//!
//! All multi-byte units are little-endian.

use crate::error::WireError;
use bytes::{Buf, BufMut};

/// Largest value representable as VLE8/16.
pub const MAX_VLE8_16: u32 = 0x7FFF;
/// Largest value representable as VLE8/16/32.
pub const MAX_VLE8_16_32: u32 = 0x3FFF_FFFF;
/// Largest value representable as VLE16/32.
pub const MAX_VLE16_32: u32 = 0x7FFF_FFFF;

/// One byte `0vvvvvvv`, or two bytes `1vvvvvvv vvvvvvvv` (low bits first).
pub fn put_vle8_16(buf: &mut impl BufMut, value: u32) {
    debug_assert!(value <= MAX_VLE8_16);

    if value <= 0x7F {
        buf.put_u8(value as u8);
    } else {
        buf.put_u8(0x80 | (value & 0x7F) as u8);
        buf.put_u8((value >> 7) as u8);
    }
}

pub fn get_vle8_16(buf: &mut impl Buf) -> Result<u32, WireError> {
    let first = buf.try_get_u8().map_err(|_| WireError::Truncated("VLE8/16"))?;
    if first & 0x80 == 0 {
        return Ok(u32::from(first));
    }
    let second = buf.try_get_u8().map_err(|_| WireError::Truncated("VLE8/16"))?;
    Ok(u32::from(first & 0x7F) | (u32::from(second) << 7))
}

pub fn len_vle8_16(value: u32) -> usize {
    if value <= 0x7F {
        1
    } else {
        2
    }
}

/// The leading byte's two top bits select the width: `00` one byte (6-bit value), `10` two
///  bytes (14 bits), `11` four bytes (30 bits). `01` is the rejected combination.
pub fn put_vle8_16_32(buf: &mut impl BufMut, value: u32) {
    debug_assert!(value <= MAX_VLE8_16_32);

    if value <= 0x3F {
        buf.put_u8(value as u8);
    } else if value <= 0x3FFF {
        buf.put_u8(0x80 | (value & 0x3F) as u8);
        buf.put_u8((value >> 6) as u8);
    } else {
        buf.put_u8(0xC0 | (value & 0x3F) as u8);
        buf.put_u8((value >> 6) as u8);
        buf.put_u16_le((value >> 14) as u16);
    }
}

pub fn get_vle8_16_32(buf: &mut impl Buf) -> Result<u32, WireError> {
    let first = buf.try_get_u8().map_err(|_| WireError::Truncated("VLE8/16/32"))?;
    let low = u32::from(first & 0x3F);
    match first >> 6 {
        0b00 => Ok(low),
        0b10 => {
            let second = buf.try_get_u8().map_err(|_| WireError::Truncated("VLE8/16/32"))?;
            Ok(low | (u32::from(second) << 6))
        }
        0b11 => {
            let second = buf.try_get_u8().map_err(|_| WireError::Truncated("VLE8/16/32"))?;
            let high = buf
                .try_get_u16_le()
                .map_err(|_| WireError::Truncated("VLE8/16/32"))?;
            Ok(low | (u32::from(second) << 6) | (u32::from(high) << 14))
        }
        _ => Err(WireError::InvalidVle),
    }
}

pub fn len_vle8_16_32(value: u32) -> usize {
    if value <= 0x3F {
        1
    } else if value <= 0x3FFF {
        2
    } else {
        4
    }
}

/// The leading u16's top bit selects the width: clear for a 15-bit value, set for 31 bits with
///  the high bits in a following u16.
pub fn put_vle16_32(buf: &mut impl BufMut, value: u32) {
    debug_assert!(value <= MAX_VLE16_32);

    if value <= 0x7FFF {
        buf.put_u16_le(value as u16);
    } else {
        buf.put_u16_le(0x8000 | (value & 0x7FFF) as u16);
        buf.put_u16_le((value >> 15) as u16);
    }
}

pub fn get_vle16_32(buf: &mut impl Buf) -> Result<u32, WireError> {
    let first = buf
        .try_get_u16_le()
        .map_err(|_| WireError::Truncated("VLE16/32"))?;
    if first & 0x8000 == 0 {
        return Ok(u32::from(first));
    }
    let second = buf
        .try_get_u16_le()
        .map_err(|_| WireError::Truncated("VLE16/32"))?;
    Ok(u32::from(first & 0x7FFF) | (u32::from(second) << 15))
}

pub fn len_vle16_32(value: u32) -> usize {
    if value <= 0x7FFF {
        2
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, vec![0x00])]
    #[case::narrow_max(0x7F, vec![0x7F])]
    #[case::wide_min(0x80, vec![0x80, 0x01])]
    #[case::mid(0x1234, vec![0xB4, 0x24])]
    #[case::wide_max(MAX_VLE8_16, vec![0xFF, 0xFF])]
    fn test_vle8_16(#[case] value: u32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_vle8_16(&mut buf, value);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(len_vle8_16(value), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(get_vle8_16(&mut b), Ok(value));
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::zero(0, vec![0x00])]
    #[case::one_byte_max(0x3F, vec![0x3F])]
    #[case::two_byte_min(0x40, vec![0x80, 0x01])]
    #[case::two_byte_max(0x3FFF, vec![0xBF, 0xFF])]
    #[case::four_byte_min(0x4000, vec![0xC0, 0x00, 0x01, 0x00])]
    #[case::four_byte_max(MAX_VLE8_16_32, vec![0xFF, 0xFF, 0xFF, 0xFF])]
    fn test_vle8_16_32(#[case] value: u32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_vle8_16_32(&mut buf, value);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(len_vle8_16_32(value), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(get_vle8_16_32(&mut b), Ok(value));
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::zero(0, vec![0x00, 0x00])]
    #[case::narrow_max(0x7FFF, vec![0xFF, 0x7F])]
    #[case::wide_min(0x8000, vec![0x00, 0x80, 0x01, 0x00])]
    #[case::wide_max(MAX_VLE16_32, vec![0xFF, 0xFF, 0xFF, 0xFF])]
    fn test_vle16_32(#[case] value: u32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_vle16_32(&mut buf, value);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(len_vle16_32(value), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(get_vle16_32(&mut b), Ok(value));
        assert!(b.is_empty());
    }

    #[test]
    fn test_vle8_16_32_rejects_unknown_flag_combination() {
        // 0b01 in the top bits is produced by no encoder width
        let mut b: &[u8] = &[0x40, 0x01, 0x02, 0x03];
        assert_eq!(get_vle8_16_32(&mut b), Err(WireError::InvalidVle));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::wide_cut_short(vec![0x80])]
    fn test_vle8_16_truncated(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert_eq!(get_vle8_16(&mut b), Err(WireError::Truncated("VLE8/16")));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::two_byte_cut_short(vec![0x80])]
    #[case::four_byte_cut_short(vec![0xC0, 0x01, 0x02])]
    fn test_vle8_16_32_truncated(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert_eq!(
            get_vle8_16_32(&mut b),
            Err(WireError::Truncated("VLE8/16/32"))
        );
    }

    #[rstest]
    #[case::one_byte_only(vec![0x12])]
    #[case::wide_cut_short(vec![0x00, 0x80, 0x01])]
    fn test_vle16_32_truncated(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert_eq!(get_vle16_32(&mut b), Err(WireError::Truncated("VLE16/32")));
    }
}
