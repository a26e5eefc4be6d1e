//! Integer encodings shared by every on-disk structure.
//!
//! Fixed-width integers are little-endian. Variable-width integers use the
//! usual 7-bits-per-byte scheme with the high bit marking continuation.

use bytes::BufMut;

/// Maximum encoded length of a varint32.
pub const MAX_VARINT32_LEN: usize = 5;

/// Maximum encoded length of a varint64.
pub const MAX_VARINT64_LEN: usize = 10;

/// Appends a little-endian u32.
pub fn put_fixed32(dst: &mut impl BufMut, value: u32) {
    dst.put_u32_le(value);
}

/// Appends a little-endian u64.
pub fn put_fixed64(dst: &mut impl BufMut, value: u64) {
    dst.put_u64_le(value);
}

/// Reads a little-endian u32 from the front of `src`.
pub fn decode_fixed32(src: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = src.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Reads a little-endian u64 from the front of `src`.
pub fn decode_fixed64(src: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = src.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Appends `value` as a varint.
pub fn put_varint32(dst: &mut impl BufMut, value: u32) {
    put_varint64(dst, value as u64);
}

/// Appends `value` as a varint.
pub fn put_varint64(dst: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decodes a varint32, returning the value and the number of bytes consumed.
///
/// Returns `None` on truncated input or on an encoding that overflows 32 bits.
pub fn decode_varint32(src: &[u8]) -> Option<(u32, usize)> {
    let mut result = 0u32;
    for (i, &byte) in src.iter().take(MAX_VARINT32_LEN).enumerate() {
        let shift = 7 * i as u32;
        let bits = (byte & 0x7f) as u32;
        if shift == 28 && bits > 0x0f {
            return None;
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None
}

/// Decodes a varint64, returning the value and the number of bytes consumed.
pub fn decode_varint64(src: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;
    for (i, &byte) in src.iter().take(MAX_VARINT64_LEN).enumerate() {
        let shift = 7 * i as u32;
        let bits = (byte & 0x7f) as u64;
        if shift == 63 && bits > 1 {
            return None;
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None
}

/// Cursor-style varint32 read: advances `src` past the value on success.
pub fn get_varint32(src: &mut &[u8]) -> Option<u32> {
    let (value, n) = decode_varint32(src)?;
    *src = &src[n..];
    Some(value)
}

/// Cursor-style varint64 read: advances `src` past the value on success.
pub fn get_varint64(src: &mut &[u8]) -> Option<u64> {
    let (value, n) = decode_varint64(src)?;
    *src = &src[n..];
    Some(value)
}

/// Appends a varint32 length followed by the bytes.
pub fn put_length_prefixed_slice(dst: &mut impl BufMut, value: &[u8]) {
    put_varint32(dst, value.len() as u32);
    dst.put_slice(value);
}

/// Reads a varint32-length-prefixed slice, advancing `src`.
pub fn get_length_prefixed_slice<'a>(src: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = get_varint32(src)? as usize;
    if src.len() < len {
        return None;
    }
    let (value, rest) = src.split_at(len);
    *src = rest;
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_roundtrip() {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, 0xdeadbeef);
        put_fixed64(&mut buf, 0x0123456789abcdef);
        assert_eq!(buf.len(), 12);
        assert_eq!(decode_fixed32(&buf), Some(0xdeadbeef));
        assert_eq!(decode_fixed64(&buf[4..]), Some(0x0123456789abcdef));
        assert_eq!(decode_fixed64(&buf[8..]), None);
    }

    #[test]
    fn test_varint_lengths() {
        assert_eq!(varint_length(0), 1);
        assert_eq!(varint_length(127), 1);
        assert_eq!(varint_length(128), 2);
        assert_eq!(varint_length(u32::MAX as u64), 5);
        assert_eq!(varint_length(u64::MAX), 10);
    }

    #[test]
    fn test_truncated_varint() {
        let mut buf = Vec::new();
        put_varint64(&mut buf, 1 << 40);
        assert!(decode_varint64(&buf[..buf.len() - 1]).is_none());
        assert!(decode_varint32(&[0x80]).is_none());
        assert!(decode_varint32(&[]).is_none());
    }

    #[test]
    fn test_varint32_overflow() {
        assert!(decode_varint32(&[0xff, 0xff, 0xff, 0xff, 0x1f]).is_none());
        assert_eq!(decode_varint32(&[0xff, 0xff, 0xff, 0xff, 0x0f]), Some((u32::MAX, 5)));
    }

    #[test]
    fn test_length_prefixed_slice() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, b"rocksdb.properties");
        put_length_prefixed_slice(&mut buf, b"");
        let mut input = buf.as_slice();
        assert_eq!(get_length_prefixed_slice(&mut input), Some(&b"rocksdb.properties"[..]));
        assert_eq!(get_length_prefixed_slice(&mut input), Some(&b""[..]));
        assert!(input.is_empty());
        assert!(get_length_prefixed_slice(&mut input).is_none());
    }

    proptest! {
        #[test]
        fn prop_varint64_roundtrip(value in any::<u64>()) {
            let mut buf = Vec::new();
            put_varint64(&mut buf, value);
            prop_assert_eq!(buf.len(), varint_length(value));
            prop_assert_eq!(decode_varint64(&buf), Some((value, buf.len())));
        }

        #[test]
        fn prop_varint32_roundtrip(value in any::<u32>()) {
            let mut buf = Vec::new();
            put_varint32(&mut buf, value);
            let mut input = buf.as_slice();
            prop_assert_eq!(get_varint32(&mut input), Some(value));
            prop_assert!(input.is_empty());
        }
    }
}
