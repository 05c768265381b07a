use std::fmt;

use bytes::{Buf, BufMut};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unexpected end of input")]
pub struct VarIntUnexpectedEnd;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

/// A QUIC variable-length integer, capped at 2^62-1.
///
/// The two most significant bits of the first byte encode the length:
/// 0b00 = 1, 0b01 = 2, 0b10 = 4, 0b11 = 8 bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    pub const MAX: VarInt = VarInt((1 << 62) - 1);

    /// Create a VarInt from a u32, which always fits.
    pub const fn from_u32(value: u32) -> Self {
        VarInt(value as u64)
    }

    pub fn from_u64(value: u64) -> Result<Self, VarIntBoundsExceeded> {
        if value > Self::MAX.0 {
            return Err(VarIntBoundsExceeded);
        }

        Ok(VarInt(value))
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// The number of bytes this value occupies on the wire.
    pub fn size(&self) -> usize {
        match self.0 {
            x if x < 2u64.pow(6) => 1,
            x if x < 2u64.pow(14) => 2,
            x if x < 2u64.pow(30) => 4,
            _ => 8,
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(VarIntUnexpectedEnd);
        }

        let mut bytes = [0u8; 8];
        bytes[0] = buf.get_u8();

        let tag = bytes[0] >> 6;
        bytes[0] &= 0b0011_1111;

        let value = match tag {
            0b00 => u64::from(bytes[0]),
            0b01 => {
                if buf.remaining() < 1 {
                    return Err(VarIntUnexpectedEnd);
                }
                buf.copy_to_slice(&mut bytes[1..2]);
                u64::from(u16::from_be_bytes(bytes[..2].try_into().unwrap()))
            }
            0b10 => {
                if buf.remaining() < 3 {
                    return Err(VarIntUnexpectedEnd);
                }
                buf.copy_to_slice(&mut bytes[1..4]);
                u64::from(u32::from_be_bytes(bytes[..4].try_into().unwrap()))
            }
            0b11 => {
                if buf.remaining() < 7 {
                    return Err(VarIntUnexpectedEnd);
                }
                buf.copy_to_slice(&mut bytes[1..8]);
                u64::from_be_bytes(bytes)
            }
            _ => unreachable!(),
        };

        Ok(VarInt(value))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let x = self.0;
        if x < 2u64.pow(6) {
            buf.put_u8(x as u8);
        } else if x < 2u64.pow(14) {
            buf.put_u16(0b01 << 14 | x as u16);
        } else if x < 2u64.pow(30) {
            buf.put_u32(0b10 << 30 | x as u32);
        } else {
            buf.put_u64(0b11 << 62 | x);
        }
    }
}

impl From<u32> for VarInt {
    fn from(value: u32) -> Self {
        VarInt(value as u64)
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        VarInt::from_u64(value)
    }
}

impl From<VarInt> for u64 {
    fn from(value: VarInt) -> Self {
        value.0
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(value: u64) -> usize {
        let v = VarInt::from_u64(value).unwrap();
        let mut buf = Vec::new();
        v.encode(&mut buf);
        assert_eq!(buf.len(), v.size());

        let decoded = VarInt::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, v);
        buf.len()
    }

    #[test]
    fn sizes() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(63), 1);
        assert_eq!(roundtrip(64), 2);
        assert_eq!(roundtrip(16383), 2);
        assert_eq!(roundtrip(16384), 4);
        assert_eq!(roundtrip((1 << 30) - 1), 4);
        assert_eq!(roundtrip(1 << 30), 8);
        assert_eq!(roundtrip((1 << 62) - 1), 8);
    }

    #[test]
    fn bounds() {
        assert!(VarInt::from_u64(1 << 62).is_err());
        assert_eq!(VarInt::MAX.into_inner(), (1 << 62) - 1);
    }

    #[test]
    fn truncated() {
        let mut buf = Vec::new();
        VarInt::from_u32(16384).encode(&mut buf);
        buf.truncate(2);

        assert_eq!(
            VarInt::decode(&mut Cursor::new(&buf)),
            Err(VarIntUnexpectedEnd)
        );
    }
}
