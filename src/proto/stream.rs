use bytes::{Buf, BufMut};

use super::{VarInt, VarIntUnexpectedEnd};

/// The role an incoming unidirectional stream declares with the varint at
/// its start. Values this crate does not speak are kept around so the
/// dispatcher can tell reserved traffic apart from genuinely unknown types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Control,
    Push,
    QpackEncoder,
    QpackDecoder,
    /// A reserved value (0x21 + 0x1f * n); legal to open, content ignored.
    Grease(VarInt),
    Unknown(VarInt),
}

impl StreamType {
    pub fn from_value(value: VarInt) -> Self {
        match value.into_inner() {
            0x00 => Self::Control,
            0x01 => Self::Push,
            0x02 => Self::QpackEncoder,
            0x03 => Self::QpackDecoder,
            raw if raw >= 0x21 && (raw - 0x21) % 0x1f == 0 => Self::Grease(value),
            _ => Self::Unknown(value),
        }
    }

    pub fn value(&self) -> VarInt {
        match self {
            Self::Control => VarInt::from_u32(0x00),
            Self::Push => VarInt::from_u32(0x01),
            Self::QpackEncoder => VarInt::from_u32(0x02),
            Self::QpackDecoder => VarInt::from_u32(0x03),
            Self::Grease(value) | Self::Unknown(value) => *value,
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(Self::from_value(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.value().encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn classification() {
        assert_eq!(
            StreamType::from_value(VarInt::from_u32(0x00)),
            StreamType::Control
        );
        assert_eq!(
            StreamType::from_value(VarInt::from_u32(0x01)),
            StreamType::Push
        );
        assert_eq!(
            StreamType::from_value(VarInt::from_u32(0x02)),
            StreamType::QpackEncoder
        );
        assert_eq!(
            StreamType::from_value(VarInt::from_u32(0x03)),
            StreamType::QpackDecoder
        );

        // The reserved sequence starts at 0x21 and repeats every 0x1f.
        for raw in [0x21u32, 0x21 + 0x1f, 0x21 + 7 * 0x1f] {
            assert_eq!(
                StreamType::from_value(VarInt::from_u32(raw)),
                StreamType::Grease(VarInt::from_u32(raw))
            );
        }

        assert_eq!(
            StreamType::from_value(VarInt::from_u32(0x22)),
            StreamType::Unknown(VarInt::from_u32(0x22))
        );
    }

    #[test]
    fn wire_roundtrip() {
        let types = [
            StreamType::Control,
            StreamType::Push,
            StreamType::QpackEncoder,
            StreamType::QpackDecoder,
            StreamType::Grease(VarInt::from_u32(0x21)),
            StreamType::Unknown(VarInt::from_u32(0x42)),
        ];

        for typ in types {
            let mut buf = Vec::new();
            typ.encode(&mut buf);
            let decoded = StreamType::decode(&mut Cursor::new(&buf)).unwrap();
            assert_eq!(decoded, typ);
        }
    }
}
