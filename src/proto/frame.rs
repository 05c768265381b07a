use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{VarInt, VarIntUnexpectedEnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(pub VarInt);

impl Frame {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(Frame(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }
}

macro_rules! frames {
    {$($name:ident = $val:expr,)*} => {
        impl Frame {
            $(pub const $name: Frame = Frame(VarInt::from_u32($val));)*
        }
    }
}

frames! {
    DATA = 0x00,
    HEADERS = 0x01,
    CANCEL_PUSH = 0x03,
    SETTINGS = 0x04,
    PUSH_PROMISE = 0x05,
    GOAWAY = 0x07,
    MAX_PUSH_ID = 0x0d,
}

/// Write a frame header followed by its payload.
pub fn encode_frame<B: BufMut>(typ: Frame, payload: &[u8], buf: &mut B) {
    typ.encode(buf);
    VarInt::try_from(payload.len() as u64)
        .expect("frame payload too large")
        .encode(buf);
    buf.put_slice(payload);
}

/// Pop one complete frame off the front of `buf`.
///
/// Returns `None` when the header or payload is still incomplete; the
/// buffer is left untouched so the caller can retry with more data.
pub fn split_frame(buf: &mut BytesMut) -> Option<(Frame, Bytes)> {
    let mut cursor = std::io::Cursor::new(&buf[..]);

    let typ = Frame::decode(&mut cursor).ok()?;
    let len = VarInt::decode(&mut cursor).ok()?.into_inner() as usize;

    let header = cursor.position() as usize;
    if buf.len() < header + len {
        return None;
    }

    buf.advance(header);
    Some((typ, buf.split_to(len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_complete() {
        let mut buf = BytesMut::new();
        encode_frame(Frame::HEADERS, b"abc", &mut buf);
        encode_frame(Frame::DATA, b"defg", &mut buf);

        let (typ, payload) = split_frame(&mut buf).unwrap();
        assert_eq!(typ, Frame::HEADERS);
        assert_eq!(&payload[..], b"abc");

        let (typ, payload) = split_frame(&mut buf).unwrap();
        assert_eq!(typ, Frame::DATA);
        assert_eq!(&payload[..], b"defg");

        assert!(buf.is_empty());
    }

    #[test]
    fn split_partial() {
        let mut wire = BytesMut::new();
        encode_frame(Frame::DATA, b"hello world", &mut wire);

        // Feed one byte at a time; the frame only pops once complete.
        let mut buf = BytesMut::new();
        let last = wire.len() - 1;
        for byte in &wire[..last] {
            buf.put_u8(*byte);
            assert!(split_frame(&mut buf).is_none());
        }

        buf.put_u8(wire[last]);
        let (typ, payload) = split_frame(&mut buf).unwrap();
        assert_eq!(typ, Frame::DATA);
        assert_eq!(&payload[..], b"hello world");
    }

    #[test]
    fn split_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(Frame::SETTINGS, b"", &mut buf);

        let (typ, payload) = split_frame(&mut buf).unwrap();
        assert_eq!(typ, Frame::SETTINGS);
        assert!(payload.is_empty());
    }
}
