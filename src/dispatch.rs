use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    error::{ErrorKind, HttpException},
    proto::{StreamType, VarInt},
    push::PushId,
    quic::StreamId,
};

#[derive(Debug)]
pub(crate) enum DispatchEvent {
    ControlBound { id: StreamId },
    ControlData { data: Bytes },
    EncoderData { data: Bytes },
    DecoderData { data: Bytes },
    /// A push stream arrived but its push id has not been decoded yet.
    PushBegin { id: StreamId, eof: bool },
    /// The push id is in; the stream body stays buffered here until adopted.
    PushIdentified { id: StreamId, push_id: PushId, eof: bool },
    /// End of stream on a not-yet-adopted push stream.
    PushEof { id: StreamId, push_id: Option<PushId> },
    /// A preface we don't recognize; reset the stream, not the connection.
    UnknownStream { id: StreamId, typ: StreamType },
}

enum UniKind {
    /// Preface varint not complete yet.
    Unclassified,
    /// Control or QPACK stream; bytes are forwarded, not buffered.
    Forward(StreamType),
    /// A push stream, buffering until adoption.
    Push { push_id: Option<PushId> },
    /// Grease or freshly reset; bytes are discarded.
    Drain,
}

struct UniStream {
    kind: UniKind,
    buf: BytesMut,
    eof: bool,
}

/// Classifies incoming unidirectional streams by their preface and routes
/// bytes until a stream has a real owner.
pub(crate) struct Dispatcher {
    streams: HashMap<StreamId, UniStream>,
    encoder_stream: Option<StreamId>,
    decoder_stream: Option<StreamId>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            encoder_stream: None,
            decoder_stream: None,
        }
    }

    pub fn on_data(
        &mut self,
        id: StreamId,
        data: &[u8],
        eof: bool,
    ) -> Result<Vec<DispatchEvent>, HttpException> {
        let stream = self.streams.entry(id).or_insert(UniStream {
            kind: UniKind::Unclassified,
            buf: BytesMut::new(),
            eof: false,
        });
        stream.buf.extend_from_slice(data);
        stream.eof |= eof;

        let mut events = Vec::new();

        if let UniKind::Unclassified = stream.kind {
            let mut cursor = std::io::Cursor::new(&stream.buf[..]);
            let typ = match StreamType::decode(&mut cursor) {
                Ok(typ) => typ,
                Err(_) => {
                    // Preface split across packets; an EOF here is a stillborn stream.
                    if stream.eof {
                        self.streams.remove(&id);
                    }
                    return Ok(events);
                }
            };

            let consumed = cursor.position() as usize;
            stream.buf.advance(consumed);

            match typ {
                StreamType::Control => {
                    stream.kind = UniKind::Forward(typ);
                    events.push(DispatchEvent::ControlBound { id });
                }
                StreamType::QpackEncoder => {
                    if self.encoder_stream.is_some() {
                        return Err(HttpException::new(
                            ErrorKind::UnexpectedFrame,
                            format!("duplicate qpack encoder stream: {id}"),
                        ));
                    }
                    self.encoder_stream = Some(id);
                    stream.kind = UniKind::Forward(typ);
                }
                StreamType::QpackDecoder => {
                    if self.decoder_stream.is_some() {
                        return Err(HttpException::new(
                            ErrorKind::UnexpectedFrame,
                            format!("duplicate qpack decoder stream: {id}"),
                        ));
                    }
                    self.decoder_stream = Some(id);
                    stream.kind = UniKind::Forward(typ);
                }
                StreamType::Push => {
                    stream.kind = UniKind::Push { push_id: None };
                    events.push(DispatchEvent::PushBegin {
                        id,
                        eof: stream.eof,
                    });
                }
                StreamType::Grease(value) => {
                    log::trace!("draining grease stream {id}, type {value}");
                    stream.kind = UniKind::Drain;
                }
                StreamType::Unknown(_) => {
                    self.streams.remove(&id);
                    events.push(DispatchEvent::UnknownStream { id, typ });
                    return Ok(events);
                }
            }
        }

        match &mut stream.kind {
            UniKind::Unclassified => unreachable!("classified above"),
            UniKind::Forward(typ) => {
                let data = stream.buf.split().freeze();
                if !data.is_empty() {
                    events.push(match typ {
                        StreamType::Control => DispatchEvent::ControlData { data },
                        StreamType::QpackEncoder => DispatchEvent::EncoderData { data },
                        _ => DispatchEvent::DecoderData { data },
                    });
                }
            }
            UniKind::Push { push_id } => {
                if push_id.is_none() {
                    // The push id is an unframed varint after the preface.
                    let mut cursor = std::io::Cursor::new(&stream.buf[..]);
                    match VarInt::decode(&mut cursor) {
                        Ok(value) => {
                            let consumed = cursor.position() as usize;
                            stream.buf.advance(consumed);

                            let decoded = PushId(value.into_inner());
                            *push_id = Some(decoded);
                            events.push(DispatchEvent::PushIdentified {
                                id,
                                push_id: decoded,
                                eof: stream.eof,
                            });
                        }
                        Err(_) if stream.eof => {
                            // Stream ended inside the push id; nothing to adopt.
                            self.streams.remove(&id);
                            events.push(DispatchEvent::PushEof { id, push_id: None });
                            return Ok(events);
                        }
                        Err(_) => {}
                    }
                } else if eof {
                    events.push(DispatchEvent::PushEof {
                        id,
                        push_id: *push_id,
                    });
                }
            }
            UniKind::Drain => {
                stream.buf.clear();
                if stream.eof {
                    self.streams.remove(&id);
                }
            }
        }

        Ok(events)
    }

    /// Hand a push stream's buffered bytes to its new owner.
    pub fn adopt(&mut self, id: StreamId) -> Option<(BytesMut, bool)> {
        let stream = self.streams.remove(&id)?;
        Some((stream.buf, stream.eof))
    }

    pub fn remove(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    /// All push streams still waiting for a promise.
    pub fn nascent_push_streams(&self) -> Vec<(StreamId, Option<PushId>)> {
        self.streams
            .iter()
            .filter_map(|(id, stream)| match stream.kind {
                UniKind::Push { push_id } => Some((*id, push_id)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preface(typ: StreamType) -> Vec<u8> {
        let mut buf = Vec::new();
        typ.encode(&mut buf);
        buf
    }

    #[test]
    fn classifies_control() {
        let mut dispatcher = Dispatcher::new();

        let mut wire = preface(StreamType::Control);
        wire.extend_from_slice(b"frames");

        let events = dispatcher.on_data(StreamId(3), &wire, false).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DispatchEvent::ControlBound { id } if id == StreamId(3)));
        assert!(matches!(&events[1], DispatchEvent::ControlData { data } if &data[..] == b"frames"));
    }

    #[test]
    fn duplicate_encoder_stream_fatal() {
        let mut dispatcher = Dispatcher::new();

        dispatcher
            .on_data(StreamId(3), &preface(StreamType::QpackEncoder), false)
            .unwrap();
        let err = dispatcher
            .on_data(StreamId(7), &preface(StreamType::QpackEncoder), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedFrame);
    }

    #[test]
    fn push_id_incremental() {
        let mut dispatcher = Dispatcher::new();

        // 2-byte varint push id, delivered one byte at a time.
        let mut wire = preface(StreamType::Push);
        VarInt::from_u32(300).encode(&mut wire);
        wire.extend_from_slice(b"body");

        let events = dispatcher.on_data(StreamId(3), &wire[..1], false).unwrap();
        assert!(matches!(events[0], DispatchEvent::PushBegin { .. }));

        let events = dispatcher.on_data(StreamId(3), &wire[1..2], false).unwrap();
        assert!(events.is_empty());

        let events = dispatcher.on_data(StreamId(3), &wire[2..], false).unwrap();
        assert!(
            matches!(events[0], DispatchEvent::PushIdentified { push_id, .. } if push_id == PushId(300))
        );

        let (buf, eof) = dispatcher.adopt(StreamId(3)).unwrap();
        assert_eq!(&buf[..], b"body");
        assert!(!eof);
    }

    #[test]
    fn push_id_lengths() {
        // Any of the four varint encodings must be accepted.
        for (value, size) in [(7u64, 1), (300, 2), (70_000, 4), (1 << 31, 8)] {
            let mut dispatcher = Dispatcher::new();

            let mut wire = preface(StreamType::Push);
            let id = VarInt::try_from(value).unwrap();
            assert_eq!(id.size(), size);
            id.encode(&mut wire);

            let events = dispatcher.on_data(StreamId(3), &wire, false).unwrap();
            assert!(
                matches!(events[1], DispatchEvent::PushIdentified { push_id, .. } if push_id == PushId(value))
            );
        }
    }

    #[test]
    fn unknown_preface_is_stream_local() {
        let mut dispatcher = Dispatcher::new();

        let events = dispatcher
            .on_data(StreamId(3), &preface(StreamType::Unknown(VarInt::from_u32(0x42))), false)
            .unwrap();
        assert!(matches!(events[0], DispatchEvent::UnknownStream { .. }));
    }

    #[test]
    fn grease_drained() {
        let mut dispatcher = Dispatcher::new();

        let mut wire = preface(StreamType::Grease(VarInt::from_u32(0x21)));
        wire.extend_from_slice(b"junk");

        let events = dispatcher.on_data(StreamId(3), &wire, true).unwrap();
        assert!(events.is_empty());
    }
}
