use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    error::{ErrorKind, HttpException},
    executor::TimerHandle,
    proto::headers::{
        decode_section, DecoderInstruction, DynamicTable, EncoderInstruction, SectionPrefix,
    },
    proto::StreamType,
    quic::StreamId,
};

pub(crate) enum SectionOutcome {
    /// Decoded immediately; `ack` holds decoder-stream bytes to flush.
    Decoded {
        fields: Vec<(String, String)>,
        ack: Vec<u8>,
    },
    /// Deferred until the dynamic table reaches the required insert count.
    Blocked,
}

pub(crate) struct Unblocked {
    pub stream: StreamId,
    pub timer: Option<TimerHandle>,
    pub result: Result<Vec<(String, String)>, HttpException>,
    /// Decoder-stream bytes (section ack) to flush on success.
    pub ack: Vec<u8>,
}

struct BlockedSection {
    stream: StreamId,
    required: u64,
    block: Bytes,
    timer: Option<TimerHandle>,
}

/// Defers header delivery until the QPACK dynamic table has advanced far
/// enough, preserving per-stream arrival order.
pub(crate) struct QpackGate {
    table: DynamicTable,
    encoder_buf: BytesMut,
    blocked: VecDeque<BlockedSection>,
    decoder_preface_sent: bool,
}

impl QpackGate {
    pub fn new(max_table_capacity: u64) -> Self {
        Self {
            table: DynamicTable::new(max_table_capacity),
            encoder_buf: BytesMut::new(),
            blocked: VecDeque::new(),
            decoder_preface_sent: false,
        }
    }

    pub fn insert_count(&self) -> u64 {
        self.table.insert_count()
    }

    pub fn is_blocked(&self, stream: StreamId) -> bool {
        self.blocked.iter().any(|entry| entry.stream == stream)
    }

    /// Try to decode a header block, queueing it if the table is behind.
    /// The caller arms the timeout and registers it with [`QpackGate::arm`].
    pub fn decode_or_block(
        &mut self,
        stream: StreamId,
        block: Bytes,
    ) -> Result<SectionOutcome, HttpException> {
        let mut cursor = std::io::Cursor::new(&block[..]);
        let prefix = SectionPrefix::decode(&mut cursor, &self.table)
            .map_err(|e| decode_error(stream, e))?;

        if prefix.required_insert_count > self.table.insert_count() {
            log::debug!(
                "header block on stream {stream} blocked: requires {} inserts, have {}",
                prefix.required_insert_count,
                self.table.insert_count()
            );
            self.blocked.push_back(BlockedSection {
                stream,
                required: prefix.required_insert_count,
                block,
                timer: None,
            });
            return Ok(SectionOutcome::Blocked);
        }

        let fields = self.decode_now(&block).map_err(|e| decode_error(stream, e))?;
        let ack = if prefix.required_insert_count > 0 {
            self.section_ack(stream)
        } else {
            Vec::new()
        };

        Ok(SectionOutcome::Decoded { fields, ack })
    }

    /// Decode a section that is not allowed to block, e.g. the header block
    /// inside a PUSH_PROMISE frame.
    pub fn decode_immediate(
        &self,
        stream: StreamId,
        block: &Bytes,
    ) -> Result<Vec<(String, String)>, HttpException> {
        let mut cursor = std::io::Cursor::new(&block[..]);
        let prefix = SectionPrefix::decode(&mut cursor, &self.table)
            .map_err(|e| decode_error(stream, e))?;

        if prefix.required_insert_count > self.table.insert_count() {
            return Err(HttpException::new(
                ErrorKind::HeaderDecodeError,
                format!(
                    "push promise on stream {stream} references unavailable table state"
                ),
            ));
        }

        self.decode_now(block).map_err(|e| decode_error(stream, e))
    }

    /// Tear down, handing back every armed timer for cancellation.
    pub fn take_timers(&mut self) -> Vec<TimerHandle> {
        self.blocked.drain(..).filter_map(|entry| entry.timer).collect()
    }

    pub fn arm(&mut self, stream: StreamId, timer: TimerHandle) {
        if let Some(entry) = self
            .blocked
            .iter_mut()
            .find(|entry| entry.stream == stream && entry.timer.is_none())
        {
            entry.timer = Some(timer);
        }
    }

    /// Feed encoder-stream bytes, returning every section the new table
    /// state unblocks, in original arrival order.
    pub fn on_encoder_data(&mut self, data: &[u8]) -> Result<Vec<Unblocked>, HttpException> {
        self.encoder_buf.extend_from_slice(data);

        loop {
            let mut cursor = std::io::Cursor::new(&self.encoder_buf[..]);
            let instruction = match EncoderInstruction::decode(&mut cursor) {
                Ok(instruction) => instruction,
                Err(crate::proto::headers::HeaderError::UnexpectedEnd) => break,
                Err(e) => {
                    return Err(HttpException::new(
                        ErrorKind::HeaderDecodeError,
                        format!("qpack encoder stream error: {e}"),
                    ));
                }
            };

            let consumed = cursor.position() as usize;
            self.encoder_buf.advance(consumed);

            log::trace!("qpack encoder instruction: {:?}", instruction);
            self.table.apply(&instruction).map_err(|e| {
                HttpException::new(
                    ErrorKind::HeaderDecodeError,
                    format!("qpack encoder stream error: {e}"),
                )
            })?;
        }

        let mut unblocked = Vec::new();
        while let Some(entry) = self.blocked.front() {
            if entry.required > self.table.insert_count() {
                break;
            }

            let entry = self.blocked.pop_front().unwrap();
            let result = self
                .decode_now(&entry.block)
                .map_err(|e| decode_error(entry.stream, e));
            let ack = match result {
                Ok(_) => self.section_ack(entry.stream),
                Err(_) => Vec::new(),
            };

            unblocked.push(Unblocked {
                stream: entry.stream,
                timer: entry.timer,
                result,
                ack,
            });
        }

        Ok(unblocked)
    }

    /// Drop any blocked section for an aborted or timed-out stream and
    /// produce the cancellation record for the decoder stream.
    pub fn cancel_stream(&mut self, stream: StreamId) -> (Option<TimerHandle>, Vec<u8>) {
        let mut timer = None;
        let mut was_blocked = false;

        self.blocked.retain(|entry| {
            if entry.stream == stream {
                timer = entry.timer;
                was_blocked = true;
                false
            } else {
                true
            }
        });

        let bytes = if was_blocked {
            self.decoder_bytes(DecoderInstruction::StreamCancel(stream.into_inner()))
        } else {
            Vec::new()
        };

        (timer, bytes)
    }

    fn section_ack(&mut self, stream: StreamId) -> Vec<u8> {
        self.decoder_bytes(DecoderInstruction::SectionAck(stream.into_inner()))
    }

    // The decoder stream is opened lazily; its preface rides along with the
    // first instruction.
    fn decoder_bytes(&mut self, instruction: DecoderInstruction) -> Vec<u8> {
        let mut buf = Vec::new();
        if !self.decoder_preface_sent {
            StreamType::QpackDecoder.encode(&mut buf);
            self.decoder_preface_sent = true;
        }
        instruction.encode(&mut buf);
        buf
    }

    fn decode_now(
        &self,
        block: &Bytes,
    ) -> Result<Vec<(String, String)>, crate::proto::headers::HeaderError> {
        let mut cursor = std::io::Cursor::new(&block[..]);
        let (_, fields) = decode_section(&mut cursor, &self.table)?;
        Ok(fields)
    }
}

fn decode_error(stream: StreamId, e: crate::proto::headers::HeaderError) -> HttpException {
    HttpException::new(
        ErrorKind::HeaderDecodeError,
        format!("header decode error on stream {stream}: {e}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::headers::encode_section;

    fn literal_block(fields: &[(&str, &str)]) -> Bytes {
        let fields: Vec<_> = fields
            .iter()
            .map(|&(n, v)| (n.to_string(), v.to_string()))
            .collect();
        let mut buf = Vec::new();
        encode_section(&fields, &mut buf);
        buf.into()
    }

    fn blocked_block(table_max: u64, required: u64) -> Bytes {
        // References the most recent insert the encoder claims to have made.
        let mut buf = Vec::new();
        SectionPrefix {
            required_insert_count: required,
            base: required,
        }
        .encode(DynamicTable::new(table_max).max_entries(), &mut buf);
        crate::proto::headers::encode_prefix(&mut buf, 6, 0b10, 0);
        buf.into()
    }

    fn insert_instruction(name: &str, value: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        EncoderInstruction::SetCapacity(4096).encode(&mut buf);
        EncoderInstruction::InsertLiteral {
            name: name.to_string(),
            value: value.to_string(),
        }
        .encode(&mut buf);
        buf
    }

    #[test]
    fn static_sections_pass_through() {
        let mut gate = QpackGate::new(4096);

        let outcome = gate
            .decode_or_block(StreamId(0), literal_block(&[(":status", "200")]))
            .unwrap();
        match outcome {
            SectionOutcome::Decoded { fields, ack } => {
                assert_eq!(fields[0].1, "200");
                assert!(ack.is_empty(), "no ack for a static section");
            }
            SectionOutcome::Blocked => panic!("should not block"),
        }
    }

    #[test]
    fn blocks_until_insert_count() {
        let mut gate = QpackGate::new(4096);

        let outcome = gate
            .decode_or_block(StreamId(0), blocked_block(4096, 1))
            .unwrap();
        assert!(matches!(outcome, SectionOutcome::Blocked));
        assert!(gate.is_blocked(StreamId(0)));

        let unblocked = gate
            .on_encoder_data(&insert_instruction("x-dyn", "value"))
            .unwrap();
        assert_eq!(unblocked.len(), 1);
        assert_eq!(unblocked[0].stream, StreamId(0));

        let fields = unblocked[0].result.as_ref().unwrap();
        assert_eq!(fields[0], ("x-dyn".to_string(), "value".to_string()));
        assert!(!unblocked[0].ack.is_empty());
        assert!(!gate.is_blocked(StreamId(0)));
    }

    #[test]
    fn unblocks_in_arrival_order() {
        let mut gate = QpackGate::new(4096);

        gate.decode_or_block(StreamId(0), blocked_block(4096, 1))
            .unwrap();
        gate.decode_or_block(StreamId(4), blocked_block(4096, 1))
            .unwrap();

        let unblocked = gate
            .on_encoder_data(&insert_instruction("x-dyn", "value"))
            .unwrap();
        let streams: Vec<_> = unblocked.iter().map(|u| u.stream).collect();
        assert_eq!(streams, vec![StreamId(0), StreamId(4)]);
    }

    #[test]
    fn cancel_emits_preface_then_single_bytes() {
        let mut gate = QpackGate::new(4096);

        gate.decode_or_block(StreamId(0), blocked_block(4096, 1))
            .unwrap();
        let (_, bytes) = gate.cancel_stream(StreamId(0));
        // First decoder-stream write: preface byte plus the cancel record.
        assert_eq!(bytes.len(), 2);

        gate.decode_or_block(StreamId(4), blocked_block(4096, 1))
            .unwrap();
        let (_, bytes) = gate.cancel_stream(StreamId(4));
        assert_eq!(bytes.len(), 1);
    }

    #[test]
    fn cancelled_entry_never_delivers() {
        let mut gate = QpackGate::new(4096);

        gate.decode_or_block(StreamId(0), blocked_block(4096, 1))
            .unwrap();
        gate.cancel_stream(StreamId(0));

        let unblocked = gate
            .on_encoder_data(&insert_instruction("x-dyn", "value"))
            .unwrap();
        assert!(unblocked.is_empty());
    }

    #[test]
    fn partial_instructions_buffered() {
        let mut gate = QpackGate::new(4096);

        let wire = insert_instruction("x-dyn", "value");
        let split = wire.len() - 3;

        gate.on_encoder_data(&wire[..split]).unwrap();
        assert_eq!(gate.insert_count(), 0);

        gate.on_encoder_data(&wire[split..]).unwrap();
        assert_eq!(gate.insert_count(), 1);
    }
}
