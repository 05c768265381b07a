// QPACK field sections and the instructions that maintain the dynamic table.
// Huffman coding is not produced and not accepted; every string is a literal.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("prefix integer bounds exceeded")]
    BoundsExceeded,

    #[error("huffman-coded string")]
    Huffman,

    #[error("unknown static table entry")]
    UnknownEntry,

    #[error("dynamic table entry not available")]
    InvalidIndex,

    #[error("dynamic table capacity exceeds the negotiated maximum")]
    InvalidCapacity,

    #[error("entry larger than the dynamic table capacity")]
    EntryTooLarge,

    #[error("invalid required insert count")]
    InvalidInsertCount,

    #[error("invalid utf8 header")] // technically not required by the HTTP spec
    Utf8Error(#[from] std::str::Utf8Error),
}

// HPACK/QPACK prefix integers: the value starts in the low `bits` bits of
// the first byte and spills into base-128 continuation bytes once that
// prefix saturates. The bits above the prefix belong to the caller.
// https://www.rfc-editor.org/rfc/rfc7541#section-5.1

pub fn decode_prefix<B: Buf>(buf: &mut B, bits: u8) -> Result<(u8, u64), HeaderError> {
    assert!((1..=8).contains(&bits));

    if !buf.has_remaining() {
        return Err(HeaderError::UnexpectedEnd);
    }

    // Widen before shifting so a full-width prefix stays in range.
    let prefix_max = ((1u32 << bits) - 1) as u8;
    let first = buf.get_u8();
    let spare = (u32::from(first) >> bits) as u8;

    let mut value = u64::from(first & prefix_max);
    if value < u64::from(prefix_max) {
        return Ok((spare, value));
    }

    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(HeaderError::UnexpectedEnd);
        }
        if shift > 56 {
            return Err(HeaderError::BoundsExceeded);
        }

        let cont = buf.get_u8();
        value = value
            .checked_add(u64::from(cont & 0x7f) << shift)
            .ok_or(HeaderError::BoundsExceeded)?;
        if cont & 0x80 == 0 {
            return Ok((spare, value));
        }

        shift += 7;
    }
}

pub fn encode_prefix<B: BufMut>(buf: &mut B, bits: u8, spare: u8, value: u64) {
    assert!((1..=8).contains(&bits));

    let prefix_max = ((1u32 << bits) - 1) as u8;
    let spare = ((u32::from(spare) << bits) & 0xff) as u8;

    if value < u64::from(prefix_max) {
        buf.put_u8(spare | value as u8);
        return;
    }

    buf.put_u8(spare | prefix_max);

    let mut rest = value - u64::from(prefix_max);
    while rest >= 0x80 {
        buf.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    buf.put_u8(rest as u8);
}

// A length-prefixed string with a huffman bit at the top of the prefix.
fn decode_string<B: Buf>(buf: &mut B, size: u8) -> Result<String, HeaderError> {
    let (flags, len) = decode_prefix(buf, size - 1)?;
    if flags & 1 != 0 {
        return Err(HeaderError::Huffman);
    }

    let len = len as usize;
    if buf.remaining() < len {
        return Err(HeaderError::UnexpectedEnd);
    }

    let payload = buf.copy_to_bytes(len);
    let value = std::str::from_utf8(&payload)?;
    Ok(value.to_string())
}

fn encode_string<B: BufMut>(buf: &mut B, size: u8, flags: u8, value: &str) {
    // Shift the caller's flags past the huffman bit, which is always 0.
    encode_prefix(buf, size - 1, flags << 1, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

// The QPACK static table. https://www.rfc-editor.org/rfc/rfc9204.html#appendix-A
pub fn static_entry(index: u64) -> Result<(&'static str, &'static str), HeaderError> {
    STATIC_TABLE
        .get(index as usize)
        .copied()
        .ok_or(HeaderError::UnknownEntry)
}

pub fn static_find(name: &str, value: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, v)| n == name && v == value)
        .map(|i| i as u64)
}

pub fn static_find_name(name: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, _)| n == name)
        .map(|i| i as u64)
}

/// The decoder's view of the QPACK dynamic table.
///
/// Entries are addressed by absolute index: 0 is the first entry ever
/// inserted. Evicted entries stay counted so indices never shift.
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<(String, String)>,
    dropped: u64,
    size: u64,
    capacity: u64,
    max_capacity: u64,
}

fn entry_size(name: &str, value: &str) -> u64 {
    name.len() as u64 + value.len() as u64 + 32
}

impl DynamicTable {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            dropped: 0,
            size: 0,
            capacity: 0,
            max_capacity,
        }
    }

    /// Total number of inserts ever performed.
    pub fn insert_count(&self) -> u64 {
        self.dropped + self.entries.len() as u64
    }

    pub fn max_entries(&self) -> u64 {
        self.max_capacity / 32
    }

    pub fn set_capacity(&mut self, capacity: u64) -> Result<(), HeaderError> {
        if capacity > self.max_capacity {
            return Err(HeaderError::InvalidCapacity);
        }

        self.capacity = capacity;
        self.evict();
        Ok(())
    }

    pub fn insert(&mut self, name: String, value: String) -> Result<(), HeaderError> {
        if entry_size(&name, &value) > self.capacity {
            return Err(HeaderError::EntryTooLarge);
        }

        self.size += entry_size(&name, &value);
        self.entries.push_back((name, value));
        self.evict();
        Ok(())
    }

    pub fn get_absolute(&self, index: u64) -> Result<(&str, &str), HeaderError> {
        let offset = index
            .checked_sub(self.dropped)
            .ok_or(HeaderError::InvalidIndex)?;
        let (name, value) = self
            .entries
            .get(offset as usize)
            .ok_or(HeaderError::InvalidIndex)?;
        Ok((name, value))
    }

    pub fn apply(&mut self, instruction: &EncoderInstruction) -> Result<(), HeaderError> {
        match instruction {
            EncoderInstruction::SetCapacity(capacity) => self.set_capacity(*capacity),
            EncoderInstruction::InsertWithNameRef {
                static_table,
                index,
                value,
            } => {
                let name = if *static_table {
                    static_entry(*index)?.0.to_string()
                } else {
                    // A relative index into the dynamic table, 0 = most recent.
                    let abs = self
                        .insert_count()
                        .checked_sub(1 + index)
                        .ok_or(HeaderError::InvalidIndex)?;
                    self.get_absolute(abs)?.0.to_string()
                };
                self.insert(name, value.clone())
            }
            EncoderInstruction::InsertLiteral { name, value } => {
                self.insert(name.clone(), value.clone())
            }
            EncoderInstruction::Duplicate(index) => {
                let abs = self
                    .insert_count()
                    .checked_sub(1 + index)
                    .ok_or(HeaderError::InvalidIndex)?;
                let (name, value) = self.get_absolute(abs)?;
                let (name, value) = (name.to_string(), value.to_string());
                self.insert(name, value)
            }
        }
    }

    fn evict(&mut self) {
        while self.size > self.capacity {
            let (name, value) = self.entries.pop_front().expect("size without entries");
            self.size -= entry_size(&name, &value);
            self.dropped += 1;
        }
    }
}

/// An instruction on the encoder stream. https://www.rfc-editor.org/rfc/rfc9204.html#section-4.3
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderInstruction {
    SetCapacity(u64),
    InsertWithNameRef {
        static_table: bool,
        index: u64,
        value: String,
    },
    InsertLiteral {
        name: String,
        value: String,
    },
    Duplicate(u64),
}

impl EncoderInstruction {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, HeaderError> {
        if !buf.has_remaining() {
            return Err(HeaderError::UnexpectedEnd);
        }

        let peek = buf.chunk()[0];
        if peek & 0b1000_0000 != 0 {
            /*
                0   1   2   3   4   5   6   7
              +---+---+---+---+---+---+---+---+
              | 1 | T |    Name Index (6+)    |
              +---+---+-----------------------+
              | H |     Value Length (7+)     |
              +---+---------------------------+
              |  Value String (Length bytes)  |
              +-------------------------------+
            */
            let (flags, index) = decode_prefix(buf, 6)?;
            let value = decode_string(buf, 8)?;
            Ok(Self::InsertWithNameRef {
                static_table: flags & 0b01 != 0,
                index,
                value,
            })
        } else if peek & 0b0100_0000 != 0 {
            /*
                0   1   2   3   4   5   6   7
              +---+---+---+---+---+---+---+---+
              | 0 | 1 | H | Name Length (5+)  |
              +---+---+---+-------------------+
              |  Name String (Length bytes)   |
              +---+---------------------------+
              | H |     Value Length (7+)     |
              +---+---------------------------+
              |  Value String (Length bytes)  |
              +-------------------------------+
            */
            let name = decode_string(buf, 6)?;
            let value = decode_string(buf, 8)?;
            Ok(Self::InsertLiteral { name, value })
        } else if peek & 0b0010_0000 != 0 {
            /*
                0   1   2   3   4   5   6   7
              +---+---+---+---+---+---+---+---+
              | 0 | 0 | 1 |   Capacity (5+)   |
              +---+---+---+-------------------+
            */
            let (_, capacity) = decode_prefix(buf, 5)?;
            Ok(Self::SetCapacity(capacity))
        } else {
            /*
                0   1   2   3   4   5   6   7
              +---+---+---+---+---+---+---+---+
              | 0 | 0 | 0 |    Index (5+)     |
              +---+---+---+-------------------+
            */
            let (_, index) = decode_prefix(buf, 5)?;
            Ok(Self::Duplicate(index))
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::SetCapacity(capacity) => encode_prefix(buf, 5, 0b001, *capacity),
            Self::InsertWithNameRef {
                static_table,
                index,
                value,
            } => {
                let flags = 0b10 | (*static_table as u8);
                encode_prefix(buf, 6, flags, *index);
                encode_string(buf, 8, 0, value);
            }
            Self::InsertLiteral { name, value } => {
                encode_string(buf, 6, 0b01, name);
                encode_string(buf, 8, 0, value);
            }
            Self::Duplicate(index) => encode_prefix(buf, 5, 0b000, *index),
        }
    }
}

/// An instruction on the decoder stream. https://www.rfc-editor.org/rfc/rfc9204.html#section-4.4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderInstruction {
    SectionAck(u64),
    StreamCancel(u64),
    InsertCountIncrement(u64),
}

impl DecoderInstruction {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, HeaderError> {
        if !buf.has_remaining() {
            return Err(HeaderError::UnexpectedEnd);
        }

        let peek = buf.chunk()[0];
        if peek & 0b1000_0000 != 0 {
            let (_, id) = decode_prefix(buf, 7)?;
            Ok(Self::SectionAck(id))
        } else if peek & 0b0100_0000 != 0 {
            let (_, id) = decode_prefix(buf, 6)?;
            Ok(Self::StreamCancel(id))
        } else {
            let (_, increment) = decode_prefix(buf, 6)?;
            Ok(Self::InsertCountIncrement(increment))
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::SectionAck(id) => encode_prefix(buf, 7, 0b1, *id),
            Self::StreamCancel(id) => encode_prefix(buf, 6, 0b01, *id),
            Self::InsertCountIncrement(increment) => encode_prefix(buf, 6, 0b00, *increment),
        }
    }
}

/// The two-integer prefix in front of every encoded field section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPrefix {
    pub required_insert_count: u64,
    pub base: u64,
}

impl SectionPrefix {
    /// Decode the prefix, reconstructing the required insert count against
    /// the decoder's current table state.
    /// https://www.rfc-editor.org/rfc/rfc9204.html#section-4.5.1.1
    pub fn decode<B: Buf>(buf: &mut B, table: &DynamicTable) -> Result<Self, HeaderError> {
        let (_, encoded) = decode_prefix(buf, 8)?;

        let required_insert_count = if encoded == 0 {
            0
        } else {
            let max_entries = table.max_entries();
            let full_range = 2 * max_entries;
            if max_entries == 0 || encoded > full_range {
                return Err(HeaderError::InvalidInsertCount);
            }

            let max_value = table.insert_count() + max_entries;
            let max_wrapped = (max_value / full_range) * full_range;
            let mut count = max_wrapped + encoded - 1;

            if count > max_value {
                if count <= full_range {
                    return Err(HeaderError::InvalidInsertCount);
                }
                count -= full_range;
            }

            if count == 0 {
                return Err(HeaderError::InvalidInsertCount);
            }
            count
        };

        let (sign, delta) = decode_prefix(buf, 7)?;
        let base = if sign & 1 == 0 {
            required_insert_count + delta
        } else {
            required_insert_count
                .checked_sub(delta + 1)
                .ok_or(HeaderError::InvalidInsertCount)?
        };

        Ok(Self {
            required_insert_count,
            base,
        })
    }

    pub fn encode<B: BufMut>(&self, max_entries: u64, buf: &mut B) {
        let encoded = if self.required_insert_count == 0 {
            0
        } else {
            self.required_insert_count % (2 * max_entries) + 1
        };
        encode_prefix(buf, 8, 0, encoded);

        if self.base >= self.required_insert_count {
            encode_prefix(buf, 7, 0, self.base - self.required_insert_count);
        } else {
            encode_prefix(buf, 7, 1, self.required_insert_count - self.base - 1);
        }
    }
}

/// Decode a complete field section. The caller must have checked that the
/// table has reached `required_insert_count` first.
/// https://www.rfc-editor.org/rfc/rfc9204.html#section-4.5.2
pub fn decode_section<B: Buf>(
    buf: &mut B,
    table: &DynamicTable,
) -> Result<(SectionPrefix, Vec<(String, String)>), HeaderError> {
    let prefix = SectionPrefix::decode(buf, table)?;
    let base = prefix.base;

    let mut fields = Vec::new();
    while buf.has_remaining() {
        let peek = buf.chunk()[0];

        let (name, value) = if peek & 0b1000_0000 != 0 {
            // Indexed field line.
            let (flags, index) = decode_prefix(buf, 6)?;
            if flags & 0b01 != 0 {
                let (name, value) = static_entry(index)?;
                (name.to_string(), value.to_string())
            } else {
                let abs = base
                    .checked_sub(index + 1)
                    .ok_or(HeaderError::InvalidIndex)?;
                let (name, value) = table.get_absolute(abs)?;
                (name.to_string(), value.to_string())
            }
        } else if peek & 0b0100_0000 != 0 {
            // Literal with name reference; the N (never-index) bit is ignored.
            let (flags, index) = decode_prefix(buf, 4)?;
            let name = if flags & 0b0001 != 0 {
                static_entry(index)?.0.to_string()
            } else {
                let abs = base
                    .checked_sub(index + 1)
                    .ok_or(HeaderError::InvalidIndex)?;
                table.get_absolute(abs)?.0.to_string()
            };
            let value = decode_string(buf, 8)?;
            (name, value)
        } else if peek & 0b0010_0000 != 0 {
            // Literal with literal name.
            let name = decode_string(buf, 4)?;
            let value = decode_string(buf, 8)?;
            (name, value)
        } else if peek & 0b0001_0000 != 0 {
            // Indexed with post-base index.
            let (_, index) = decode_prefix(buf, 4)?;
            let (name, value) = table.get_absolute(base + index)?;
            (name.to_string(), value.to_string())
        } else {
            // Literal with post-base name reference.
            let (_, index) = decode_prefix(buf, 3)?;
            let name = table.get_absolute(base + index)?.0.to_string();
            let value = decode_string(buf, 8)?;
            (name, value)
        };

        fields.push((name, value));
    }

    Ok((prefix, fields))
}

/// Encode a field section without dynamic table references.
pub fn encode_section<B: BufMut>(fields: &[(String, String)], buf: &mut B) {
    SectionPrefix {
        required_insert_count: 0,
        base: 0,
    }
    .encode(1, buf);

    // Pseudo-headers must come first.
    // https://datatracker.ietf.org/doc/html/rfc9114#section-4.3
    let mut fields: Vec<_> = fields.iter().collect();
    fields.sort_by_key(|(name, _)| !name.starts_with(':'));

    for (name, value) in fields {
        if let Some(index) = static_find(name, value) {
            // Indexed field line, static.
            encode_prefix(buf, 6, 0b11, index);
        } else if let Some(index) = static_find_name(name) {
            // Literal with static name reference.
            encode_prefix(buf, 4, 0b0101, index);
            encode_string(buf, 8, 0, value);
        } else {
            // Literal with literal name.
            encode_string(buf, 4, 0b0010, name);
            encode_string(buf, 8, 0, value);
        }
    }
}

const STATIC_TABLE: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains",
    ),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|&(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn prefix_roundtrip() {
        for &(size, value) in &[(5u8, 0u64), (5, 30), (5, 31), (5, 1337), (8, 255), (8, 10_000)] {
            let mut buf = Vec::new();
            encode_prefix(&mut buf, size, 0, value);
            let (_, decoded) = decode_prefix(&mut Cursor::new(&buf), size).unwrap();
            assert_eq!(decoded, value, "size={size} value={value}");
        }
    }

    #[test]
    fn static_only_section() {
        let input = fields(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/"),
            ("user-agent", "h3-mux"),
            ("x-custom", "yes"),
        ]);

        let mut buf = Vec::new();
        encode_section(&input, &mut buf);

        let table = DynamicTable::new(0);
        let (prefix, decoded) = decode_section(&mut Cursor::new(&buf), &table).unwrap();
        assert_eq!(prefix.required_insert_count, 0);

        for pair in &input {
            assert!(decoded.contains(pair), "missing {pair:?}");
        }
    }

    #[test]
    fn pseudo_headers_first() {
        let input = fields(&[("x-custom", "yes"), (":method", "GET"), (":status", "200")]);

        let mut buf = Vec::new();
        encode_section(&input, &mut buf);

        let table = DynamicTable::new(0);
        let (_, decoded) = decode_section(&mut Cursor::new(&buf), &table).unwrap();
        assert!(decoded[0].0.starts_with(':'));
        assert!(decoded[1].0.starts_with(':'));
        assert_eq!(decoded[2].0, "x-custom");
    }

    #[test]
    fn encoder_instructions() {
        let mut table = DynamicTable::new(4096);

        let instructions = [
            EncoderInstruction::SetCapacity(4096),
            EncoderInstruction::InsertLiteral {
                name: "x-dyn".to_string(),
                value: "one".to_string(),
            },
            EncoderInstruction::InsertWithNameRef {
                static_table: true,
                index: 92, // server
                value: "h3-mux".to_string(),
            },
            EncoderInstruction::Duplicate(1),
        ];

        for instruction in &instructions {
            let mut buf = Vec::new();
            instruction.encode(&mut buf);
            let decoded = EncoderInstruction::decode(&mut Cursor::new(&buf)).unwrap();
            assert_eq!(&decoded, instruction);
            table.apply(&decoded).unwrap();
        }

        assert_eq!(table.insert_count(), 3);
        assert_eq!(table.get_absolute(0).unwrap(), ("x-dyn", "one"));
        assert_eq!(table.get_absolute(1).unwrap(), ("server", "h3-mux"));
        assert_eq!(table.get_absolute(2).unwrap(), ("x-dyn", "one"));
    }

    #[test]
    fn dynamic_section() {
        let mut table = DynamicTable::new(4096);
        table.set_capacity(4096).unwrap();
        table.insert("x-dyn".to_string(), "one".to_string()).unwrap();
        table.insert("x-dyn".to_string(), "two".to_string()).unwrap();

        // Reference both entries relative to base = insert count.
        let mut buf = Vec::new();
        SectionPrefix {
            required_insert_count: 2,
            base: 2,
        }
        .encode(table.max_entries(), &mut buf);
        encode_prefix(&mut buf, 6, 0b10, 0); // x-dyn: two
        encode_prefix(&mut buf, 6, 0b10, 1); // x-dyn: one

        let (prefix, decoded) = decode_section(&mut Cursor::new(&buf), &table).unwrap();
        assert_eq!(prefix.required_insert_count, 2);
        assert_eq!(
            decoded,
            fields(&[("x-dyn", "two"), ("x-dyn", "one")])
        );
    }

    #[test]
    fn post_base_section() {
        let mut table = DynamicTable::new(4096);
        table.set_capacity(4096).unwrap();
        table.insert("x-dyn".to_string(), "one".to_string()).unwrap();

        // Base 0, entry referenced post-base.
        let mut buf = Vec::new();
        SectionPrefix {
            required_insert_count: 1,
            base: 0,
        }
        .encode(table.max_entries(), &mut buf);
        encode_prefix(&mut buf, 4, 0b0001, 0);

        let (_, decoded) = decode_section(&mut Cursor::new(&buf), &table).unwrap();
        assert_eq!(decoded, fields(&[("x-dyn", "one")]));
    }

    #[test]
    fn required_insert_count_reconstruction() {
        let mut table = DynamicTable::new(4096);
        table.set_capacity(4096).unwrap();
        for i in 0..10 {
            table
                .insert("x-dyn".to_string(), format!("{i}"))
                .unwrap();
        }

        for ric in 1..=10 {
            let mut buf = Vec::new();
            SectionPrefix {
                required_insert_count: ric,
                base: ric,
            }
            .encode(table.max_entries(), &mut buf);

            let prefix = SectionPrefix::decode(&mut Cursor::new(&buf), &table).unwrap();
            assert_eq!(prefix.required_insert_count, ric);
            assert_eq!(prefix.base, ric);
        }
    }

    #[test]
    fn eviction_keeps_absolute_indices() {
        let mut table = DynamicTable::new(128);
        table.set_capacity(128).unwrap();

        // Each entry is 32 + 5 + 3 = 40 bytes, so only 3 fit.
        for i in 0..4 {
            table
                .insert("x-dyn".to_string(), format!("{i:03}"))
                .unwrap();
        }

        assert_eq!(table.insert_count(), 4);
        assert_eq!(table.get_absolute(0), Err(HeaderError::InvalidIndex));
        assert_eq!(table.get_absolute(1).unwrap().1, "001");
        assert_eq!(table.get_absolute(3).unwrap().1, "003");
    }

    #[test]
    fn huffman_rejected() {
        let mut buf = Vec::new();
        SectionPrefix {
            required_insert_count: 0,
            base: 0,
        }
        .encode(1, &mut buf);

        // Literal with literal name, huffman bit set on the name.
        encode_prefix(&mut buf, 3, 0b00101, 3);
        buf.extend_from_slice(b"abc");

        let table = DynamicTable::new(0);
        assert_eq!(
            decode_section(&mut Cursor::new(&buf), &table),
            Err(HeaderError::Huffman)
        );
    }

    #[test]
    fn decoder_instructions() {
        let instructions = [
            DecoderInstruction::SectionAck(0),
            DecoderInstruction::SectionAck(1000),
            DecoderInstruction::StreamCancel(4),
            DecoderInstruction::InsertCountIncrement(7),
        ];

        for instruction in &instructions {
            let mut buf = Vec::new();
            instruction.encode(&mut buf);
            let decoded = DecoderInstruction::decode(&mut Cursor::new(&buf)).unwrap();
            assert_eq!(&decoded, instruction);
        }
    }

    #[test]
    fn decoder_instruction_sizes() {
        // A cancel for a small stream id is a single byte.
        let mut buf = Vec::new();
        DecoderInstruction::StreamCancel(0).encode(&mut buf);
        assert_eq!(buf.len(), 1);

        let mut buf = Vec::new();
        DecoderInstruction::SectionAck(63).encode(&mut buf);
        assert_eq!(buf.len(), 1);
    }
}
