use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
};

use bytes::{Buf, BufMut};

use thiserror::Error;

use super::{VarInt, VarIntUnexpectedEnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Setting(pub VarInt);

impl Setting {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(Setting(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }
}

macro_rules! settings {
    {$($name:ident = $val:expr,)*} => {
        impl Setting {
            $(pub const $name: Setting = Setting(VarInt::from_u32($val));)*
        }
    }
}

settings! {
    QPACK_MAX_TABLE_CAPACITY = 0x1,
    MAX_FIELD_SECTION_SIZE = 0x6,
    QPACK_BLOCKED_STREAMS = 0x7,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("invalid settings payload")]
    InvalidPayload,
}

// A map of settings to values, the payload of a SETTINGS frame.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Settings(BTreeMap<Setting, VarInt>);

impl Settings {
    /// Decode an entire SETTINGS frame payload.
    pub fn decode_payload<B: Buf>(buf: &mut B) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();

        while buf.has_remaining() {
            // A partial pair means the frame length was wrong; retrying won't help.
            let id = Setting::decode(buf).map_err(|_| SettingsError::InvalidPayload)?;
            let value = VarInt::decode(buf).map_err(|_| SettingsError::InvalidPayload)?;
            settings.0.insert(id, value);
        }

        Ok(settings)
    }

    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        for (id, value) in &self.0 {
            id.encode(buf);
            value.encode(buf);
        }
    }

    pub fn qpack_max_table_capacity(&self) -> u64 {
        self.get(&Setting::QPACK_MAX_TABLE_CAPACITY)
            .map(|v| v.into_inner())
            .unwrap_or(0)
    }

    pub fn qpack_blocked_streams(&self) -> u64 {
        self.get(&Setting::QPACK_BLOCKED_STREAMS)
            .map(|v| v.into_inner())
            .unwrap_or(0)
    }

    pub fn max_field_section_size(&self) -> Option<u64> {
        self.get(&Setting::MAX_FIELD_SECTION_SIZE)
            .map(|v| v.into_inner())
    }
}

impl Deref for Settings {
    type Target = BTreeMap<Setting, VarInt>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Settings {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let mut settings = Settings::default();
        settings.insert(Setting::QPACK_MAX_TABLE_CAPACITY, VarInt::from_u32(4096));
        settings.insert(Setting::QPACK_BLOCKED_STREAMS, VarInt::from_u32(100));
        settings.insert(Setting::MAX_FIELD_SECTION_SIZE, VarInt::from_u32(16384));

        let mut buf = Vec::new();
        settings.encode_payload(&mut buf);

        let decoded = Settings::decode_payload(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.qpack_max_table_capacity(), 4096);
        assert_eq!(decoded.qpack_blocked_streams(), 100);
        assert_eq!(decoded.max_field_section_size(), Some(16384));
    }

    #[test]
    fn empty() {
        let decoded = Settings::decode_payload(&mut Cursor::new(&[][..])).unwrap();
        assert_eq!(decoded.qpack_max_table_capacity(), 0);
        assert_eq!(decoded.max_field_section_size(), None);
    }

    #[test]
    fn unknown_ids_kept() {
        let mut settings = Settings::default();
        settings.insert(Setting(VarInt::from_u32(0x7f)), VarInt::from_u32(9));

        let mut buf = Vec::new();
        settings.encode_payload(&mut buf);

        let decoded = Settings::decode_payload(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(
            decoded.get(&Setting(VarInt::from_u32(0x7f))),
            Some(&VarInt::from_u32(9))
        );
    }

    #[test]
    fn truncated_pair() {
        let mut buf = Vec::new();
        Setting::QPACK_BLOCKED_STREAMS.encode(&mut buf);

        assert_eq!(
            Settings::decode_payload(&mut Cursor::new(&buf)),
            Err(SettingsError::InvalidPayload)
        );
    }
}
