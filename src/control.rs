use bytes::{Bytes, BytesMut};

use crate::{
    error::{ErrorKind, HttpException},
    proto::{encode_frame, split_frame, Frame, Setting, Settings, StreamType, VarInt},
    push::PushId,
    quic::StreamId,
    session::SessionConfig,
};

#[derive(Debug)]
pub(crate) enum ControlEvent {
    Settings(Settings),
    Goaway(StreamId),
    CancelPush(PushId),
}

/// The outbound and inbound HTTP/3 control streams.
///
/// Exactly one inbound control stream is accepted, its first frame must be
/// SETTINGS, and SETTINGS is emitted at most once on the outbound stream.
pub(crate) struct ControlPlane {
    pub egress_stream: Option<StreamId>,
    pub ingress_stream: Option<StreamId>,
    pub peer_settings: Option<Settings>,
    pub peer_goaway: Option<StreamId>,
    pub sent_settings: bool,
    ingress_buf: BytesMut,
}

impl ControlPlane {
    pub fn new() -> Self {
        Self {
            egress_stream: None,
            ingress_stream: None,
            peer_settings: None,
            peer_goaway: None,
            sent_settings: false,
            ingress_buf: BytesMut::new(),
        }
    }

    pub fn bind_ingress(&mut self, id: StreamId) -> Result<(), HttpException> {
        if self.ingress_stream.is_some() {
            return Err(HttpException::new(
                ErrorKind::UnexpectedFrame,
                format!("duplicate control stream: {id}"),
            ));
        }

        self.ingress_stream = Some(id);
        Ok(())
    }

    /// The stream preface plus our one SETTINGS frame and MAX_PUSH_ID.
    /// Calling this twice is a bug in the session, not a peer behavior.
    pub fn settings_frame(&mut self, config: &SessionConfig) -> Vec<u8> {
        assert!(!self.sent_settings, "SETTINGS already sent on control stream");
        self.sent_settings = true;

        let mut settings = Settings::default();
        settings.insert(
            Setting::QPACK_MAX_TABLE_CAPACITY,
            VarInt::try_from(config.qpack_max_table_capacity).unwrap_or(VarInt::MAX),
        );
        settings.insert(
            Setting::QPACK_BLOCKED_STREAMS,
            VarInt::try_from(config.qpack_blocked_streams).unwrap_or(VarInt::MAX),
        );
        settings.insert(
            Setting::MAX_FIELD_SECTION_SIZE,
            VarInt::try_from(config.max_field_section_size).unwrap_or(VarInt::MAX),
        );

        let mut payload = Vec::new();
        settings.encode_payload(&mut payload);

        let mut buf = Vec::new();
        encode_frame(Frame::SETTINGS, &payload, &mut buf);

        let mut push_payload = Vec::new();
        VarInt::try_from(config.max_push_id)
            .unwrap_or(VarInt::MAX)
            .encode(&mut push_payload);
        encode_frame(Frame::MAX_PUSH_ID, &push_payload, &mut buf);

        buf
    }

    pub fn preface() -> Vec<u8> {
        let mut buf = Vec::new();
        StreamType::Control.encode(&mut buf);
        buf
    }

    pub fn goaway_frame(last: VarInt) -> Vec<u8> {
        let mut payload = Vec::new();
        last.encode(&mut payload);

        let mut buf = Vec::new();
        encode_frame(Frame::GOAWAY, &payload, &mut buf);
        buf
    }

    pub fn on_ingress(&mut self, data: &[u8]) -> Result<Vec<ControlEvent>, HttpException> {
        self.ingress_buf.extend_from_slice(data);

        let mut events = Vec::new();
        while let Some((typ, payload)) = split_frame(&mut self.ingress_buf) {
            if self.peer_settings.is_none() && typ != Frame::SETTINGS {
                return Err(HttpException::new(
                    ErrorKind::MissingSettings,
                    format!("control frame {:?} before SETTINGS", typ),
                ));
            }

            match typ {
                Frame::SETTINGS => self.on_settings(payload, &mut events)?,
                Frame::GOAWAY => self.on_goaway(payload, &mut events)?,
                Frame::CANCEL_PUSH => self.on_cancel_push(payload, &mut events)?,
                Frame::MAX_PUSH_ID => {
                    return Err(HttpException::new(
                        ErrorKind::UnexpectedFrame,
                        "MAX_PUSH_ID received from server",
                    ));
                }
                Frame::DATA | Frame::HEADERS | Frame::PUSH_PROMISE => {
                    return Err(HttpException::new(
                        ErrorKind::UnexpectedFrame,
                        format!("frame {:?} on control stream", typ),
                    ));
                }
                other => {
                    log::trace!("ignoring unknown control frame {:?}", other);
                }
            }
        }

        Ok(events)
    }

    fn on_settings(
        &mut self,
        payload: Bytes,
        events: &mut Vec<ControlEvent>,
    ) -> Result<(), HttpException> {
        if self.peer_settings.is_some() {
            return Err(HttpException::new(
                ErrorKind::UnexpectedFrame,
                "duplicate SETTINGS frame",
            ));
        }

        let settings = Settings::decode_payload(&mut std::io::Cursor::new(&payload[..]))
            .map_err(|e| HttpException::new(ErrorKind::UnexpectedFrame, e.to_string()))?;

        log::debug!("received peer SETTINGS: {:?}", settings);
        self.peer_settings = Some(settings.clone());
        events.push(ControlEvent::Settings(settings));
        Ok(())
    }

    fn on_goaway(
        &mut self,
        payload: Bytes,
        events: &mut Vec<ControlEvent>,
    ) -> Result<(), HttpException> {
        let last = VarInt::decode(&mut std::io::Cursor::new(&payload[..]))
            .map_err(|e| HttpException::new(ErrorKind::UnexpectedFrame, e.to_string()))?;
        let last = StreamId(last.into_inner());

        // The peer may only shrink the set of streams it will serve.
        if let Some(prev) = self.peer_goaway {
            if last > prev {
                return Err(HttpException::new(
                    ErrorKind::UnexpectedFrame,
                    format!("GOAWAY last id increased from {prev} to {last}"),
                ));
            }
        }

        log::debug!("received GOAWAY, last id {last}");
        self.peer_goaway = Some(last);
        events.push(ControlEvent::Goaway(last));
        Ok(())
    }

    fn on_cancel_push(
        &mut self,
        payload: Bytes,
        events: &mut Vec<ControlEvent>,
    ) -> Result<(), HttpException> {
        let push_id = VarInt::decode(&mut std::io::Cursor::new(&payload[..]))
            .map_err(|e| HttpException::new(ErrorKind::UnexpectedFrame, e.to_string()))?;

        events.push(ControlEvent::CancelPush(PushId(push_id.into_inner())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_bytes() -> Vec<u8> {
        let mut payload = Vec::new();
        Settings::default().encode_payload(&mut payload);

        let mut buf = Vec::new();
        encode_frame(Frame::SETTINGS, &payload, &mut buf);
        buf
    }

    #[test]
    fn settings_must_come_first() {
        let mut control = ControlPlane::new();

        let goaway = ControlPlane::goaway_frame(VarInt::from_u32(0));
        let err = control.on_ingress(&goaway).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingSettings);
    }

    #[test]
    fn duplicate_settings_rejected() {
        let mut control = ControlPlane::new();

        control.on_ingress(&settings_bytes()).unwrap();
        let err = control.on_ingress(&settings_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedFrame);
    }

    #[test]
    fn goaway_may_only_shrink() {
        let mut control = ControlPlane::new();
        control.on_ingress(&settings_bytes()).unwrap();

        control
            .on_ingress(&ControlPlane::goaway_frame(VarInt::from_u32(8)))
            .unwrap();
        control
            .on_ingress(&ControlPlane::goaway_frame(VarInt::from_u32(8)))
            .unwrap();
        control
            .on_ingress(&ControlPlane::goaway_frame(VarInt::from_u32(4)))
            .unwrap();

        let err = control
            .on_ingress(&ControlPlane::goaway_frame(VarInt::from_u32(12)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedFrame);
    }

    #[test]
    fn unknown_frames_skipped() {
        let mut control = ControlPlane::new();
        control.on_ingress(&settings_bytes()).unwrap();

        let mut buf = Vec::new();
        encode_frame(Frame(VarInt::from_u32(0x21)), b"grease", &mut buf);
        let events = control.on_ingress(&buf).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn partial_frames_buffered() {
        let mut control = ControlPlane::new();

        let wire = settings_bytes();
        let (a, b) = wire.split_at(2);

        assert!(control.on_ingress(a).unwrap().is_empty());
        let events = control.on_ingress(b).unwrap();
        assert_eq!(events.len(), 1);
        assert!(control.peer_settings.is_some());
    }

    #[test]
    #[should_panic(expected = "SETTINGS already sent")]
    fn double_send_settings_panics() {
        let mut control = ControlPlane::new();
        let config = SessionConfig::default();

        control.settings_frame(&config);
        control.settings_frame(&config);
    }
}
