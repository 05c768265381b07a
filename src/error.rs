use thiserror::Error;

use crate::proto::error::*;
use crate::quic::StreamId;

/// Classification of an [`HttpException`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectFailed,
    EarlyDataFailed,
    ConnectionReset,
    IdleTimeout,
    UnexpectedFrame,
    MissingSettings,
    UnknownStreamType,
    PushIdViolation,
    StreamUnacknowledged,
    HeaderDecodeError,
    EgressWriteError,
    Shutdown,
    InvalidOperation,
}

impl ErrorKind {
    /// The application error code used when this error resets a stream or
    /// closes the connection.
    pub fn wire_code(&self) -> u64 {
        match self {
            Self::UnexpectedFrame => H3_FRAME_UNEXPECTED,
            Self::MissingSettings => H3_MISSING_SETTINGS,
            Self::UnknownStreamType => H3_STREAM_CREATION_ERROR,
            Self::PushIdViolation => H3_ID_ERROR,
            Self::StreamUnacknowledged => H3_REQUEST_REJECTED,
            Self::HeaderDecodeError => H3_QPACK_DECOMPRESSION_FAILED,
            _ => H3_GENERAL_PROTOCOL_ERROR,
        }
    }
}

/// An error surfaced to transaction handlers and session callbacks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HttpException {
    pub kind: ErrorKind,
    pub message: String,
}

impl HttpException {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn stream_unacknowledged(id: StreamId) -> Self {
        Self::new(
            ErrorKind::StreamUnacknowledged,
            format!("StreamUnacknowledged on transaction id: {id}"),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unacknowledged_message() {
        let err = HttpException::stream_unacknowledged(StreamId(12));
        assert_eq!(err.kind(), ErrorKind::StreamUnacknowledged);
        assert_eq!(err.to_string(), "StreamUnacknowledged on transaction id: 12");
    }
}
