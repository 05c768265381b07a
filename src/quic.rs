use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// A QUIC stream id. The two low bits encode initiator and directionality.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    pub fn is_bidi(&self) -> bool {
        self.0 & 0x2 == 0
    }

    pub fn is_uni(&self) -> bool {
        !self.is_bidi()
    }

    pub fn is_client_initiated(&self) -> bool {
        self.0 & 0x1 == 0
    }

    pub fn is_server_initiated(&self) -> bool {
        !self.is_client_initiated()
    }

    /// The next stream id with the same type bits.
    pub fn next(&self) -> StreamId {
        StreamId(self.0 + 4)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for StreamId {
    fn from(value: u64) -> Self {
        StreamId(value)
    }
}

// Transport-local error codes, distinct from the HTTP/3 application space.
pub const GIVEUP_ZERO_RTT: u64 = 0x4000_0001;
pub const IDLE_TIMEOUT: u64 = 0x4000_0002;

/// An error reported by the transport, either locally generated or received
/// from the peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transport error {code:#x}: {reason}")]
pub struct TransportError {
    pub code: u64,
    pub reason: String,
}

impl TransportError {
    pub fn new(code: u64, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// An error returned by a write-side socket operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuicError {
    #[error("stream blocked by flow control")]
    FlowControl,

    #[error("unknown stream")]
    UnknownStream,

    #[error("connection is closed")]
    Closed,

    #[error("operation not supported")]
    Unsupported,
}

/// The write half of the QUIC connection, as consumed by the session.
///
/// The read half is event-driven: the owner of the socket feeds stream data,
/// resets and delivery acks into the [`Session`](crate::Session) entry
/// points. Implementations must tolerate duplicate `reset_stream` calls.
pub trait QuicSocket {
    fn good(&self) -> bool;

    fn local_address(&self) -> SocketAddr;
    fn peer_address(&self) -> SocketAddr;
    fn app_protocol(&self) -> Vec<u8>;

    /// Write bytes to a stream, optionally finishing it.
    fn write(&mut self, id: StreamId, data: &[u8], eof: bool) -> Result<(), QuicError>;

    fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<(), QuicError>;

    fn stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<(), QuicError>;

    /// Ask for an ack once every byte up to `offset` has been delivered.
    /// The ack arrives through `Session::on_delivery_ack`.
    fn register_delivery_callback(&mut self, id: StreamId, offset: u64) -> Result<(), QuicError>;

    /// Receiver-side partial reliability: discard ingress up to `offset` and
    /// tell the peer not to (re)send it.
    fn reject_data(&mut self, id: StreamId, offset: u64) -> Result<(), QuicError>;

    fn close(&mut self, error_code: u64, reason: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        assert!(StreamId(0).is_bidi());
        assert!(StreamId(0).is_client_initiated());
        assert!(StreamId(1).is_bidi());
        assert!(StreamId(1).is_server_initiated());
        assert!(StreamId(2).is_uni());
        assert!(StreamId(2).is_client_initiated());
        assert!(StreamId(3).is_uni());
        assert!(StreamId(3).is_server_initiated());

        assert_eq!(StreamId(4).next(), StreamId(8));
    }
}
