use bytes::Bytes;
use http::HeaderMap;

use crate::{
    error::HttpException, message::HttpMessage, push::PushId, quic::StreamId,
    transaction::Transaction,
};

/// The application-facing side of one request/response exchange.
///
/// The session holds the handler behind a shared cell and drops its
/// reference after `detach_transaction`, which fires exactly once.
pub trait TransactionHandler {
    fn on_headers(&mut self, txn: &Transaction, msg: HttpMessage);

    fn on_body(&mut self, txn: &Transaction, chunk: Bytes);

    /// Body delivery in partially-reliable mode, where the offset may jump.
    fn on_body_with_offset(&mut self, txn: &Transaction, offset: u64, chunk: Bytes) {
        let _ = offset;
        self.on_body(txn, chunk);
    }

    /// The peer declared it will never send body bytes before `offset`.
    fn on_body_skipped(&mut self, txn: &Transaction, offset: u64) {
        let _ = (txn, offset);
    }

    fn on_trailers(&mut self, txn: &Transaction, trailers: HeaderMap) {
        let _ = (txn, trailers);
    }

    fn on_eom(&mut self, txn: &Transaction);

    fn on_error(&mut self, txn: &Transaction, error: HttpException);

    fn on_goaway(&mut self, last_id: StreamId) {
        let _ = last_id;
    }

    /// A fully materialized pushed transaction, parented to this one.
    /// Call [`Transaction::set_handler`] on the child to receive its events.
    fn on_pushed_transaction(&mut self, txn: &Transaction, pushed: Transaction) {
        let _ = (txn, pushed);
    }

    fn detach_transaction(&mut self);
}

/// Scoped to the Connecting state; exactly one of the first two fires.
pub trait ConnectCallback {
    fn connect_success(&mut self);

    fn connect_error(&mut self, error: HttpException);

    fn on_replay_safe(&mut self) {}
}

/// Session-level notifications.
pub trait InfoCallback {
    /// Fires exactly once, on the call stack that destroyed the session.
    fn on_destroy(&mut self);
}

/// Lifecycle observations for telemetry and tests. All optional.
pub trait SessionObserver {
    fn nascent_push_stream_begin(&mut self, stream: StreamId, eof: bool) {
        let _ = (stream, eof);
    }

    fn nascent_push_stream(&mut self, stream: StreamId, push_id: PushId, eof: bool) {
        let _ = (stream, push_id, eof);
    }

    fn nascent_eof(&mut self, stream: StreamId, push_id: Option<PushId>) {
        let _ = (stream, push_id);
    }

    fn orphaned_nascent_stream(&mut self, stream: StreamId, push_id: Option<PushId>) {
        let _ = (stream, push_id);
    }

    fn push_promise_begin(&mut self, parent: StreamId, push_id: PushId) {
        let _ = (parent, push_id);
    }

    fn push_promise(&mut self, parent: StreamId, push_id: PushId) {
        let _ = (parent, push_id);
    }

    fn half_open_pushed_txn(&mut self, parent: StreamId, push_id: PushId) {
        let _ = (parent, push_id);
    }

    fn pushed_txn(&mut self, push_id: PushId, stream: StreamId) {
        let _ = (push_id, stream);
    }

    fn pushed_txn_timeout(&mut self, push_id: PushId) {
        let _ = push_id;
    }

    fn orphaned_half_open_pushed_txn(&mut self, push_id: PushId) {
        let _ = push_id;
    }
}
