use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

use bytes::BytesMut;
use http::HeaderMap;

use crate::{
    error::{ErrorKind, HttpException},
    handler::TransactionHandler,
    message::HttpMessage,
    push::PushId,
    quic::StreamId,
    session::{Event, SessionRef, Shared},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressState {
    /// Waiting for the final (non-1xx) header block.
    ExpectHeaders,
    ExpectBody,
    /// Trailers were delivered; only end-of-message may follow.
    ExpectEom,
    EomReceived,
    Aborted,
}

impl IngressState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EomReceived | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressState {
    Idle,
    HeadersSent,
    TrailersSent,
    EomSent,
    Aborted,
}

impl EgressState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EomSent | Self::Aborted)
    }
}

/// Internal per-transaction state, owned by the session registry.
pub(crate) struct TxnState {
    pub id: StreamId,
    pub handler: Option<Rc<RefCell<dyn TransactionHandler>>>,
    pub push_id: Option<PushId>,
    pub assoc_stream: Option<StreamId>,
    /// The promised request head, for pushed transactions.
    pub promise: Option<HttpMessage>,

    pub ingress: IngressState,
    pub egress: EgressState,
    pub headers_sent: bool,

    pub partially_reliable: bool,
    /// Wire offset where the unframed body begins, in partially reliable mode.
    pub pr_body_start: Option<u64>,
    /// The next expected body offset: bytes delivered plus bytes skipped.
    pub next_body_offset: u64,
    pub content_length: Option<u64>,

    pub ingress_buf: BytesMut,
    pub ingress_eof: bool,
    pub raw_ingress_offset: u64,

    pub paused: bool,
    pub deferred: VecDeque<Event>,

    pub egress_offset: u64,
    pub pending_byte_events: u32,
    pub reset_sent: bool,
    pub detach_staged: bool,
}

impl TxnState {
    pub fn new(id: StreamId, handler: Option<Rc<RefCell<dyn TransactionHandler>>>) -> Self {
        Self {
            id,
            handler,
            push_id: None,
            assoc_stream: None,
            promise: None,
            ingress: IngressState::ExpectHeaders,
            egress: EgressState::Idle,
            headers_sent: false,
            partially_reliable: false,
            pr_body_start: None,
            next_body_offset: 0,
            content_length: None,
            ingress_buf: BytesMut::new(),
            ingress_eof: false,
            raw_ingress_offset: 0,
            paused: false,
            deferred: VecDeque::new(),
            egress_offset: 0,
            pending_byte_events: 0,
            reset_sent: false,
            detach_staged: false,
        }
    }

    /// A pushed transaction has no egress half; it is born send-closed.
    pub fn new_pushed(
        id: StreamId,
        push_id: PushId,
        assoc_stream: StreamId,
    ) -> Self {
        let mut txn = Self::new(id, None);
        txn.push_id = Some(push_id);
        txn.assoc_stream = Some(assoc_stream);
        txn.egress = EgressState::EomSent;
        txn
    }

    pub fn is_terminal(&self) -> bool {
        self.ingress.is_terminal() && self.egress.is_terminal()
    }

    fn invalid(&self, what: &str) -> HttpException {
        HttpException::new(
            ErrorKind::InvalidOperation,
            format!("{what} in egress state {:?} on transaction id: {}", self.egress, self.id),
        )
    }

    pub fn egress_headers(&mut self) -> Result<(), HttpException> {
        match self.egress {
            EgressState::Idle => {
                self.egress = EgressState::HeadersSent;
                self.headers_sent = true;
                Ok(())
            }
            _ => Err(self.invalid("sendHeaders")),
        }
    }

    pub fn egress_body(&mut self) -> Result<(), HttpException> {
        match self.egress {
            EgressState::HeadersSent => Ok(()),
            _ => Err(self.invalid("sendBody")),
        }
    }

    pub fn egress_trailers(&mut self) -> Result<(), HttpException> {
        match self.egress {
            EgressState::HeadersSent => {
                self.egress = EgressState::TrailersSent;
                Ok(())
            }
            _ => Err(self.invalid("sendTrailers")),
        }
    }

    pub fn egress_eom(&mut self) -> Result<(), HttpException> {
        match self.egress {
            EgressState::HeadersSent | EgressState::TrailersSent => {
                debug_assert!(self.headers_sent);
                self.egress = EgressState::EomSent;
                Ok(())
            }
            _ => Err(self.invalid("sendEOM")),
        }
    }

    pub fn abort(&mut self) {
        if !self.ingress.is_terminal() {
            self.ingress = IngressState::Aborted;
        }
        if !self.egress.is_terminal() {
            self.egress = EgressState::Aborted;
        }
        self.pending_byte_events = 0;
        self.deferred.clear();
        self.ingress_buf.clear();
        // An abort overrides a pause so the error and detach go through.
        self.paused = false;
    }
}

/// A handle to one request/response exchange.
///
/// The session owns the transaction; this handle holds a weak reference and
/// every operation fails with `InvalidOperation` once the transaction has
/// detached. Handles are freely cloneable.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) shared: Weak<Shared>,
    pub(crate) id: StreamId,
}

impl Transaction {
    pub fn id(&self) -> StreamId {
        self.id
    }

    fn upgrade(&self) -> Result<SessionRef, HttpException> {
        self.shared.upgrade().map(SessionRef).ok_or_else(|| {
            HttpException::new(
                ErrorKind::InvalidOperation,
                format!("session is gone on transaction id: {}", self.id),
            )
        })
    }

    /// The push id, for pushed transactions.
    pub fn push_id(&self) -> Option<PushId> {
        self.upgrade().ok()?.txn_push_id(self.id)
    }

    /// The request stream this pushed transaction was promised on.
    pub fn associated_stream(&self) -> Option<StreamId> {
        self.upgrade().ok()?.txn_assoc_stream(self.id)
    }

    /// The request head carried by the PUSH_PROMISE, for pushed transactions.
    pub fn promised_request(&self) -> Option<HttpMessage> {
        self.upgrade().ok()?.txn_promise(self.id)
    }

    pub fn is_detached(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => !SessionRef(shared).txn_alive(self.id),
            None => true,
        }
    }

    /// Install the handler on a pushed transaction received through
    /// `on_pushed_transaction`.
    pub fn set_handler(&self, handler: Rc<RefCell<dyn TransactionHandler>>) -> Result<(), HttpException> {
        self.upgrade()?.txn_set_handler(self.id, handler)
    }

    pub fn send_headers(&self, msg: &HttpMessage) -> Result<(), HttpException> {
        self.upgrade()?.txn_send_headers(self.id, msg)
    }

    pub fn send_body(&self, body: &[u8]) -> Result<(), HttpException> {
        self.upgrade()?.txn_send_body(self.id, body)
    }

    pub fn send_trailers(&self, trailers: &HeaderMap) -> Result<(), HttpException> {
        self.upgrade()?.txn_send_trailers(self.id, trailers)
    }

    pub fn send_eom(&self) -> Result<(), HttpException> {
        self.upgrade()?.txn_send_eom(self.id)
    }

    /// Abort both directions. Idempotent; a second call has no further
    /// observable effect.
    pub fn send_abort(&self) {
        if let Ok(shared) = self.upgrade() {
            shared.txn_send_abort(self.id);
        }
    }

    /// Hold ingress callbacks (headers, body, trailers, EOM) until resumed.
    pub fn pause_ingress(&self) {
        if let Ok(shared) = self.upgrade() {
            shared.txn_pause_ingress(self.id);
        }
    }

    pub fn resume_ingress(&self) {
        if let Ok(shared) = self.upgrade() {
            shared.txn_resume_ingress(self.id);
        }
    }

    /// Receiver-side partial reliability: discard ingress body up to
    /// `new_offset` and tell the peer not to send it.
    pub fn reject_body_to(&self, new_offset: u64) -> Result<(), HttpException> {
        self.upgrade()?.txn_reject_body_to(self.id, new_offset)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn egress_transitions() {
        let mut txn = TxnState::new(StreamId(0), None);
        assert!(txn.egress_body().is_err());
        assert!(txn.egress_eom().is_err());

        txn.egress_headers().unwrap();
        assert!(txn.egress_headers().is_err());

        txn.egress_body().unwrap();
        txn.egress_trailers().unwrap();
        assert!(txn.egress_body().is_err());

        txn.egress_eom().unwrap();
        assert!(txn.egress.is_terminal());
        assert!(txn.egress_eom().is_err());
    }

    #[test]
    fn abort_is_terminal_both_ways() {
        let mut txn = TxnState::new(StreamId(4), None);
        txn.egress_headers().unwrap();
        txn.pending_byte_events = 2;

        txn.abort();
        assert_eq!(txn.ingress, IngressState::Aborted);
        assert_eq!(txn.egress, EgressState::Aborted);
        assert_eq!(txn.pending_byte_events, 0);
        assert!(txn.is_terminal());
    }

    #[test]
    fn pushed_txn_is_send_closed() {
        let txn = TxnState::new_pushed(StreamId(3), PushId(7), StreamId(0));
        assert_eq!(txn.egress, EgressState::EomSent);
        assert!(!txn.is_terminal());
    }
}
