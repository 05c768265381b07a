use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    rc::{Rc, Weak},
};

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;

use crate::{
    control::{ControlEvent, ControlPlane},
    dispatch::{DispatchEvent, Dispatcher},
    error::{ErrorKind, HttpException},
    executor::{Executor, TimerHandle},
    handler::{ConnectCallback, InfoCallback, SessionObserver, TransactionHandler},
    message::HttpMessage,
    proto::error::{H3_NO_ERROR, H3_REQUEST_CANCELLED, H3_STREAM_CREATION_ERROR},
    proto::headers::{self, DecoderInstruction},
    proto::{encode_frame, split_frame, Frame, Settings, StreamType, VarInt},
    push::{PushCoordinator, PushId, PushOutcome},
    qpack::{QpackGate, SectionOutcome},
    quic::{QuicSocket, StreamId, TransportError, GIVEUP_ZERO_RTT, IDLE_TIMEOUT},
    transaction::{IngressState, Transaction, TxnState},
};

// Locally-initiated unidirectional streams, allocated in order at connect.
const CONTROL_STREAM_ID: StreamId = StreamId(2);
const QPACK_ENCODER_STREAM_ID: StreamId = StreamId(6);
const QPACK_DECODER_STREAM_ID: StreamId = StreamId(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Emit SETTINGS (and MAX_PUSH_ID) right after the transport is ready.
    pub send_settings: bool,
    /// How long a header block may stay blocked on QPACK table state.
    pub qpack_blocked_timeout_ms: u64,
    /// How long a push promise or push stream may wait for its other half.
    pub push_timeout_ms: u64,
    /// Delay between the draining GOAWAY(MAX) and the final GOAWAY.
    pub drain_goaway_delay_ms: u64,
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    pub max_field_section_size: u64,
    pub max_push_id: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_settings: true,
            qpack_blocked_timeout_ms: 500,
            push_timeout_ms: 500,
            drain_goaway_delay_ms: 50,
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 100,
            max_field_section_size: 16384,
            max_push_id: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Open,
    Draining,
    Closed,
}

/// A callback staged for delivery. Handlers are only ever invoked while the
/// session state is unborrowed, so they may reenter freely.
pub(crate) enum Event {
    Headers { id: StreamId, msg: HttpMessage },
    Body { id: StreamId, chunk: Bytes },
    BodyWithOffset { id: StreamId, offset: u64, chunk: Bytes },
    BodySkipped { id: StreamId, offset: u64 },
    Trailers { id: StreamId, trailers: HeaderMap },
    Eom { id: StreamId },
    Goaway { id: StreamId, last: StreamId },
    Error { id: StreamId, error: HttpException },
    Pushed { parent: StreamId, child: StreamId },
    Detach { id: StreamId },
    ConnectSuccess,
    ConnectError { error: HttpException },
    ReplaySafe,
    Destroy,
    Observe { observation: Observation },
}

pub(crate) enum Observation {
    NascentBegin { stream: StreamId, eof: bool },
    Nascent { stream: StreamId, push_id: PushId, eof: bool },
    NascentEof { stream: StreamId, push_id: Option<PushId> },
    OrphanedNascent { stream: StreamId, push_id: Option<PushId> },
    PromiseBegin { parent: StreamId, push_id: PushId },
    Promise { parent: StreamId, push_id: PushId },
    HalfOpen { parent: StreamId, push_id: PushId },
    PushedTxn { push_id: PushId, stream: StreamId },
    PushedTxnTimeout { push_id: PushId },
    OrphanedHalfOpen { push_id: PushId },
}

// Events that pause_ingress holds back, and that an abort throws away.
// Detach rides along so a paused transaction cannot detach ahead of its
// deferred events; an abort never has a staged Detach to discard.
fn pausable_stream(event: &Event) -> Option<StreamId> {
    match event {
        Event::Headers { id, .. }
        | Event::Body { id, .. }
        | Event::BodyWithOffset { id, .. }
        | Event::BodySkipped { id, .. }
        | Event::Trailers { id, .. }
        | Event::Eom { id }
        | Event::Detach { id } => Some(*id),
        _ => None,
    }
}

pub(crate) struct Shared {
    pub(crate) state: RefCell<State>,
    dispatching: Cell<bool>,
}

pub(crate) struct State {
    config: SessionConfig,
    executor: Executor,
    socket: Box<dyn QuicSocket>,
    lifecycle: Lifecycle,

    queue: VecDeque<Event>,
    txns: BTreeMap<StreamId, TxnState>,

    control: ControlPlane,
    dispatcher: Dispatcher,
    qpack: QpackGate,
    push: PushCoordinator,

    connect_cb: Option<Rc<RefCell<dyn ConnectCallback>>>,
    connect_fired: bool,
    info_cb: Option<Rc<RefCell<dyn InfoCallback>>>,
    destroy_staged: bool,
    observer: Option<Rc<RefCell<dyn SessionObserver>>>,

    replay_safe: bool,
    replay_callbacks: Vec<Rc<dyn Fn()>>,

    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,

    next_request_stream: StreamId,
    max_seen_push_stream: Option<StreamId>,
    peer_decoder_buf: BytesMut,
    drain_timer: Option<TimerHandle>,
}

impl State {
    fn stage(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    fn stage_observe(&mut self, observation: Observation) {
        if self.observer.is_some() {
            self.queue.push_back(Event::Observe { observation });
        }
    }
}

/// The client side of one HTTP/3 connection: opens request streams,
/// multiplexes transactions, drives the control and QPACK streams, and
/// correlates server push.
///
/// Single-threaded by construction; QUIC events, timers, and application
/// calls must all happen on the thread that owns the [`Executor`].
pub struct Session {
    shared: SessionRef,
}

impl Session {
    pub fn new(socket: Box<dyn QuicSocket>, config: SessionConfig, executor: Executor) -> Self {
        let qpack = QpackGate::new(config.qpack_max_table_capacity);
        let push = PushCoordinator::new(config.max_push_id);

        let state = State {
            config,
            executor,
            socket,
            lifecycle: Lifecycle::Connecting,
            queue: VecDeque::new(),
            txns: BTreeMap::new(),
            control: ControlPlane::new(),
            dispatcher: Dispatcher::new(),
            qpack,
            push,
            connect_cb: None,
            connect_fired: false,
            info_cb: None,
            destroy_staged: false,
            observer: None,
            replay_safe: false,
            replay_callbacks: Vec::new(),
            local_addr: None,
            peer_addr: None,
            next_request_stream: StreamId(0),
            max_seen_push_stream: None,
            peer_decoder_buf: BytesMut::new(),
            drain_timer: None,
        };

        Self {
            shared: SessionRef(Rc::new(Shared {
                state: RefCell::new(state),
                dispatching: Cell::new(false),
            })),
        }
    }

    pub fn set_connect_callback(&self, callback: Rc<RefCell<dyn ConnectCallback>>) {
        self.shared.0.state.borrow_mut().connect_cb = Some(callback);
    }

    pub fn set_info_callback(&self, callback: Rc<RefCell<dyn InfoCallback>>) {
        self.shared.0.state.borrow_mut().info_cb = Some(callback);
    }

    pub fn set_observer(&self, observer: Rc<RefCell<dyn SessionObserver>>) {
        self.shared.0.state.borrow_mut().observer = Some(observer);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.0.state.borrow().lifecycle
    }

    pub fn peer_settings(&self) -> Option<Settings> {
        self.shared.0.state.borrow().control.peer_settings.clone()
    }

    pub fn peer_goaway(&self) -> Option<StreamId> {
        self.shared.0.state.borrow().control.peer_goaway
    }

    pub fn num_transactions(&self) -> usize {
        self.shared.0.state.borrow().txns.len()
    }

    /// Snapshotted when the transport becomes ready; stays readable after
    /// the connection is dropped.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.shared.0.state.borrow().local_addr
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.shared.0.state.borrow().peer_addr
    }

    /// Open a new request transaction. Returns `None` unless the session is
    /// open and the transport is healthy.
    pub fn new_transaction(
        &self,
        handler: Rc<RefCell<dyn TransactionHandler>>,
    ) -> Option<Transaction> {
        self.new_transaction_inner(handler, false)
    }

    /// Like [`Session::new_transaction`], with partially reliable body
    /// transport: the response body is unframed and may be skipped by the
    /// peer or rejected by us at arbitrary offsets.
    pub fn new_partially_reliable_transaction(
        &self,
        handler: Rc<RefCell<dyn TransactionHandler>>,
    ) -> Option<Transaction> {
        self.new_transaction_inner(handler, true)
    }

    fn new_transaction_inner(
        &self,
        handler: Rc<RefCell<dyn TransactionHandler>>,
        partially_reliable: bool,
    ) -> Option<Transaction> {
        self.shared.enter(|shared, state| {
            if state.lifecycle != Lifecycle::Open || !state.socket.good() {
                return None;
            }

            let id = state.next_request_stream;
            state.next_request_stream = id.next();

            let mut txn = TxnState::new(id, Some(handler));
            txn.partially_reliable = partially_reliable;
            state.txns.insert(id, txn);

            log::debug!("new transaction on stream {id}");
            Some(Transaction {
                shared: shared.downgrade(),
                id,
            })
        })
    }

    /// Start draining: no new transactions, GOAWAY(MAX) now, the final
    /// GOAWAY shortly after, close once the last transaction detaches.
    pub fn close_when_idle(&self) {
        self.shared.enter(|shared, state| match state.lifecycle {
            Lifecycle::Open => {
                log::debug!("draining session");
                state.lifecycle = Lifecycle::Draining;
                let frame = ControlPlane::goaway_frame(VarInt::MAX);
                write_control(state, &frame);

                let weak = shared.downgrade();
                let delay = state.config.drain_goaway_delay_ms;
                state.drain_timer = Some(state.executor.schedule_delayed(delay, move || {
                    if let Some(shared) = weak.upgrade() {
                        SessionRef(shared).send_final_goaway();
                    }
                }));

                check_drain_complete(state);
            }
            Lifecycle::Draining => check_drain_complete(state),
            _ => {}
        })
    }

    /// Synchronously tear everything down. Every live transaction fails
    /// with `Shutdown` and `on_destroy` fires before this returns.
    pub fn drop_connection(&self) {
        self.shared.enter(|_, state| {
            if state.lifecycle == Lifecycle::Closed && state.destroy_staged {
                return;
            }
            log::debug!("dropping connection");
            state.socket.close(H3_NO_ERROR, b"dropped");
            teardown(
                state,
                HttpException::new(ErrorKind::Shutdown, "connection dropped"),
            );
        })
    }

    /// Queue a callback for when 0-RTT data stops being replayable. Fires
    /// immediately if the transport is already replay-safe.
    pub fn add_waiting_for_replay_safety(&self, callback: Rc<dyn Fn()>) {
        let safe = self.shared.0.state.borrow().replay_safe;
        if safe {
            callback();
            return;
        }
        self.shared.0.state.borrow_mut().replay_callbacks.push(callback);
    }

    /// Cancel a queued replay-safety callback, by identity.
    pub fn remove_waiting_for_replay_safety(&self, callback: &Rc<dyn Fn()>) {
        self.shared
            .0
            .state
            .borrow_mut()
            .replay_callbacks
            .retain(|cb| !Rc::ptr_eq(cb, callback));
    }

    // ---- Transport event entry points ----

    pub fn on_transport_ready(&self) {
        self.shared.enter(|_, state| {
            if state.lifecycle != Lifecycle::Connecting {
                return;
            }

            state.local_addr = Some(state.socket.local_address());
            state.peer_addr = Some(state.socket.peer_address());
            state.lifecycle = Lifecycle::Open;
            log::debug!(
                "transport ready, alpn {:?}",
                String::from_utf8_lossy(&state.socket.app_protocol())
            );

            // The control stream and SETTINGS go out before anything else.
            if state.config.send_settings {
                ensure_control_egress(state);
                let frame = state.control.settings_frame(&state.config);
                write_control(state, &frame);

                let mut preface = Vec::new();
                StreamType::QpackEncoder.encode(&mut preface);
                if let Err(e) = state.socket.write(QPACK_ENCODER_STREAM_ID, &preface, false) {
                    log::warn!("qpack encoder stream open failed: {e}");
                }
            }

            state.connect_fired = true;
            state.stage(Event::ConnectSuccess);
        })
    }

    pub fn on_replay_safe(&self) {
        self.shared.enter(|_, state| {
            if state.replay_safe {
                return;
            }
            state.replay_safe = true;
            state.stage(Event::ReplaySafe);
        })
    }

    pub fn on_read_data(&self, id: StreamId, data: &[u8], eof: bool) {
        self.shared.enter(|shared, state| {
            if state.lifecycle == Lifecycle::Closed {
                return;
            }

            if id.is_bidi() {
                if id.is_server_initiated() {
                    connection_error(
                        state,
                        HttpException::new(
                            ErrorKind::UnexpectedFrame,
                            format!("server-initiated bidirectional stream {id}"),
                        ),
                    );
                    return;
                }
                feed_txn(shared, state, id, data, eof);
            } else if id.is_server_initiated() {
                if state.txns.contains_key(&id) {
                    // An adopted push stream.
                    feed_txn(shared, state, id, data, eof);
                } else {
                    match state.dispatcher.on_data(id, data, eof) {
                        Ok(events) => {
                            for event in events {
                                if let Err(e) = handle_dispatch_event(shared, state, event) {
                                    connection_error(state, e);
                                    return;
                                }
                            }
                        }
                        Err(e) => connection_error(state, e),
                    }
                }
            } else {
                log::trace!("ignoring data on locally-initiated unidirectional stream {id}");
            }
        })
    }

    pub fn on_reset(&self, id: StreamId, error_code: u64) {
        self.shared.enter(|shared, state| {
            log::debug!("peer reset stream {id} with code {error_code:#x}");
            if state.txns.contains_key(&id) {
                abort_txn(
                    shared,
                    state,
                    id,
                    Some(HttpException::stream_unacknowledged(id)),
                );
            } else {
                state.dispatcher.remove(id);
            }
        })
    }

    pub fn on_stop_sending(&self, id: StreamId, error_code: u64) {
        self.shared.enter(|shared, state| {
            log::debug!("peer stop_sending on stream {id} with code {error_code:#x}");
            if state.txns.contains_key(&id) {
                abort_txn(
                    shared,
                    state,
                    id,
                    Some(HttpException::stream_unacknowledged(id)),
                );
            }
        })
    }

    pub fn on_delivery_ack(&self, id: StreamId, offset: u64) {
        self.shared.enter(|_, state| {
            log::trace!("delivery ack on stream {id} offset {offset}");
            if let Some(txn) = state.txns.get_mut(&id) {
                txn.pending_byte_events = txn.pending_byte_events.saturating_sub(1);
                check_detach(state, id);
            }
        })
    }

    pub fn on_delivery_cancelled(&self, id: StreamId, offset: u64) {
        self.shared.enter(|_, state| {
            log::trace!("delivery cancelled on stream {id} offset {offset}");
            if let Some(txn) = state.txns.get_mut(&id) {
                txn.pending_byte_events = txn.pending_byte_events.saturating_sub(1);
                check_detach(state, id);
            }
        })
    }

    /// Peer-driven partial reliability: data before `new_offset` (a stream
    /// offset) will never arrive.
    pub fn on_data_expired(&self, id: StreamId, new_offset: u64) {
        self.shared.enter(|_, state| {
            let Some(txn) = state.txns.get_mut(&id) else {
                return;
            };
            if !txn.partially_reliable {
                log::warn!("ignoring expired data on reliable stream {id}");
                return;
            }
            let Some(body_start) = txn.pr_body_start else {
                log::warn!("ignoring expired data before response body on stream {id}");
                return;
            };
            let Some(new_body_offset) = new_offset.checked_sub(body_start) else {
                log::warn!("ignoring skip into the header section on stream {id}");
                return;
            };

            if new_body_offset <= txn.next_body_offset {
                // A zero-length skip is a no-op; going backwards is a
                // corrupt peer, logged and survived.
                if new_body_offset < txn.next_body_offset {
                    log::warn!(
                        "ignoring skip to {new_body_offset}, already at {} on stream {id}",
                        txn.next_body_offset
                    );
                }
                return;
            }

            if let Some(len) = txn.content_length {
                if new_body_offset > len {
                    log::warn!("ignoring skip past content-length on stream {id}");
                    return;
                }
            }

            txn.next_body_offset = new_body_offset;
            state.stage(Event::BodySkipped {
                id,
                offset: new_body_offset,
            });
        })
    }

    /// The peer's receiver rejected our egress data up to `offset`; any
    /// delivery registration below it resolves now.
    pub fn on_data_rejected(&self, id: StreamId, offset: u64) {
        self.shared.enter(|_, state| {
            log::debug!("peer rejected egress data on stream {id} up to {offset}");
            if let Some(txn) = state.txns.get_mut(&id) {
                txn.pending_byte_events = txn.pending_byte_events.saturating_sub(1);
                check_detach(state, id);
            }
        })
    }

    pub fn on_connection_error(&self, error: TransportError) {
        self.shared.enter(|_, state| {
            let kind = match error.code {
                GIVEUP_ZERO_RTT => ErrorKind::EarlyDataFailed,
                IDLE_TIMEOUT => ErrorKind::IdleTimeout,
                _ if state.lifecycle == Lifecycle::Connecting => ErrorKind::ConnectFailed,
                _ => ErrorKind::ConnectionReset,
            };
            let message = match kind {
                ErrorKind::EarlyDataFailed => format!("early data failed: {}", error.reason),
                _ => format!("connection error: {}", error.reason),
            };
            teardown(state, HttpException::new(kind, message));
        })
    }

    pub fn on_connection_end(&self) {
        self.shared.enter(|_, state| {
            teardown(
                state,
                HttpException::new(ErrorKind::ConnectionReset, "connection ended by peer"),
            );
        })
    }
}

/// A strong handle to the shared session state; everything that needs to
/// stage-and-dispatch callbacks goes through here.
#[derive(Clone)]
pub(crate) struct SessionRef(pub(crate) Rc<Shared>);

impl SessionRef {
    fn downgrade(&self) -> Weak<Shared> {
        Rc::downgrade(&self.0)
    }

    /// Run `f` against the state, then flush every callback it staged.
    /// The outermost frame drains the queue; reentrant calls just stage.
    fn enter<R>(&self, f: impl FnOnce(&SessionRef, &mut State) -> R) -> R {
        let result = {
            let mut state = self.0.state.borrow_mut();
            f(self, &mut state)
        };
        self.dispatch();
        result
    }

    fn dispatch(&self) {
        if self.0.dispatching.get() {
            return;
        }
        self.0.dispatching.set(true);

        loop {
            let event = self.0.state.borrow_mut().queue.pop_front();
            match event {
                Some(event) => self.deliver(event),
                None => break,
            }
        }

        self.0.dispatching.set(false);
    }

    fn deliver(&self, event: Event) {
        // A paused transaction keeps its data events; a vanished one loses
        // them. A closed session has nothing left to resume, so pauses stop
        // deferring and the final errors and detaches go through.
        if let Some(id) = pausable_stream(&event) {
            let mut state = self.0.state.borrow_mut();
            let closed = state.lifecycle == Lifecycle::Closed;
            match state.txns.get_mut(&id) {
                Some(txn) if txn.paused && !closed => {
                    txn.deferred.push_back(event);
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }

        match event {
            Event::Headers { id, msg } => {
                if let Some((handler, txn)) = self.handler_for(id) {
                    handler.borrow_mut().on_headers(&txn, msg);
                }
            }
            Event::Body { id, chunk } => {
                if let Some((handler, txn)) = self.handler_for(id) {
                    handler.borrow_mut().on_body(&txn, chunk);
                }
            }
            Event::BodyWithOffset { id, offset, chunk } => {
                if let Some((handler, txn)) = self.handler_for(id) {
                    handler.borrow_mut().on_body_with_offset(&txn, offset, chunk);
                }
            }
            Event::BodySkipped { id, offset } => {
                if let Some((handler, txn)) = self.handler_for(id) {
                    handler.borrow_mut().on_body_skipped(&txn, offset);
                }
            }
            Event::Trailers { id, trailers } => {
                if let Some((handler, txn)) = self.handler_for(id) {
                    handler.borrow_mut().on_trailers(&txn, trailers);
                }
            }
            Event::Eom { id } => {
                if let Some((handler, txn)) = self.handler_for(id) {
                    handler.borrow_mut().on_eom(&txn);
                }
            }
            Event::Goaway { id, last } => {
                if let Some((handler, _)) = self.handler_for(id) {
                    handler.borrow_mut().on_goaway(last);
                }
            }
            Event::Error { id, error } => {
                if let Some((handler, txn)) = self.handler_for(id) {
                    handler.borrow_mut().on_error(&txn, error);
                }
            }
            Event::Pushed { parent, child } => {
                if let Some((handler, txn)) = self.handler_for(parent) {
                    let pushed = Transaction {
                        shared: self.downgrade(),
                        id: child,
                    };
                    handler.borrow_mut().on_pushed_transaction(&txn, pushed);
                }
            }
            Event::Detach { id } => {
                let removed = self.0.state.borrow_mut().txns.remove(&id);
                if let Some(txn) = removed {
                    log::debug!("transaction on stream {id} detached");
                    if let Some(handler) = txn.handler {
                        handler.borrow_mut().detach_transaction();
                    }
                }

                let mut state = self.0.state.borrow_mut();
                check_drain_complete(&mut state);
            }
            Event::ConnectSuccess => {
                let cb = self.0.state.borrow().connect_cb.clone();
                if let Some(cb) = cb {
                    cb.borrow_mut().connect_success();
                }
            }
            Event::ConnectError { error } => {
                let cb = self.0.state.borrow().connect_cb.clone();
                if let Some(cb) = cb {
                    cb.borrow_mut().connect_error(error);
                }
            }
            Event::ReplaySafe => {
                let (callbacks, cb) = {
                    let mut state = self.0.state.borrow_mut();
                    (
                        std::mem::take(&mut state.replay_callbacks),
                        state.connect_cb.clone(),
                    )
                };
                for callback in callbacks {
                    callback();
                }
                if let Some(cb) = cb {
                    cb.borrow_mut().on_replay_safe();
                }
            }
            Event::Destroy => {
                let cb = self.0.state.borrow_mut().info_cb.take();
                if let Some(cb) = cb {
                    cb.borrow_mut().on_destroy();
                }
            }
            Event::Observe { observation } => {
                let observer = self.0.state.borrow().observer.clone();
                let Some(observer) = observer else { return };
                let mut observer = observer.borrow_mut();
                match observation {
                    Observation::NascentBegin { stream, eof } => {
                        observer.nascent_push_stream_begin(stream, eof)
                    }
                    Observation::Nascent { stream, push_id, eof } => {
                        observer.nascent_push_stream(stream, push_id, eof)
                    }
                    Observation::NascentEof { stream, push_id } => {
                        observer.nascent_eof(stream, push_id)
                    }
                    Observation::OrphanedNascent { stream, push_id } => {
                        observer.orphaned_nascent_stream(stream, push_id)
                    }
                    Observation::PromiseBegin { parent, push_id } => {
                        observer.push_promise_begin(parent, push_id)
                    }
                    Observation::Promise { parent, push_id } => {
                        observer.push_promise(parent, push_id)
                    }
                    Observation::HalfOpen { parent, push_id } => {
                        observer.half_open_pushed_txn(parent, push_id)
                    }
                    Observation::PushedTxn { push_id, stream } => {
                        observer.pushed_txn(push_id, stream)
                    }
                    Observation::PushedTxnTimeout { push_id } => {
                        observer.pushed_txn_timeout(push_id)
                    }
                    Observation::OrphanedHalfOpen { push_id } => {
                        observer.orphaned_half_open_pushed_txn(push_id)
                    }
                }
            }
        }
    }

    fn handler_for(
        &self,
        id: StreamId,
    ) -> Option<(Rc<RefCell<dyn TransactionHandler>>, Transaction)> {
        let handler = self.0.state.borrow().txns.get(&id)?.handler.clone()?;
        let txn = Transaction {
            shared: self.downgrade(),
            id,
        };
        Some((handler, txn))
    }

    // ---- Timer entry points ----

    fn qpack_timeout(&self, id: StreamId) {
        self.enter(|shared, state| {
            let (_, cancel) = state.qpack.cancel_stream(id);
            if cancel.is_empty() {
                return; // already delivered or aborted
            }
            log::debug!("qpack blocked timeout on stream {id}");
            write_decoder_stream(state, &cancel);
            abort_txn(
                shared,
                state,
                id,
                Some(HttpException::new(
                    ErrorKind::HeaderDecodeError,
                    format!("timeout decoding blocked header section on transaction id: {id}"),
                )),
            );
        })
    }

    fn push_timeout(&self, push_id: PushId) {
        self.enter(|_, state| {
            let (promise, unmatched) = state.push.expire(push_id);

            if promise.is_some() {
                log::debug!("push promise {push_id} timed out waiting for its stream");
                state.stage_observe(Observation::PushedTxnTimeout { push_id });
                state.stage_observe(Observation::OrphanedHalfOpen { push_id });
            }

            if let Some(unmatched) = unmatched {
                log::debug!("push stream {} timed out waiting for a promise", unmatched.stream);
                let _ = state
                    .socket
                    .stop_sending(unmatched.stream, H3_REQUEST_CANCELLED);
                state.dispatcher.remove(unmatched.stream);
                state.stage_observe(Observation::OrphanedNascent {
                    stream: unmatched.stream,
                    push_id: Some(push_id),
                });
            }
        })
    }

    fn send_final_goaway(&self) {
        self.enter(|_, state| {
            if state.lifecycle != Lifecycle::Draining {
                return;
            }
            state.drain_timer = None;
            let last = state
                .max_seen_push_stream
                .map(|id| id.into_inner())
                .unwrap_or(0);
            let frame =
                ControlPlane::goaway_frame(VarInt::try_from(last).unwrap_or(VarInt::MAX));
            write_control(state, &frame);
        })
    }

    // ---- Transaction operations, called through the Transaction handle ----

    pub(crate) fn txn_alive(&self, id: StreamId) -> bool {
        self.0.state.borrow().txns.contains_key(&id)
    }

    pub(crate) fn txn_push_id(&self, id: StreamId) -> Option<PushId> {
        self.0.state.borrow().txns.get(&id)?.push_id
    }

    pub(crate) fn txn_assoc_stream(&self, id: StreamId) -> Option<StreamId> {
        self.0.state.borrow().txns.get(&id)?.assoc_stream
    }

    pub(crate) fn txn_promise(&self, id: StreamId) -> Option<HttpMessage> {
        self.0.state.borrow().txns.get(&id)?.promise.clone()
    }

    pub(crate) fn txn_set_handler(
        &self,
        id: StreamId,
        handler: Rc<RefCell<dyn TransactionHandler>>,
    ) -> Result<(), HttpException> {
        self.enter(|_, state| {
            let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;
            txn.handler = Some(handler);
            Ok(())
        })
    }

    pub(crate) fn txn_send_headers(
        &self,
        id: StreamId,
        msg: &HttpMessage,
    ) -> Result<(), HttpException> {
        self.enter(|shared, state| {
            let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;
            txn.egress_headers()?;

            let mut block = Vec::new();
            headers::encode_section(&msg.to_fields(), &mut block);

            let mut buf = Vec::new();
            encode_frame(Frame::HEADERS, &block, &mut buf);
            write_txn(shared, state, id, &buf, false)
        })
    }

    pub(crate) fn txn_send_body(&self, id: StreamId, body: &[u8]) -> Result<(), HttpException> {
        self.enter(|shared, state| {
            let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;
            txn.egress_body()?;

            let buf = if txn.partially_reliable {
                body.to_vec()
            } else {
                let mut buf = Vec::new();
                encode_frame(Frame::DATA, body, &mut buf);
                buf
            };
            write_txn(shared, state, id, &buf, false)
        })
    }

    pub(crate) fn txn_send_trailers(
        &self,
        id: StreamId,
        trailers: &HeaderMap,
    ) -> Result<(), HttpException> {
        self.enter(|shared, state| {
            let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;
            if txn.partially_reliable {
                return Err(HttpException::new(
                    ErrorKind::InvalidOperation,
                    format!("trailers on partially reliable transaction id: {id}"),
                ));
            }
            txn.egress_trailers()?;

            let fields: Vec<(String, String)> = trailers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).to_string(),
                    )
                })
                .collect();

            let mut block = Vec::new();
            headers::encode_section(&fields, &mut block);

            let mut buf = Vec::new();
            encode_frame(Frame::HEADERS, &block, &mut buf);
            write_txn(shared, state, id, &buf, false)
        })
    }

    pub(crate) fn txn_send_eom(&self, id: StreamId) -> Result<(), HttpException> {
        self.enter(|shared, state| {
            let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;
            txn.egress_eom()?;
            write_txn(shared, state, id, &[], true)?;

            // The final byte gates detach until the peer has it.
            let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;
            let offset = txn.egress_offset;
            match state.socket.register_delivery_callback(id, offset) {
                Ok(()) => txn.pending_byte_events += 1,
                Err(e) => {
                    let error = HttpException::new(
                        ErrorKind::EgressWriteError,
                        format!("failed to register delivery callback on transaction id: {id}: {e}"),
                    );
                    abort_txn(shared, state, id, Some(error.clone()));
                    return Err(error);
                }
            }

            check_detach(state, id);
            Ok(())
        })
    }

    pub(crate) fn txn_send_abort(&self, id: StreamId) {
        self.enter(|shared, state| abort_txn(shared, state, id, None))
    }

    pub(crate) fn txn_pause_ingress(&self, id: StreamId) {
        self.enter(|_, state| {
            // Nothing can be resumed on a closed session; let the final
            // events through instead of deferring them forever.
            if state.lifecycle == Lifecycle::Closed {
                return;
            }

            let State { queue, txns, .. } = state;
            let Some(txn) = txns.get_mut(&id) else { return };
            if txn.paused {
                return;
            }
            txn.paused = true;

            // Pull already-staged events for this stream back, in order.
            let mut kept = VecDeque::new();
            while let Some(event) = queue.pop_front() {
                if pausable_stream(&event) == Some(id) {
                    txn.deferred.push_back(event);
                } else {
                    kept.push_back(event);
                }
            }
            *queue = kept;
        })
    }

    pub(crate) fn txn_resume_ingress(&self, id: StreamId) {
        self.enter(|_, state| {
            let Some(txn) = state.txns.get_mut(&id) else { return };
            if !txn.paused {
                return;
            }
            txn.paused = false;
            let deferred = std::mem::take(&mut txn.deferred);
            state.queue.extend(deferred);
        })
    }

    pub(crate) fn txn_reject_body_to(
        &self,
        id: StreamId,
        new_offset: u64,
    ) -> Result<(), HttpException> {
        self.enter(|_, state| {
            let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;
            if !txn.partially_reliable {
                return Err(HttpException::new(
                    ErrorKind::InvalidOperation,
                    format!("reject on reliable transaction id: {id}"),
                ));
            }
            let Some(body_start) = txn.pr_body_start else {
                return Err(HttpException::new(
                    ErrorKind::InvalidOperation,
                    format!("reject before response body on transaction id: {id}"),
                ));
            };
            if new_offset < txn.next_body_offset {
                return Err(HttpException::new(
                    ErrorKind::InvalidOperation,
                    format!("reject offset moved backwards on transaction id: {id}"),
                ));
            }
            if new_offset == txn.next_body_offset {
                return Ok(());
            }

            state
                .socket
                .reject_data(id, body_start + new_offset)
                .map_err(|e| {
                    HttpException::new(
                        ErrorKind::InvalidOperation,
                        format!("failed to register delivery callback: {e}"),
                    )
                })?;

            txn.next_body_offset = new_offset;
            txn.ingress_buf.clear();
            Ok(())
        })
    }
}

fn detached(id: StreamId) -> HttpException {
    HttpException::new(
        ErrorKind::InvalidOperation,
        format!("transaction is detached on id: {id}"),
    )
}

// Errors from request-stream frames split by blast radius.
enum ProcError {
    Stream(HttpException),
    Conn(HttpException),
}

fn feed_txn(shared: &SessionRef, state: &mut State, id: StreamId, data: &[u8], eof: bool) {
    let Some(txn) = state.txns.get_mut(&id) else {
        log::trace!("data for unknown stream {id}");
        return;
    };
    if txn.ingress.is_terminal() {
        return;
    }

    txn.ingress_buf.extend_from_slice(data);
    txn.raw_ingress_offset += data.len() as u64;
    txn.ingress_eof |= eof;

    process_txn_ingress(shared, state, id);
}

fn process_txn_ingress(shared: &SessionRef, state: &mut State, id: StreamId) {
    loop {
        let Some(txn) = state.txns.get(&id) else { return };
        if txn.ingress.is_terminal() || txn.detach_staged {
            return;
        }
        // A blocked header section halts the stream to preserve ordering.
        if state.qpack.is_blocked(id) {
            return;
        }

        let pr_body =
            txn.partially_reliable && txn.ingress == IngressState::ExpectBody;

        let txn = state.txns.get_mut(&id).expect("checked above");
        if pr_body {
            // Unframed body bytes after the headers.
            if !txn.ingress_buf.is_empty() {
                let chunk = txn.ingress_buf.split().freeze();
                let offset = txn.next_body_offset;
                txn.next_body_offset += chunk.len() as u64;
                state.stage(Event::BodyWithOffset { id, offset, chunk });
                continue;
            }
        } else if let Some((typ, payload)) = split_frame(&mut txn.ingress_buf) {
            match handle_request_frame(shared, state, id, typ, payload) {
                Ok(()) => continue,
                Err(ProcError::Stream(error)) => {
                    abort_txn(shared, state, id, Some(error));
                    return;
                }
                Err(ProcError::Conn(error)) => {
                    connection_error(state, error);
                    return;
                }
            }
        }

        // Nothing more to parse; maybe the stream is done.
        let txn = state.txns.get_mut(&id).expect("checked above");
        if txn.ingress_eof && txn.ingress_buf.is_empty() {
            match txn.ingress {
                IngressState::ExpectBody | IngressState::ExpectEom => {
                    txn.ingress = IngressState::EomReceived;
                    state.stage(Event::Eom { id });
                    check_detach(state, id);
                }
                IngressState::ExpectHeaders => {
                    abort_txn(
                        shared,
                        state,
                        id,
                        Some(HttpException::new(
                            ErrorKind::UnexpectedFrame,
                            format!("stream ended before headers on transaction id: {id}"),
                        )),
                    );
                }
                _ => {}
            }
        }
        return;
    }
}

fn handle_request_frame(
    shared: &SessionRef,
    state: &mut State,
    id: StreamId,
    typ: Frame,
    payload: Bytes,
) -> Result<(), ProcError> {
    match typ {
        Frame::HEADERS => match state.qpack.decode_or_block(id, payload) {
            Ok(SectionOutcome::Decoded { fields, ack }) => {
                if !ack.is_empty() {
                    write_decoder_stream(state, &ack);
                }
                on_decoded_headers(state, id, fields).map_err(ProcError::Stream)
            }
            Ok(SectionOutcome::Blocked) => {
                let weak = shared.downgrade();
                let timeout = state.config.qpack_blocked_timeout_ms;
                let timer = state.executor.schedule_delayed(timeout, move || {
                    if let Some(shared) = weak.upgrade() {
                        SessionRef(shared).qpack_timeout(id);
                    }
                });
                state.qpack.arm(id, timer);
                Ok(())
            }
            Err(error) => Err(ProcError::Stream(error)),
        },
        Frame::DATA => {
            let txn = state.txns.get_mut(&id).expect("caller checked");
            match txn.ingress {
                IngressState::ExpectBody => {
                    txn.next_body_offset += payload.len() as u64;
                    state.stage(Event::Body { id, chunk: payload });
                    Ok(())
                }
                _ => Err(ProcError::Stream(HttpException::new(
                    ErrorKind::UnexpectedFrame,
                    format!("DATA frame out of order on transaction id: {id}"),
                ))),
            }
        }
        Frame::PUSH_PROMISE => handle_push_promise(shared, state, id, payload),
        Frame::SETTINGS | Frame::GOAWAY | Frame::MAX_PUSH_ID | Frame::CANCEL_PUSH => {
            Err(ProcError::Conn(HttpException::new(
                ErrorKind::UnexpectedFrame,
                format!("frame {typ:?} on request stream {id}"),
            )))
        }
        other => {
            log::trace!("ignoring unknown frame {other:?} on stream {id}");
            Ok(())
        }
    }
}

fn on_decoded_headers(
    state: &mut State,
    id: StreamId,
    fields: Vec<(String, String)>,
) -> Result<(), HttpException> {
    let txn = state.txns.get_mut(&id).ok_or_else(|| detached(id))?;

    match txn.ingress {
        IngressState::ExpectHeaders => {
            let msg = HttpMessage::from_fields(&fields).map_err(|e| {
                HttpException::new(
                    ErrorKind::HeaderDecodeError,
                    format!("malformed header section on transaction id: {id}: {e}"),
                )
            })?;

            if !msg.is_interim() {
                txn.content_length = msg
                    .header("content-length")
                    .and_then(|v| v.parse::<u64>().ok());
                txn.ingress = IngressState::ExpectBody;
                if txn.partially_reliable {
                    // Everything after this frame is unframed body.
                    txn.pr_body_start =
                        Some(txn.raw_ingress_offset - txn.ingress_buf.len() as u64);
                }
            }
            state.stage(Event::Headers { id, msg });
            Ok(())
        }
        IngressState::ExpectBody => {
            // A second header block after the body is the trailer section.
            let mut trailers = HeaderMap::new();
            for (name, value) in &fields {
                if name.starts_with(':') {
                    return Err(HttpException::new(
                        ErrorKind::HeaderDecodeError,
                        format!("pseudo header in trailers on transaction id: {id}"),
                    ));
                }
                let name: http::header::HeaderName = name.parse().map_err(|_| {
                    HttpException::new(
                        ErrorKind::HeaderDecodeError,
                        format!("bad trailer name on transaction id: {id}"),
                    )
                })?;
                let value = http::header::HeaderValue::from_str(value).map_err(|_| {
                    HttpException::new(
                        ErrorKind::HeaderDecodeError,
                        format!("bad trailer value on transaction id: {id}"),
                    )
                })?;
                trailers.append(name, value);
            }

            txn.ingress = IngressState::ExpectEom;
            state.stage(Event::Trailers { id, trailers });
            Ok(())
        }
        _ => Err(HttpException::new(
            ErrorKind::UnexpectedFrame,
            format!("header block after trailers on transaction id: {id}"),
        )),
    }
}

fn handle_push_promise(
    shared: &SessionRef,
    state: &mut State,
    id: StreamId,
    payload: Bytes,
) -> Result<(), ProcError> {
    if !id.is_bidi() {
        return Err(ProcError::Conn(HttpException::new(
            ErrorKind::UnexpectedFrame,
            format!("PUSH_PROMISE on a push stream {id}"),
        )));
    }

    let mut cursor = std::io::Cursor::new(&payload[..]);
    let push_id = VarInt::decode(&mut cursor).map_err(|e| {
        ProcError::Stream(HttpException::new(
            ErrorKind::UnexpectedFrame,
            format!("bad PUSH_PROMISE on transaction id: {id}: {e}"),
        ))
    })?;
    let push_id = PushId(push_id.into_inner());
    let block = payload.slice(cursor.position() as usize..);

    state.stage_observe(Observation::PromiseBegin {
        parent: id,
        push_id,
    });

    let fields = state
        .qpack
        .decode_immediate(id, &block)
        .map_err(ProcError::Stream)?;
    let msg = HttpMessage::from_fields(&fields).map_err(|e| {
        ProcError::Stream(HttpException::new(
            ErrorKind::HeaderDecodeError,
            format!("malformed push promise on transaction id: {id}: {e}"),
        ))
    })?;

    log::debug!("push promise {push_id} on stream {id}");
    let outcome = state
        .push
        .on_promise(push_id, id, msg)
        .map_err(ProcError::Conn)?;
    state.stage_observe(Observation::Promise {
        parent: id,
        push_id,
    });

    match outcome {
        PushOutcome::HalfOpen => {
            state.stage_observe(Observation::HalfOpen {
                parent: id,
                push_id,
            });
            arm_push_timer(shared, state, push_id);
        }
        PushOutcome::Materialize {
            parent,
            msg,
            stream,
        } => materialize_push(shared, state, push_id, parent, msg, stream),
        PushOutcome::Orphan => unreachable!("promises cannot be orphans"),
    }

    Ok(())
}

fn arm_push_timer(shared: &SessionRef, state: &mut State, push_id: PushId) {
    let weak = shared.downgrade();
    let delay = state.config.push_timeout_ms;
    let timer = state.executor.schedule_delayed(delay, move || {
        if let Some(shared) = weak.upgrade() {
            SessionRef(shared).push_timeout(push_id);
        }
    });
    state.push.arm(push_id, timer);
}

fn materialize_push(
    shared: &SessionRef,
    state: &mut State,
    push_id: PushId,
    parent: StreamId,
    promise: HttpMessage,
    stream: StreamId,
) {
    let (buf, eof) = state.dispatcher.adopt(stream).unwrap_or_default();

    let mut txn = TxnState::new_pushed(stream, push_id, parent);
    txn.promise = Some(promise);
    txn.raw_ingress_offset = buf.len() as u64;
    txn.ingress_buf = buf;
    txn.ingress_eof = eof;
    state.txns.insert(stream, txn);

    log::debug!("pushed transaction materialized: push id {push_id}, stream {stream}");
    state.stage_observe(Observation::PushedTxn { push_id, stream });
    state.stage(Event::Pushed {
        parent,
        child: stream,
    });

    process_txn_ingress(shared, state, stream);
}

fn handle_dispatch_event(
    shared: &SessionRef,
    state: &mut State,
    event: DispatchEvent,
) -> Result<(), HttpException> {
    match event {
        DispatchEvent::ControlBound { id } => state.control.bind_ingress(id),
        DispatchEvent::ControlData { data } => {
            let events = state.control.on_ingress(&data)?;
            for event in events {
                handle_control_event(shared, state, event)?;
            }
            Ok(())
        }
        DispatchEvent::EncoderData { data } => {
            let unblocked = state.qpack.on_encoder_data(&data)?;
            for section in unblocked {
                if let Some(timer) = section.timer {
                    state.executor.cancel(timer);
                }
                if !section.ack.is_empty() {
                    write_decoder_stream(state, &section.ack);
                }
                match section.result {
                    Ok(fields) => {
                        if let Err(e) = on_decoded_headers(state, section.stream, fields) {
                            abort_txn(shared, state, section.stream, Some(e));
                            continue;
                        }
                        process_txn_ingress(shared, state, section.stream);
                    }
                    Err(e) => abort_txn(shared, state, section.stream, Some(e)),
                }
            }
            Ok(())
        }
        DispatchEvent::DecoderData { data } => {
            // The peer acking or cancelling sections of our encoder, which
            // never uses the dynamic table; parse and log.
            state.peer_decoder_buf.extend_from_slice(&data);
            loop {
                let mut cursor = std::io::Cursor::new(&state.peer_decoder_buf[..]);
                match DecoderInstruction::decode(&mut cursor) {
                    Ok(instruction) => {
                        let consumed = cursor.position() as usize;
                        state.peer_decoder_buf.advance(consumed);
                        log::trace!("peer decoder instruction: {instruction:?}");
                    }
                    Err(_) => break,
                }
            }
            Ok(())
        }
        DispatchEvent::PushBegin { id, eof } => {
            state.stage_observe(Observation::NascentBegin { stream: id, eof });
            Ok(())
        }
        DispatchEvent::PushIdentified { id, push_id, eof } => {
            state.stage_observe(Observation::Nascent {
                stream: id,
                push_id,
                eof,
            });
            if state.max_seen_push_stream.map_or(true, |max| id > max) {
                state.max_seen_push_stream = Some(id);
            }

            match state.push.on_stream(push_id, id)? {
                PushOutcome::Orphan => {
                    arm_push_timer(shared, state, push_id);
                    if eof {
                        state.stage_observe(Observation::NascentEof {
                            stream: id,
                            push_id: Some(push_id),
                        });
                    }
                }
                PushOutcome::Materialize {
                    parent,
                    msg,
                    stream,
                } => materialize_push(shared, state, push_id, parent, msg, stream),
                PushOutcome::HalfOpen => unreachable!("streams cannot be half-open"),
            }
            Ok(())
        }
        DispatchEvent::PushEof { id, push_id } => {
            state.stage_observe(Observation::NascentEof { stream: id, push_id });
            if push_id.is_none() {
                // The stream died inside its push id; nothing can adopt it.
                state.stage_observe(Observation::OrphanedNascent {
                    stream: id,
                    push_id: None,
                });
            }
            Ok(())
        }
        DispatchEvent::UnknownStream { id, typ } => {
            log::debug!("resetting unknown unidirectional stream {id}, type {typ:?}");
            let _ = state.socket.stop_sending(id, H3_STREAM_CREATION_ERROR);
            Ok(())
        }
    }
}

fn handle_control_event(
    shared: &SessionRef,
    state: &mut State,
    event: ControlEvent,
) -> Result<(), HttpException> {
    match event {
        ControlEvent::Settings(settings) => {
            log::debug!(
                "peer qpack table capacity {}, blocked streams {}",
                settings.qpack_max_table_capacity(),
                settings.qpack_blocked_streams()
            );
            Ok(())
        }
        ControlEvent::Goaway(last) => {
            handle_goaway(shared, state, last);
            Ok(())
        }
        ControlEvent::CancelPush(push_id) => {
            log::debug!("peer cancelled push {push_id}");
            let (promise, unmatched) = state.push.cancel(push_id);
            if let Some(promise) = promise {
                if let Some(timer) = promise.timer {
                    state.executor.cancel(timer);
                }
                state.stage_observe(Observation::OrphanedHalfOpen { push_id });
            }
            if let Some(unmatched) = unmatched {
                if let Some(timer) = unmatched.timer {
                    state.executor.cancel(timer);
                }
                let _ = state
                    .socket
                    .stop_sending(unmatched.stream, H3_REQUEST_CANCELLED);
                state.dispatcher.remove(unmatched.stream);
                state.stage_observe(Observation::OrphanedNascent {
                    stream: unmatched.stream,
                    push_id: Some(push_id),
                });
            }
            Ok(())
        }
    }
}

fn handle_goaway(shared: &SessionRef, state: &mut State, last: StreamId) {
    // Once per received frame, to every live transaction.
    let ids: Vec<StreamId> = state.txns.keys().copied().collect();
    for id in &ids {
        state.stage(Event::Goaway { id: *id, last });
    }

    if state.lifecycle == Lifecycle::Open {
        state.lifecycle = Lifecycle::Draining;
    }

    // Request streams beyond the cutoff will never be served.
    for id in ids {
        if id.is_bidi() && id.is_client_initiated() && id > last {
            abort_txn(
                shared,
                state,
                id,
                Some(HttpException::stream_unacknowledged(id)),
            );
        }
    }

    check_drain_complete(state);
}

fn write_txn(
    shared: &SessionRef,
    state: &mut State,
    id: StreamId,
    data: &[u8],
    eof: bool,
) -> Result<(), HttpException> {
    match state.socket.write(id, data, eof) {
        Ok(()) => {
            if let Some(txn) = state.txns.get_mut(&id) {
                txn.egress_offset += data.len() as u64;
            }
            Ok(())
        }
        Err(e) => {
            let error = HttpException::new(
                ErrorKind::EgressWriteError,
                format!("quic write error on transaction id: {id}: {e}"),
            );
            abort_txn(shared, state, id, Some(error.clone()));
            Err(error)
        }
    }
}

/// Abort a transaction. With an error, the handler sees exactly one
/// `on_error` then `detach_transaction`; without, just the detach.
fn abort_txn(shared: &SessionRef, state: &mut State, id: StreamId, error: Option<HttpException>) {
    {
        let Some(txn) = state.txns.get_mut(&id) else { return };
        if txn.detach_staged {
            return;
        }
        txn.abort();
    }

    purge_txn_events(state, id);
    try_reset(shared, state, id, H3_REQUEST_CANCELLED);
    if id.is_server_initiated() || id.is_bidi() {
        let _ = state.socket.stop_sending(id, H3_REQUEST_CANCELLED);
    }

    // A header section still waiting on the table is cancelled, not delivered.
    let (timer, cancel) = state.qpack.cancel_stream(id);
    if let Some(timer) = timer {
        state.executor.cancel(timer);
    }
    if !cancel.is_empty() {
        write_decoder_stream(state, &cancel);
    }

    if let Some(error) = error {
        log::debug!("transaction on stream {id} failed: {error}");
        state.stage(Event::Error { id, error });
    }

    let txn = state.txns.get_mut(&id).expect("checked above");
    txn.detach_staged = true;
    state.stage(Event::Detach { id });
}

// The reset may be deferred by backpressure; retry once on the next pass.
fn try_reset(shared: &SessionRef, state: &mut State, id: StreamId, code: u64) {
    if !id.is_bidi() {
        return; // no send half to reset on a push stream
    }
    let Some(txn) = state.txns.get_mut(&id) else { return };
    if txn.reset_sent {
        return;
    }

    match state.socket.reset_stream(id, code) {
        Ok(()) => txn.reset_sent = true,
        Err(e) => {
            log::debug!("reset deferred on stream {id}: {e}");
            let weak = shared.downgrade();
            state.executor.schedule(move || {
                if let Some(shared) = weak.upgrade() {
                    SessionRef(shared).enter(|_, state| {
                        let _ = state.socket.reset_stream(id, code);
                    });
                }
            });
        }
    }
}

fn purge_txn_events(state: &mut State, id: StreamId) {
    state.queue.retain(|event| match event {
        Event::Pushed { parent, .. } => *parent != id,
        event => pausable_stream(event) != Some(id),
    });
}

fn check_detach(state: &mut State, id: StreamId) {
    let Some(txn) = state.txns.get_mut(&id) else { return };
    if txn.detach_staged || !txn.is_terminal() || txn.pending_byte_events > 0 {
        return;
    }
    txn.detach_staged = true;
    state.stage(Event::Detach { id });
}

fn check_drain_complete(state: &mut State) {
    if state.lifecycle != Lifecycle::Draining || !state.txns.is_empty() {
        return;
    }

    log::debug!("drain complete, closing connection");
    state.socket.close(H3_NO_ERROR, b"");
    state.lifecycle = Lifecycle::Closed;
    cancel_all_timers(state);
    if !state.destroy_staged {
        state.destroy_staged = true;
        state.stage(Event::Destroy);
    }
}

fn connection_error(state: &mut State, error: HttpException) {
    if state.lifecycle == Lifecycle::Closed {
        return;
    }
    log::warn!("connection error: {error}");
    state
        .socket
        .close(error.kind().wire_code(), error.to_string().as_bytes());
    teardown(state, error);
}

/// Fail every live transaction (ascending stream id), cancel all timers,
/// and stage destruction. Idempotent.
fn teardown(state: &mut State, error: HttpException) {
    if state.lifecycle == Lifecycle::Closed && state.destroy_staged {
        return;
    }

    if state.lifecycle == Lifecycle::Connecting && !state.connect_fired {
        state.connect_fired = true;
        let connect_error = if error.kind() == ErrorKind::Shutdown {
            HttpException::new(ErrorKind::ConnectFailed, error.to_string())
        } else {
            error.clone()
        };
        state.stage(Event::ConnectError {
            error: connect_error,
        });
    }

    state.lifecycle = Lifecycle::Closed;

    let ids: Vec<StreamId> = state.txns.keys().copied().collect();
    for id in ids {
        let already_staged = match state.txns.get_mut(&id) {
            Some(txn) if !txn.detach_staged => {
                txn.abort();
                txn.detach_staged = true;
                false
            }
            _ => true,
        };
        if already_staged {
            continue;
        }

        purge_txn_events(state, id);
        state.stage(Event::Error {
            id,
            error: error.clone(),
        });
        state.stage(Event::Detach { id });
    }

    // Push streams still waiting on a promise die with the connection.
    for (stream, push_id) in state.dispatcher.nascent_push_streams() {
        let _ = state.socket.stop_sending(stream, H3_REQUEST_CANCELLED);
        state.dispatcher.remove(stream);
        state.stage_observe(Observation::OrphanedNascent { stream, push_id });
    }

    cancel_all_timers(state);
    if !state.destroy_staged {
        state.destroy_staged = true;
        state.stage(Event::Destroy);
    }
}

fn cancel_all_timers(state: &mut State) {
    for timer in state.qpack.take_timers() {
        state.executor.cancel(timer);
    }

    let (promises, streams) = state.push.drain();
    for (_, promise) in promises {
        if let Some(timer) = promise.timer {
            state.executor.cancel(timer);
        }
    }
    for (_, unmatched) in streams {
        if let Some(timer) = unmatched.timer {
            state.executor.cancel(timer);
        }
    }

    if let Some(timer) = state.drain_timer.take() {
        state.executor.cancel(timer);
    }
}

fn ensure_control_egress(state: &mut State) {
    if state.control.egress_stream.is_some() {
        return;
    }
    state.control.egress_stream = Some(CONTROL_STREAM_ID);
    if let Err(e) = state
        .socket
        .write(CONTROL_STREAM_ID, &ControlPlane::preface(), false)
    {
        log::warn!("control stream open failed: {e}");
    }
}

fn write_control(state: &mut State, data: &[u8]) {
    ensure_control_egress(state);
    if let Err(e) = state.socket.write(CONTROL_STREAM_ID, data, false) {
        log::warn!("control stream write failed: {e}");
    }
}

fn write_decoder_stream(state: &mut State, data: &[u8]) {
    if let Err(e) = state.socket.write(QPACK_DECODER_STREAM_ID, data, false) {
        log::warn!("qpack decoder stream write failed: {e}");
    }
}
