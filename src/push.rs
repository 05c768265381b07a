use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::{
    error::{ErrorKind, HttpException},
    executor::TimerHandle,
    message::HttpMessage,
    quic::StreamId,
};

/// A server push id. Distinct from stream ids on purpose: the wire encoding
/// on a push stream is an unframed varint, and mixing the two spaces up is
/// an easy mistake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PushId(pub u64);

impl fmt::Display for PushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A PUSH_PROMISE waiting for its stream.
pub(crate) struct Promise {
    pub parent: StreamId,
    pub msg: HttpMessage,
    pub timer: Option<TimerHandle>,
}

/// A nascent push stream waiting for its promise.
pub(crate) struct UnmatchedStream {
    pub stream: StreamId,
    pub timer: Option<TimerHandle>,
}

#[derive(Debug)]
pub(crate) enum PushOutcome {
    /// Promise recorded; no stream has arrived for this id yet.
    HalfOpen,
    /// Stream recorded; no promise has arrived for this id yet.
    Orphan,
    /// Both sides are present; surface the pushed transaction.
    Materialize {
        parent: StreamId,
        msg: HttpMessage,
        stream: StreamId,
    },
}

/// Correlates PUSH_PROMISE frames with push streams by push id, in either
/// arrival order.
pub(crate) struct PushCoordinator {
    promises: HashMap<PushId, Promise>,
    streams: HashMap<PushId, UnmatchedStream>,
    adopted: HashSet<PushId>,
    max_push_id: u64,
}

impl PushCoordinator {
    pub fn new(max_push_id: u64) -> Self {
        Self {
            promises: HashMap::new(),
            streams: HashMap::new(),
            adopted: HashSet::new(),
            max_push_id,
        }
    }

    fn check_id(&self, push_id: PushId) -> Result<(), HttpException> {
        if push_id.0 > self.max_push_id {
            return Err(HttpException::new(
                ErrorKind::PushIdViolation,
                format!("push id {push_id} exceeds advertised maximum"),
            ));
        }

        if self.adopted.contains(&push_id) {
            return Err(HttpException::new(
                ErrorKind::PushIdViolation,
                format!("push id {push_id} reused"),
            ));
        }

        Ok(())
    }

    pub fn on_promise(
        &mut self,
        push_id: PushId,
        parent: StreamId,
        msg: HttpMessage,
    ) -> Result<PushOutcome, HttpException> {
        self.check_id(push_id)?;

        if self.promises.contains_key(&push_id) {
            return Err(HttpException::new(
                ErrorKind::PushIdViolation,
                format!("push id {push_id} promised twice"),
            ));
        }

        if let Some(unmatched) = self.streams.remove(&push_id) {
            self.adopted.insert(push_id);
            return Ok(PushOutcome::Materialize {
                parent,
                msg,
                stream: unmatched.stream,
            });
        }

        self.promises.insert(
            push_id,
            Promise {
                parent,
                msg,
                timer: None,
            },
        );
        Ok(PushOutcome::HalfOpen)
    }

    pub fn on_stream(
        &mut self,
        push_id: PushId,
        stream: StreamId,
    ) -> Result<PushOutcome, HttpException> {
        self.check_id(push_id)?;

        if self.streams.contains_key(&push_id) {
            return Err(HttpException::new(
                ErrorKind::PushIdViolation,
                format!("push id {push_id} bound to two streams"),
            ));
        }

        if let Some(promise) = self.promises.remove(&push_id) {
            self.adopted.insert(push_id);
            return Ok(PushOutcome::Materialize {
                parent: promise.parent,
                msg: promise.msg,
                stream,
            });
        }

        self.streams.insert(push_id, UnmatchedStream { stream, timer: None });
        Ok(PushOutcome::Orphan)
    }

    /// Attach the correlation timer for a half-open or orphan entry.
    pub fn arm(&mut self, push_id: PushId, timer: TimerHandle) {
        if let Some(promise) = self.promises.get_mut(&push_id) {
            promise.timer = Some(timer);
        } else if let Some(unmatched) = self.streams.get_mut(&push_id) {
            unmatched.timer = Some(timer);
        }
    }

    /// The timer fired: drop whichever half is still pending.
    pub fn expire(&mut self, push_id: PushId) -> (Option<Promise>, Option<UnmatchedStream>) {
        (self.promises.remove(&push_id), self.streams.remove(&push_id))
    }

    /// CANCEL_PUSH from the peer.
    pub fn cancel(&mut self, push_id: PushId) -> (Option<Promise>, Option<UnmatchedStream>) {
        self.adopted.insert(push_id);
        (self.promises.remove(&push_id), self.streams.remove(&push_id))
    }

    /// Tear everything down, returning the halves so the caller can cancel
    /// timers and reset streams.
    pub fn drain(&mut self) -> (Vec<(PushId, Promise)>, Vec<(PushId, UnmatchedStream)>) {
        (
            self.promises.drain().collect(),
            self.streams.drain().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn promise_msg() -> HttpMessage {
        HttpMessage::response(StatusCode::OK)
    }

    #[test]
    fn promise_then_stream() {
        let mut push = PushCoordinator::new(100);

        match push.on_promise(PushId(1), StreamId(0), promise_msg()).unwrap() {
            PushOutcome::HalfOpen => {}
            _ => panic!("expected half-open"),
        }

        match push.on_stream(PushId(1), StreamId(3)).unwrap() {
            PushOutcome::Materialize { parent, stream, .. } => {
                assert_eq!(parent, StreamId(0));
                assert_eq!(stream, StreamId(3));
            }
            _ => panic!("expected materialize"),
        }
    }

    #[test]
    fn stream_then_promise() {
        let mut push = PushCoordinator::new(100);

        match push.on_stream(PushId(1), StreamId(3)).unwrap() {
            PushOutcome::Orphan => {}
            _ => panic!("expected orphan"),
        }

        match push.on_promise(PushId(1), StreamId(4), promise_msg()).unwrap() {
            PushOutcome::Materialize { parent, stream, .. } => {
                assert_eq!(parent, StreamId(4));
                assert_eq!(stream, StreamId(3));
            }
            _ => panic!("expected materialize"),
        }
    }

    #[test]
    fn reuse_rejected() {
        let mut push = PushCoordinator::new(100);

        push.on_promise(PushId(1), StreamId(0), promise_msg()).unwrap();
        push.on_stream(PushId(1), StreamId(3)).unwrap();

        let err = push.on_promise(PushId(1), StreamId(4), promise_msg()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PushIdViolation);

        let err = push.on_stream(PushId(1), StreamId(7)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PushIdViolation);
    }

    #[test]
    fn max_push_id_enforced() {
        let mut push = PushCoordinator::new(5);
        let err = push.on_stream(PushId(6), StreamId(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PushIdViolation);
    }

    #[test]
    fn cancel_drops_both_halves() {
        let mut push = PushCoordinator::new(100);
        push.on_promise(PushId(2), StreamId(0), promise_msg()).unwrap();

        let (promise, stream) = push.cancel(PushId(2));
        assert!(promise.is_some());
        assert!(stream.is_none());

        // A cancelled id may not come back.
        let err = push.on_stream(PushId(2), StreamId(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PushIdViolation);
    }
}
