//! Client-side bookkeeping for in-flight operations.
//!
//! The [`Router`] maps operation ids to either a one-shot reply slot (ping,
//! privilege check) or a tracked streaming operation with its progress sink.
//! The connection's reader task feeds every incoming frame through
//! [`Router::dispatch`]; nothing else invokes sinks.
//!
//! Invariants kept here:
//! - a sink is never invoked once its operation is terminal;
//! - every registered streaming operation ends in exactly one terminal outcome
//!   unless it is abandoned before it was started;
//! - after a cancel has been sent, trailing progress frames are discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;

use netprobe_core::{ErrorClass, OperationId, OperationKind, OperationState};

use crate::protocol::{DaemonEvent, DaemonFrame};

/// Errors surfaced to callers of the operation client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("not connected to the helper daemon")]
    NotConnected,

    #[error("timed out waiting for the helper daemon")]
    Timeout,

    #[error("connection to the helper daemon was lost")]
    ConnectionLost,

    #[error("request rejected: {0}")]
    DaemonRejected(String),

    #[error("helper daemon error: {0}")]
    DaemonError(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl OperationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OperationError::NotConnected
            | OperationError::Timeout
            | OperationError::ConnectionLost => ErrorClass::Transient,
            OperationError::DaemonRejected(_) | OperationError::DaemonError(_) => {
                ErrorClass::Rejected
            }
            OperationError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Terminal result of a streaming operation: the optional final payload.
pub type Outcome = Result<Option<Vec<u8>>, OperationError>;

/// Receives the progress stream of one operation.
///
/// Runs on the connection's reader task: keep it short and non-blocking, or
/// every other operation's frames wait behind it.
pub trait ProgressSink: Send {
    fn on_progress(&mut self, data: &[u8]);

    /// Called once, after the last progress event.
    fn on_terminal(&mut self, _outcome: &Outcome) {}
}

impl<F> ProgressSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn on_progress(&mut self, data: &[u8]) {
        self(data)
    }
}

/// Sink for callers that only want the terminal outcome.
pub fn discard_progress() -> impl ProgressSink {
    |_: &[u8]| {}
}

type ReplyResult = Result<DaemonEvent, OperationError>;

struct Tracked {
    kind: OperationKind,
    state: OperationState,
    cancel_sent: bool,
    sink: Option<Box<dyn ProgressSink>>,
    done: Option<oneshot::Sender<Outcome>>,
}

impl Tracked {
    fn finish(&mut self, id: &OperationId, outcome: Outcome) -> bool {
        let next = match &outcome {
            Ok(_) => OperationState::Completed,
            Err(OperationError::Cancelled) => OperationState::Cancelled,
            Err(_) => OperationState::Failed,
        };
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        tracing::debug!(operation_id = %id, kind = %self.kind, state = ?next, "operation finished");

        if let Some(mut sink) = self.sink.take() {
            sink.on_terminal(&outcome);
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
        true
    }
}

enum Route {
    Reply(oneshot::Sender<ReplyResult>),
    Stream(Arc<Mutex<Tracked>>),
}

#[derive(Default)]
pub(crate) struct Router {
    routes: Mutex<HashMap<OperationId, Route>>,
}

impl Router {
    fn routes(&self) -> MutexGuard<'_, HashMap<OperationId, Route>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register_reply(
        &self,
        id: OperationId,
    ) -> Result<oneshot::Receiver<ReplyResult>, OperationError> {
        let mut routes = self.routes();
        if routes.contains_key(&id) {
            return Err(duplicate(&id));
        }
        let (tx, rx) = oneshot::channel();
        routes.insert(id, Route::Reply(tx));
        Ok(rx)
    }

    pub(crate) fn register_stream(
        &self,
        id: OperationId,
        kind: OperationKind,
        sink: Box<dyn ProgressSink>,
    ) -> Result<oneshot::Receiver<Outcome>, OperationError> {
        let mut routes = self.routes();
        if routes.contains_key(&id) {
            return Err(duplicate(&id));
        }
        let (tx, rx) = oneshot::channel();
        let tracked = Tracked {
            kind,
            state: OperationState::Pending,
            cancel_sent: false,
            sink: Some(sink),
            done: Some(tx),
        };
        routes.insert(id, Route::Stream(Arc::new(Mutex::new(tracked))));
        Ok(rx)
    }

    /// The start frame went out.
    pub(crate) fn mark_running(&self, id: &OperationId) {
        if let Some(tracked) = self.stream(id) {
            let mut tracked = lock(&tracked);
            if tracked.state == OperationState::Pending {
                tracked.state = OperationState::Running;
            }
        }
    }

    /// Forget an entry whose request never reached the daemon. No terminal
    /// outcome is issued.
    pub(crate) fn abandon(&self, id: &OperationId) {
        self.routes().remove(id);
    }

    /// Record that a cancel is about to be sent. `false` if no live
    /// streaming operation has this id.
    pub(crate) fn mark_cancel_sent(&self, id: &OperationId) -> bool {
        let Some(tracked) = self.stream(id) else {
            return false;
        };
        let mut tracked = lock(&tracked);
        if tracked.state.is_terminal() {
            return false;
        }
        tracked.cancel_sent = true;
        true
    }

    /// End an operation locally. `false` if it was already terminal or unknown.
    pub(crate) fn terminate(&self, id: &OperationId, error: OperationError) -> bool {
        let route = self.routes().remove(id);
        match route {
            Some(Route::Stream(tracked)) => lock(&tracked).finish(id, Err(error)),
            Some(Route::Reply(tx)) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// End every live entry with `error`.
    pub(crate) fn fail_all(&self, error: OperationError) {
        let drained: Vec<(OperationId, Route)> = self.routes().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), error = %error, "failing in-flight operations");
        }
        for (id, route) in drained {
            match route {
                Route::Reply(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                Route::Stream(tracked) => {
                    lock(&tracked).finish(&id, Err(error.clone()));
                }
            }
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.routes().len()
    }

    /// Route one incoming frame to its operation.
    pub(crate) fn dispatch(&self, frame: DaemonFrame) {
        let DaemonFrame { id, event } = frame;

        let route = {
            let mut routes = self.routes();
            match routes.get(&id) {
                None => None,
                Some(Route::Reply(_)) => routes.remove(&id),
                Some(Route::Stream(tracked)) if event.is_terminal() => {
                    let tracked = Arc::clone(tracked);
                    routes.remove(&id);
                    Some(Route::Stream(tracked))
                }
                Some(Route::Stream(tracked)) => Some(Route::Stream(Arc::clone(tracked))),
            }
        };

        match route {
            None => {
                tracing::debug!(operation_id = %id, "discarding frame for unknown operation");
            }
            Some(Route::Reply(tx)) => {
                let _ = tx.send(Ok(event));
            }
            Some(Route::Stream(tracked)) => deliver(&id, &tracked, event),
        }
    }

    fn stream(&self, id: &OperationId) -> Option<Arc<Mutex<Tracked>>> {
        match self.routes().get(id) {
            Some(Route::Stream(tracked)) => Some(Arc::clone(tracked)),
            _ => None,
        }
    }
}

fn deliver(id: &OperationId, tracked: &Mutex<Tracked>, event: DaemonEvent) {
    let mut tracked = lock(tracked);
    match event {
        DaemonEvent::Progress { data } => {
            if tracked.state.is_terminal() {
                return;
            }
            if tracked.cancel_sent {
                tracing::trace!(operation_id = %id, "discarding progress after cancel");
                return;
            }
            tracked.state = OperationState::Running;
            if let Some(sink) = tracked.sink.as_mut() {
                sink.on_progress(&data);
            }
        }
        DaemonEvent::Completed { payload } => {
            tracked.finish(id, Ok(payload));
        }
        DaemonEvent::Failed { message } => {
            tracked.finish(id, Err(OperationError::DaemonError(message)));
        }
        DaemonEvent::Rejected { message } => {
            tracked.finish(id, Err(OperationError::DaemonRejected(message)));
        }
        DaemonEvent::Cancelled => {
            tracked.finish(id, Err(OperationError::Cancelled));
        }
        DaemonEvent::Pong | DaemonEvent::Privileges { .. } => {
            tracing::warn!(operation_id = %id, "unexpected reply frame for streaming operation");
        }
    }
}

fn lock(tracked: &Mutex<Tracked>) -> MutexGuard<'_, Tracked> {
    tracked
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn duplicate(id: &OperationId) -> OperationError {
    OperationError::DaemonRejected(format!("operation id {id} is already in flight"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Progress(Vec<u8>),
        Terminal(Outcome),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Seen>>>);

    impl Recorder {
        fn seen(&self) -> Vec<Seen> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ProgressSink for Recorder {
        fn on_progress(&mut self, data: &[u8]) {
            self.0.lock().unwrap().push(Seen::Progress(data.to_vec()));
        }

        fn on_terminal(&mut self, outcome: &Outcome) {
            self.0.lock().unwrap().push(Seen::Terminal(outcome.clone()));
        }
    }

    fn frame(id: &str, event: DaemonEvent) -> DaemonFrame {
        DaemonFrame::new(OperationId::from(id), event)
    }

    fn progress(id: &str, data: &[u8]) -> DaemonFrame {
        frame(
            id,
            DaemonEvent::Progress {
                data: data.to_vec(),
            },
        )
    }

    /// xorshift64*: deterministic interleavings without a dependency.
    struct Shuffler(u64);

    impl Shuffler {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 >> 12;
            self.0 ^= self.0 << 25;
            self.0 ^= self.0 >> 27;
            self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
        }
    }

    #[test]
    fn progress_precedes_terminal_and_nothing_follows() {
        let router = Router::default();
        let sink = Recorder::default();
        let mut done = router
            .register_stream("op-1".into(), OperationKind::Scan, Box::new(sink.clone()))
            .unwrap();
        router.mark_running(&"op-1".into());

        router.dispatch(progress("op-1", b"a"));
        router.dispatch(frame("op-1", DaemonEvent::Completed { payload: None }));
        router.dispatch(progress("op-1", b"late"));
        router.dispatch(frame("op-1", DaemonEvent::Failed { message: "late".into() }));

        assert_eq!(
            sink.seen(),
            vec![Seen::Progress(b"a".to_vec()), Seen::Terminal(Ok(None))]
        );
        assert_eq!(done.try_recv().unwrap(), Ok(None));
        assert_eq!(router.live_count(), 0);
    }

    #[test]
    fn cancel_suppresses_trailing_progress_until_terminal() {
        let router = Router::default();
        let sink = Recorder::default();
        let mut done = router
            .register_stream("op-1".into(), OperationKind::Scan, Box::new(sink.clone()))
            .unwrap();

        for chunk in [b"1", b"2", b"3"] {
            router.dispatch(progress("op-1", chunk));
        }
        assert!(router.mark_cancel_sent(&"op-1".into()));
        router.dispatch(progress("op-1", b"trailing"));
        router.dispatch(frame("op-1", DaemonEvent::Cancelled));

        let seen = sink.seen();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[3], Seen::Terminal(Err(OperationError::Cancelled)));
        assert_eq!(done.try_recv().unwrap(), Err(OperationError::Cancelled));
        assert!(!router.mark_cancel_sent(&"op-1".into()), "terminal ids are not cancellable");
    }

    #[test]
    fn cancelling_unknown_id_is_a_no_op() {
        let router = Router::default();
        assert!(!router.mark_cancel_sent(&"never-issued".into()));
        assert!(!router.terminate(&"never-issued".into(), OperationError::Timeout));
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let router = Router::default();
        router
            .register_stream("op-1".into(), OperationKind::Discover, Box::new(discard_progress()))
            .unwrap();
        let err = router
            .register_stream("op-1".into(), OperationKind::Scan, Box::new(discard_progress()))
            .unwrap_err();
        assert!(matches!(err, OperationError::DaemonRejected(_)));
    }

    #[test]
    fn abandoned_operation_gets_no_terminal() {
        let router = Router::default();
        let sink = Recorder::default();
        let mut done = router
            .register_stream("op-1".into(), OperationKind::Scan, Box::new(sink.clone()))
            .unwrap();
        router.abandon(&"op-1".into());
        router.fail_all(OperationError::ConnectionLost);

        assert!(sink.seen().is_empty());
        assert!(done.try_recv().is_err());
    }

    #[test]
    fn fail_all_terminates_streams_and_replies() {
        let router = Router::default();
        let sink = Recorder::default();
        let mut done = router
            .register_stream("op-1".into(), OperationKind::Discover, Box::new(sink.clone()))
            .unwrap();
        let mut reply = router.register_reply("ping-2".into()).unwrap();

        router.fail_all(OperationError::ConnectionLost);

        assert_eq!(done.try_recv().unwrap(), Err(OperationError::ConnectionLost));
        assert_eq!(reply.try_recv().unwrap(), Err(OperationError::ConnectionLost));
        assert_eq!(
            sink.seen(),
            vec![Seen::Terminal(Err(OperationError::ConnectionLost))]
        );
    }

    #[test]
    fn daemon_failures_map_to_taxonomy() {
        let router = Router::default();
        let mut rejected = router
            .register_stream("op-1".into(), OperationKind::Scan, Box::new(discard_progress()))
            .unwrap();
        let mut failed = router
            .register_stream("op-2".into(), OperationKind::Scan, Box::new(discard_progress()))
            .unwrap();

        router.dispatch(frame("op-1", DaemonEvent::Rejected { message: "bad json".into() }));
        router.dispatch(frame("op-2", DaemonEvent::Failed { message: "no route".into() }));

        let rejected = rejected.try_recv().unwrap().unwrap_err();
        assert_eq!(rejected, OperationError::DaemonRejected("bad json".into()));
        assert_eq!(rejected.class(), ErrorClass::Rejected);
        let failed = failed.try_recv().unwrap().unwrap_err();
        assert_eq!(failed, OperationError::DaemonError("no route".into()));
    }

    #[test]
    fn interleaved_frames_reach_only_their_own_sink() {
        for seed in 1..=64u64 {
            let router = Router::default();
            let discover = Recorder::default();
            let scan = Recorder::default();
            let mut discover_done = router
                .register_stream(
                    "op-1".into(),
                    OperationKind::Discover,
                    Box::new(discover.clone()),
                )
                .unwrap();
            let mut scan_done = router
                .register_stream("op-2".into(), OperationKind::Scan, Box::new(scan.clone()))
                .unwrap();

            let mut pending: [Vec<DaemonFrame>; 2] = [
                (0..20u8)
                    .map(|n| progress("op-1", &[b'd', n]))
                    .chain([frame("op-1", DaemonEvent::Completed { payload: None })])
                    .collect(),
                (0..15u8)
                    .map(|n| progress("op-2", &[b's', n]))
                    .chain([frame("op-2", DaemonEvent::Cancelled)])
                    .collect(),
            ];
            for queue in pending.iter_mut() {
                queue.reverse();
            }

            let mut rng = Shuffler(seed);
            while pending.iter().any(|queue| !queue.is_empty()) {
                let pick = (rng.next() % 2) as usize;
                let queue = if pending[pick].is_empty() { 1 - pick } else { pick };
                if let Some(next) = pending[queue].pop() {
                    router.dispatch(next);
                }
            }

            let expected_discover: Vec<Seen> = (0..20u8)
                .map(|n| Seen::Progress(vec![b'd', n]))
                .chain([Seen::Terminal(Ok(None))])
                .collect();
            let expected_scan: Vec<Seen> = (0..15u8)
                .map(|n| Seen::Progress(vec![b's', n]))
                .chain([Seen::Terminal(Err(OperationError::Cancelled))])
                .collect();
            assert_eq!(discover.seen(), expected_discover, "seed {seed}");
            assert_eq!(scan.seen(), expected_scan, "seed {seed}");
            assert_eq!(discover_done.try_recv().unwrap(), Ok(None));
            assert_eq!(scan_done.try_recv().unwrap(), Err(OperationError::Cancelled));
        }
    }
}
