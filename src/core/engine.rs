//! Serialized execution of queued operations.
//!
//! The engine owns a FIFO of pending operations and a single current slot.
//! Only the current operation is started, receives transport events and can
//! time out. Every event ends by re-running [`OperationEngine::dispatch`],
//! which retires the current operation once it is terminal and moves on to
//! the next one.
//!
//! Timeouts are keyed to the generation assigned on each (re)start, so a
//! timer scheduled for an earlier attempt never fires into a later one.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::error::{OperationError, TransportError};
use crate::core::operation::{Completion, Interactor, Operation, Scheduled, is_terminal, schedule};

/// Everything the engine needs from its owner while dispatching.
pub trait DispatchContext {
    fn link(&mut self) -> &mut dyn Interactor;

    /// Arranges for [`OperationEngine::handle_timeout`] to be called with
    /// `generation` once `after` has elapsed.
    fn schedule_timeout(&mut self, generation: u64, after: Duration);

    fn will_execute(&mut self, op: &dyn Operation);

    fn did_finish(&mut self, op: &dyn Operation);
}

/// Where [`OperationEngine::dispatch`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing current and nothing queued.
    Idle,
    /// The current operation is waiting for an event or its timeout.
    Waiting,
    /// Queued work is held until the engine is resumed.
    Paused,
}

pub struct OperationEngine {
    queue: VecDeque<Box<dyn Scheduled>>,
    current: Option<Box<dyn Scheduled>>,
    next_generation: u64,
    paused: bool,
    label: String,
}

impl OperationEngine {
    /// Creates a paused engine; call [`resume`](Self::resume) once the
    /// peripheral is ready.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            next_generation: 1,
            paused: true,
            label: label.into(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self, ctx: &mut dyn DispatchContext) -> DispatchOutcome {
        self.paused = false;
        self.dispatch(ctx)
    }

    pub fn current(&self) -> Option<&dyn Operation> {
        self.current.as_ref().map(|e| e.operation())
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Appends `op` without dispatching.
    pub fn enqueue<O: Operation>(&mut self, op: O) -> Completion<O> {
        let (entry, completion) = schedule(op);
        self.push(entry);
        completion
    }

    pub(crate) fn push(&mut self, entry: Box<dyn Scheduled>) {
        debug!("[{}] queued {}", self.label, entry.operation().name());
        self.queue.push_back(entry);
    }

    /// Appends `op` and runs the dispatch loop.
    pub fn execute<O: Operation>(&mut self, op: O, ctx: &mut dyn DispatchContext) -> Completion<O> {
        let completion = self.enqueue(op);
        self.dispatch(ctx);
        completion
    }

    /// Runs until the engine is idle, paused or waiting on the current
    /// operation.
    pub fn dispatch(&mut self, ctx: &mut dyn DispatchContext) -> DispatchOutcome {
        loop {
            let Some(entry) = self.current.as_mut() else {
                if self.paused {
                    return if self.queue.is_empty() {
                        DispatchOutcome::Idle
                    } else {
                        DispatchOutcome::Paused
                    };
                }
                let Some(next) = self.queue.pop_front() else {
                    return DispatchOutcome::Idle;
                };
                info!("[{}] executing {}", self.label, next.operation().name());
                ctx.will_execute(next.operation());
                self.current = Some(next);
                continue;
            };

            if is_terminal(entry.operation()) {
                self.retire_current(ctx);
                continue;
            }

            if self.paused {
                return DispatchOutcome::Paused;
            }

            let op = entry.operation_mut();
            // The first attempt is unconditional; only re-starts are gated.
            if op.state().attempts() > 0 && !op.has_next_iteration() {
                return DispatchOutcome::Waiting;
            }

            let generation = self.next_generation;
            self.next_generation += 1;
            op.state_mut().begin_attempt(generation);

            match op.start(ctx.link()) {
                Ok(()) if is_terminal(op) => continue,
                Ok(()) => {
                    debug!(
                        "[{}] {} started (generation {})",
                        self.label,
                        op.name(),
                        generation
                    );
                    ctx.schedule_timeout(generation, op.response_timeout());
                    return DispatchOutcome::Waiting;
                }
                Err(e) => {
                    warn!("[{}] {} failed to start: {}", self.label, op.name(), e);
                    deliver_external_error(op, e);
                }
            }
        }
    }

    /// Fires a previously scheduled timeout. Stale generations are ignored.
    pub fn handle_timeout(&mut self, generation: u64, ctx: &mut dyn DispatchContext) {
        let Some(entry) = self.current.as_mut() else {
            debug!("[{}] stale timeout {} (idle)", self.label, generation);
            return;
        };
        let op = entry.operation_mut();
        if op.state().generation() != generation {
            debug!(
                "[{}] stale timeout {} for {} (now {})",
                self.label,
                generation,
                op.name(),
                op.state().generation()
            );
            return;
        }

        warn!("[{}] {} timed out", self.label, op.name());
        op.on_timeout();
        // An operation that neither finishes nor asks for another attempt
        // would otherwise wait forever.
        if !is_terminal(op) && !op.has_next_iteration() {
            op.state_mut().fail(OperationError::Timeout);
        }
        self.dispatch(ctx);
    }

    /// Whether the current operation claims a value update.
    pub fn claims_update(&self, characteristic: Uuid, payload: Option<&[u8]>) -> bool {
        self.current.as_ref().is_some_and(|entry| {
            let op = entry.operation();
            op.can_respond_on(characteristic) && payload.is_none_or(|p| op.can_respond_on_data(p))
        })
    }

    /// Whether the current operation claims a write acknowledgement.
    pub fn claims_write(&self, characteristic: Uuid) -> bool {
        self.current
            .as_ref()
            .is_some_and(|entry| entry.operation().can_respond_on_write(characteristic))
    }

    /// Forwards a claimed value update to the current operation.
    pub fn deliver_update(
        &mut self,
        characteristic: Uuid,
        payload: Option<&[u8]>,
        error: Option<&TransportError>,
        ctx: &mut dyn DispatchContext,
    ) {
        let Some(entry) = self.current.as_mut() else {
            return;
        };
        let op = entry.operation_mut();
        op.on_value_updated(characteristic, payload, error);
        record_callback_error(op, error);
        self.dispatch(ctx);
    }

    /// Forwards a claimed write acknowledgement to the current operation.
    pub fn deliver_written(
        &mut self,
        characteristic: Uuid,
        error: Option<&TransportError>,
        ctx: &mut dyn DispatchContext,
    ) {
        let Some(entry) = self.current.as_mut() else {
            return;
        };
        let op = entry.operation_mut();
        op.on_value_written(characteristic, error);
        record_callback_error(op, error);
        self.dispatch(ctx);
    }

    /// Interrupts the current operation, if any, and moves on.
    pub fn drop_current(&mut self, error: OperationError, ctx: &mut dyn DispatchContext) {
        if let Some(entry) = self.current.as_mut() {
            let op = entry.operation_mut();
            info!("[{}] dropping {}: {}", self.label, op.name(), error);
            deliver_external_error(op, error);
        }
        self.dispatch(ctx);
    }

    /// Fails everything queued, then interrupts the current operation.
    pub fn drop_all(&mut self, error: OperationError, ctx: &mut dyn DispatchContext) {
        self.fail_queued(error.clone());
        self.drop_current(error, ctx);
    }

    /// Completes every queued (never started) operation with `error`.
    pub fn fail_queued(&mut self, error: OperationError) {
        for mut entry in self.queue.drain(..) {
            let op = entry.operation_mut();
            debug!("[{}] discarding queued {}", self.label, op.name());
            deliver_external_error(op, error.clone());
            entry.retire();
        }
    }

    fn retire_current(&mut self, ctx: &mut dyn DispatchContext) {
        let Some(done) = self.current.take() else {
            return;
        };
        match done.operation().error() {
            Some(e) => info!("[{}] {} finished with error: {}", self.label, done.operation().name(), e),
            None => info!("[{}] {} finished", self.label, done.operation().name()),
        }
        ctx.did_finish(done.operation());
        done.retire();
    }
}

fn deliver_external_error(op: &mut dyn Operation, error: OperationError) {
    op.on_external_error(error.clone());
    if op.error().is_none() {
        op.state_mut().fail(error);
    }
}

fn record_callback_error(op: &mut dyn Operation, error: Option<&TransportError>) {
    if let Some(e) = error {
        if op.error().is_none() {
            op.state_mut().fail(e.clone().into());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::core::cache::ValueCache;
    use crate::core::descriptor::{EndpointDescriptor, WriteMode};
    use crate::core::link::Link;
    use crate::core::operation::{OperationState, RequestOperation};
    use crate::core::testing::{FakeTransport, Request, profile, uuid};

    struct Harness {
        descriptor: EndpointDescriptor,
        transport: FakeTransport,
        cache: ValueCache,
        timers: Vec<(u64, Duration)>,
        log: Vec<String>,
    }

    struct Ctx<'a> {
        link: Link<'a>,
        timers: &'a mut Vec<(u64, Duration)>,
        log: &'a mut Vec<String>,
    }

    impl DispatchContext for Ctx<'_> {
        fn link(&mut self) -> &mut dyn Interactor {
            &mut self.link
        }

        fn schedule_timeout(&mut self, generation: u64, after: Duration) {
            self.timers.push((generation, after));
        }

        fn will_execute(&mut self, op: &dyn Operation) {
            self.log.push(format!("will {}", op.name()));
        }

        fn did_finish(&mut self, op: &dyn Operation) {
            self.log.push(format!("did {}", op.name()));
        }
    }

    impl Harness {
        fn new() -> Self {
            let descriptor = profile();
            let transport = FakeTransport::ready_for(&descriptor);
            Self {
                descriptor,
                transport,
                cache: ValueCache::new(),
                timers: Vec::new(),
                log: Vec::new(),
            }
        }

        fn ctx(&mut self) -> Ctx<'_> {
            Ctx {
                link: Link::new(&self.descriptor, &mut self.transport, &self.cache),
                timers: &mut self.timers,
                log: &mut self.log,
            }
        }
    }

    fn ping(name: &str) -> RequestOperation {
        RequestOperation::new(name, uuid(0x101), vec![0x01], uuid(0x102))
            .with_timeout(Duration::from_secs(2))
    }

    fn running_engine(h: &mut Harness) -> OperationEngine {
        let mut engine = OperationEngine::new("test");
        engine.resume(&mut h.ctx());
        engine
    }

    #[test]
    fn test_paused_engine_holds_queue() {
        let mut h = Harness::new();
        let mut engine = OperationEngine::new("test");
        let _c = engine.execute(ping("a"), &mut h.ctx());
        assert!(engine.current().is_none());
        assert_eq!(engine.queued(), 1);
        assert!(h.transport.take_requests().is_empty());

        assert_eq!(engine.resume(&mut h.ctx()), DispatchOutcome::Waiting);
        assert_eq!(engine.current().map(|op| op.name().as_str()), Some("a"));
    }

    #[test]
    fn test_single_in_flight_and_submission_order() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _a = engine.execute(ping("a"), &mut h.ctx());
        let _b = engine.execute(ping("b"), &mut h.ctx());
        let _c = engine.execute(ping("c"), &mut h.ctx());

        // Only "a" has touched the transport.
        assert_eq!(h.transport.take_requests().len(), 1);
        assert_eq!(engine.queued(), 2);

        for _ in 0..3 {
            assert!(engine.claims_update(uuid(0x102), Some(&[0xFF])));
            engine.deliver_update(uuid(0x102), Some(&[0xFF]), None, &mut h.ctx());
        }

        assert!(engine.is_idle());
        assert_eq!(
            h.log,
            vec!["will a", "did a", "will b", "did b", "will c", "did c"]
        );
        assert_eq!(h.timers.iter().map(|t| t.0).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_timeout_fails_and_advances() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _a = engine.execute(ping("a"), &mut h.ctx());
        let _b = engine.execute(ping("b"), &mut h.ctx());

        assert_eq!(h.timers, vec![(1, Duration::from_secs(2))]);
        engine.deliver_written(uuid(0x101), None, &mut h.ctx());
        assert_eq!(engine.current().map(|op| op.name().as_str()), Some("a"));

        engine.handle_timeout(1, &mut h.ctx());
        assert_eq!(h.log, vec!["will a", "did a", "will b"]);
        assert_eq!(engine.current().map(|op| op.name().as_str()), Some("b"));
    }

    #[tokio::test]
    async fn test_timeout_error_reaches_caller() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let completion = engine.execute(ping("a"), &mut h.ctx());
        engine.handle_timeout(1, &mut h.ctx());
        let op = completion.await.unwrap();
        assert_eq!(op.error(), Some(&OperationError::Timeout));
    }

    /// Retries itself on timeout until the third attempt.
    struct Retrying {
        state: OperationState,
        timeouts: Arc<Mutex<u32>>,
    }

    impl Operation for Retrying {
        fn state(&self) -> &OperationState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut OperationState {
            &mut self.state
        }

        fn start(&mut self, link: &mut dyn Interactor) -> Result<(), OperationError> {
            link.send(&[0x10], uuid(0x101))?;
            Ok(())
        }

        fn has_next_iteration(&self) -> bool {
            self.state.attempts() < 3 && *self.timeouts.lock().unwrap() >= self.state.attempts()
        }

        fn on_timeout(&mut self) {
            *self.timeouts.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_stale_timeout_is_ignored_after_retry() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let timeouts = Arc::new(Mutex::new(0));
        let _c = engine.execute(
            Retrying {
                state: OperationState::new("retry").with_responses_from([uuid(0x102)]),
                timeouts: timeouts.clone(),
            },
            &mut h.ctx(),
        );

        engine.handle_timeout(1, &mut h.ctx());
        assert_eq!(*timeouts.lock().unwrap(), 1);
        assert_eq!(engine.current().map(|op| op.state().generation()), Some(2));

        // The timer from the first attempt fires late.
        engine.handle_timeout(1, &mut h.ctx());
        assert_eq!(*timeouts.lock().unwrap(), 1);
        assert_eq!(engine.current().map(|op| op.state().attempts()), Some(2));
    }

    #[test]
    fn test_synchronous_start_failure_retires_through_dispatch() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        h.transport.fail_next(TransportError::Unavailable);
        let _a = engine.execute(ping("a"), &mut h.ctx());
        let _b = engine.execute(ping("b"), &mut h.ctx());

        assert_eq!(h.log, vec!["will a", "did a", "will b"]);
        assert_eq!(h.timers.len(), 1);
    }

    #[test]
    fn test_unclaimed_update_does_not_touch_current() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _a = engine.execute(ping("a"), &mut h.ctx());
        assert!(!engine.claims_update(uuid(0x999), Some(&[1])));
        assert_eq!(engine.current().map(|op| op.is_finished()), Some(false));
    }

    #[test]
    fn test_filtered_payload_is_not_claimed() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _a = engine.execute(ping("a").with_filter(|d| d == [0x42]), &mut h.ctx());
        assert!(!engine.claims_update(uuid(0x102), Some(&[0x41])));
        assert!(engine.claims_update(uuid(0x102), Some(&[0x42])));
    }

    #[tokio::test]
    async fn test_drop_current_interrupts_and_starts_next() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let a = engine.execute(ping("a"), &mut h.ctx());
        let _b = engine.execute(ping("b"), &mut h.ctx());

        engine.drop_current(OperationError::Interrupted, &mut h.ctx());
        assert_eq!(a.await.unwrap().error(), Some(&OperationError::Interrupted));
        assert_eq!(engine.current().map(|op| op.name().as_str()), Some("b"));
    }

    #[tokio::test]
    async fn test_drop_all_clears_queue() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let a = engine.execute(ping("a"), &mut h.ctx());
        let b = engine.execute(ping("b"), &mut h.ctx());

        engine.drop_all(OperationError::Interrupted, &mut h.ctx());
        assert!(engine.is_idle());
        assert_eq!(a.await.unwrap().error(), Some(&OperationError::Interrupted));
        assert_eq!(b.await.unwrap().error(), Some(&OperationError::Interrupted));
        // "b" never became current.
        assert_eq!(h.log, vec!["will a", "did a"]);
    }

    #[test]
    fn test_callback_error_is_terminal_and_sticky() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _a = engine.execute(ping("a"), &mut h.ctx());
        let failure = TransportError::Backend("write rejected".into());
        engine.deliver_written(uuid(0x101), Some(&failure), &mut h.ctx());
        assert!(engine.is_idle());
        assert_eq!(h.log, vec!["will a", "did a"]);
    }

    /// Finishes inside `start` and never asks for another attempt.
    struct OneShot {
        state: OperationState,
    }

    impl Operation for OneShot {
        fn state(&self) -> &OperationState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut OperationState {
            &mut self.state
        }

        fn start(&mut self, _link: &mut dyn Interactor) -> Result<(), OperationError> {
            self.state.complete();
            Ok(())
        }

        fn has_next_iteration(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_first_attempt_starts_without_iteration_hint() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _a = engine.execute(
            OneShot {
                state: OperationState::new("once"),
            },
            &mut h.ctx(),
        );
        let _b = engine.execute(ping("next"), &mut h.ctx());

        assert_eq!(h.log, vec!["will once", "did once", "will next"]);
        assert_eq!(engine.current().map(|op| op.name().as_str()), Some("next"));
        assert_eq!(h.timers, vec![(2, Duration::from_secs(2))]);
    }

    #[tokio::test]
    async fn test_empty_frame_list_does_not_stall_queue() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let empty = engine.execute(
            RequestOperation::chunked("empty", uuid(0x101), Vec::new(), [uuid(0x102)]),
            &mut h.ctx(),
        );
        let _b = engine.execute(ping("next"), &mut h.ctx());

        let op = empty.await.unwrap();
        assert!(op.is_finished());
        assert_eq!(op.error(), None);
        assert_eq!(h.log, vec!["will empty", "did empty", "will next"]);
        assert_eq!(
            h.transport.take_requests(),
            vec![Request::Write(uuid(0x101), vec![0x01], WriteMode::WithResponse)]
        );
    }

    #[test]
    fn test_update_on_write_target_is_not_a_response() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _a = engine.execute(ping("a"), &mut h.ctx());

        assert!(!engine.claims_update(uuid(0x101), Some(&[0xEE])));
        assert!(engine.claims_write(uuid(0x101)));
        engine.deliver_written(uuid(0x101), None, &mut h.ctx());
        assert_eq!(engine.current().map(|op| op.is_finished()), Some(false));

        assert!(engine.claims_update(uuid(0x102), Some(&[0xBB])));
        engine.deliver_update(uuid(0x102), Some(&[0xBB]), None, &mut h.ctx());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_multi_frame_request_restarts_with_new_generation() {
        let mut h = Harness::new();
        let mut engine = running_engine(&mut h);
        let _c = engine.execute(
            RequestOperation::chunked("upload", uuid(0x101), vec![vec![1], vec![2]], [uuid(0x102)]),
            &mut h.ctx(),
        );
        engine.deliver_update(uuid(0x102), Some(&[0xA1]), None, &mut h.ctx());
        assert_eq!(engine.current().map(|op| op.state().generation()), Some(2));
        assert_eq!(
            h.transport.take_requests(),
            vec![
                Request::Write(uuid(0x101), vec![1], WriteMode::WithResponse),
                Request::Write(uuid(0x101), vec![2], WriteMode::WithResponse),
            ]
        );
        engine.deliver_update(uuid(0x102), Some(&[0xA2]), None, &mut h.ctx());
        assert!(engine.is_idle());
    }
}
