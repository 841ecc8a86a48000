//! Queued request/response units of work.
//!
//! An operation is driven by the engine through the hooks of [`Operation`].
//! Shared bookkeeping (name, sticky error, timeout, attempt generation) lives
//! in [`OperationState`], which every implementation embeds and exposes.

mod request;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::descriptor::WriteMode;
use crate::core::error::{DeviceError, OperationError, TransportError};

pub use request::{ReadOperation, RequestOperation};

/// Response timeout used when an operation does not set its own.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationName(String);

impl OperationName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for OperationName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Opaque key/value bag carried by operations and devices.
#[derive(Default)]
pub struct UserInfo {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl UserInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl fmt::Debug for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Bookkeeping shared by every operation.
#[derive(Debug)]
pub struct OperationState {
    name: OperationName,
    user_info: UserInfo,
    error: Option<OperationError>,
    completed: bool,
    response_timeout: Duration,
    allowed_responses: HashSet<Uuid>,
    generation: u64,
    attempts: u32,
    started_at: Option<Instant>,
}

impl OperationState {
    pub fn new(name: impl Into<OperationName>) -> Self {
        Self {
            name: name.into(),
            user_info: UserInfo::new(),
            error: None,
            completed: false,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            allowed_responses: HashSet::new(),
            generation: 0,
            attempts: 0,
            started_at: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_responses_from(mut self, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        self.allowed_responses.extend(characteristics);
        self
    }

    pub fn name(&self) -> &OperationName {
        &self.name
    }

    pub fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    pub fn user_info_mut(&mut self) -> &mut UserInfo {
        &mut self.user_info
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.error.as_ref()
    }

    /// Records a terminal error. Returns `false` if one was already set.
    pub fn fail(&mut self, error: OperationError) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// Marks a successful terminal outcome.
    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn is_finished(&self) -> bool {
        self.completed || self.error.is_some()
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    pub fn accepts(&self, characteristic: Uuid) -> bool {
        self.allowed_responses.contains(&characteristic)
    }

    pub fn allow_responses_from(&mut self, characteristic: Uuid) {
        self.allowed_responses.insert(characteristic);
    }

    /// Generation of the latest attempt; 0 before the first start.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// When the latest attempt started.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub(crate) fn begin_attempt(&mut self, generation: u64) {
        self.generation = generation;
        self.attempts += 1;
        self.started_at = Some(Instant::now());
    }
}

/// What an operation may do to the peripheral while it is started.
pub trait Interactor {
    fn send(&mut self, payload: &[u8], characteristic: Uuid) -> Result<(), TransportError>;

    fn read_value(&mut self, characteristic: Uuid) -> Result<(), TransportError>;

    fn write_mode(&self, characteristic: Uuid) -> WriteMode;

    fn cached_value(&self, characteristic: Uuid) -> Option<&[u8]>;
}

/// A unit of work executed by the engine.
///
/// Only `state`, `state_mut` and `start` are required. The defaults give the
/// behaviour of a single request that waits for one response on any of the
/// characteristics registered in its state.
pub trait Operation: Send + 'static {
    fn state(&self) -> &OperationState;

    fn state_mut(&mut self) -> &mut OperationState;

    /// Issues the request for one attempt.
    fn start(&mut self, link: &mut dyn Interactor) -> Result<(), OperationError>;

    fn name(&self) -> &OperationName {
        self.state().name()
    }

    fn error(&self) -> Option<&OperationError> {
        self.state().error()
    }

    fn response_timeout(&self) -> Duration {
        self.state().response_timeout()
    }

    fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Whether the engine should call `start` again. Defaults to a single
    /// attempt.
    fn has_next_iteration(&self) -> bool {
        self.state().attempts() == 0
    }

    fn can_respond_on(&self, characteristic: Uuid) -> bool {
        self.state().accepts(characteristic)
    }

    /// Whether a write acknowledgement on `characteristic` belongs to this
    /// operation. Defaults to [`can_respond_on`](Self::can_respond_on).
    fn can_respond_on_write(&self, characteristic: Uuid) -> bool {
        self.can_respond_on(characteristic)
    }

    fn can_respond_on_data(&self, _payload: &[u8]) -> bool {
        true
    }

    fn on_value_updated(
        &mut self,
        _characteristic: Uuid,
        _payload: Option<&[u8]>,
        error: Option<&TransportError>,
    ) {
        match error {
            Some(e) => {
                self.state_mut().fail(e.clone().into());
            }
            None => self.state_mut().complete(),
        }
    }

    fn on_value_written(&mut self, _characteristic: Uuid, error: Option<&TransportError>) {
        if let Some(e) = error {
            self.state_mut().fail(e.clone().into());
        }
    }

    fn on_external_error(&mut self, error: OperationError) {
        self.state_mut().fail(error);
    }

    fn on_timeout(&mut self) {
        self.state_mut().fail(OperationError::Timeout);
    }
}

/// Terminal in the engine's eyes: an error always finishes an operation.
pub fn is_terminal(op: &dyn Operation) -> bool {
    op.error().is_some() || op.is_finished()
}

/// Engine-side handle on a queued operation of any concrete type.
pub(crate) trait Scheduled: Send {
    fn operation(&self) -> &dyn Operation;

    fn operation_mut(&mut self) -> &mut dyn Operation;

    /// Hands the operation back to whoever awaits its [`Completion`].
    fn retire(self: Box<Self>);
}

struct Entry<O: Operation> {
    op: O,
    done: oneshot::Sender<O>,
}

impl<O: Operation> Scheduled for Entry<O> {
    fn operation(&self) -> &dyn Operation {
        &self.op
    }

    fn operation_mut(&mut self) -> &mut dyn Operation {
        &mut self.op
    }

    fn retire(self: Box<Self>) {
        let Entry { op, done } = *self;
        // The caller may have stopped waiting.
        let _ = done.send(op);
    }
}

pub(crate) fn schedule<O: Operation>(op: O) -> (Box<dyn Scheduled>, Completion<O>) {
    let (done, rx) = oneshot::channel();
    (Box::new(Entry { op, done }), Completion { rx })
}

/// Resolves with the operation once it has retired.
#[must_use = "dropping a Completion does not cancel the operation"]
pub struct Completion<O> {
    rx: oneshot::Receiver<O>,
}

impl<O> Future for Completion<O> {
    type Output = Result<O, DeviceError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.map_err(|_| DeviceError::Closed))
    }
}
