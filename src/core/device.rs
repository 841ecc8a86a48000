//! Device facade and the per-device task that owns all engine state.
//!
//! [`Device`] is a cheap handle. Every call is turned into a command for a
//! single tokio task which also receives the transport callbacks and the
//! response timeouts, so the queue, the current operation, the discovery
//! flag and the value cache are only ever touched from that task.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::cache::ValueCache;
use crate::core::descriptor::EndpointDescriptor;
use crate::core::discovery::{DiscoveryMonitor, DiscoveryState, ScanStatus};
use crate::core::engine::{DispatchContext, OperationEngine};
use crate::core::error::{DeviceError, OperationError, TransportError};
use crate::core::link::Link;
use crate::core::operation::{
    Completion, Interactor, Operation, OperationName, Scheduled, UserInfo, schedule,
};
use crate::core::transport::{TransportEvent, TransportEventReceiver, TransportPort};

/// Default capacity of the device event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What callers may do with the device right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Not prepared, or disconnected since.
    Initial,
    /// Discovery is in flight.
    Preparing,
    /// Prepared and no operation is current.
    Ready,
    /// Prepared and an operation is current.
    Busy,
}

/// Notifications published to subscribers of a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    Disconnected {
        error: Option<TransportError>,
    },
    FailedToConnect {
        error: Option<TransportError>,
    },
    InterfaceStateChanged(InterfaceState),
    InitializationFinished {
        error: Option<DeviceError>,
    },
    WillSendData {
        characteristic: Uuid,
        payload: Vec<u8>,
    },
    DidSendData {
        characteristic: Uuid,
        payload: Vec<u8>,
    },
    OperationWillExecute {
        name: OperationName,
    },
    OperationDidFinish {
        name: OperationName,
        error: Option<OperationError>,
    },
    /// A value update no current operation claimed.
    CharacteristicUpdated {
        characteristic: Uuid,
        payload: Option<Vec<u8>>,
        error: Option<TransportError>,
    },
    /// A write acknowledgement no current operation claimed.
    CharacteristicWritten {
        characteristic: Uuid,
        error: Option<TransportError>,
    },
}

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub event_capacity: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Prepare,
    WaitReady(Reply<Result<(), DeviceError>>),
    Execute(Box<dyn Scheduled>),
    DropCurrent,
    DropAll,
    WaitCurrent(Reply<()>),
    Send {
        payload: Vec<u8>,
        characteristic: Uuid,
        reply: Reply<Result<(), DeviceError>>,
    },
    Read {
        characteristic: Uuid,
        reply: Reply<Result<(), DeviceError>>,
    },
    CachedValue {
        characteristic: Uuid,
        reply: Reply<Option<Vec<u8>>>,
    },
    RetrieveData {
        characteristic: Uuid,
        reply: Reply<Option<Vec<u8>>>,
    },
    Discovery(Reply<DiscoveryState>),
    DropCache,
    Connected,
    Disconnected(Option<TransportError>),
    FailedToConnect(Option<TransportError>),
}

/// Handle on a device task.
#[derive(Clone)]
pub struct Device {
    label: Arc<str>,
    descriptor: Arc<EndpointDescriptor>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<InterfaceState>,
    events: broadcast::Sender<DeviceEvent>,
    user_info: Arc<Mutex<UserInfo>>,
    cancel: CancellationToken,
}

impl Device {
    /// Spawns the device task on the current tokio runtime.
    ///
    /// `transport_events` must be the receiving end of the channel the
    /// transport reports its callbacks on.
    pub fn spawn<T>(
        label: impl Into<String>,
        descriptor: Arc<EndpointDescriptor>,
        transport: T,
        transport_events: TransportEventReceiver,
        options: DeviceOptions,
    ) -> Self
    where
        T: TransportPort + 'static,
    {
        let label: String = label.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(InterfaceState::Initial);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let cancel = CancellationToken::new();

        let core = DeviceCore {
            label: label.clone(),
            descriptor: descriptor.clone(),
            transport: Box::new(transport),
            monitor: DiscoveryMonitor::new(descriptor.clone(), label.clone()),
            engine: OperationEngine::new(label.clone()),
            cache: ValueCache::new(),
            state: InterfaceState::Initial,
            state_tx,
            events: events.clone(),
            timeouts: timeouts_tx,
            current_waiters: Vec::new(),
            ready_waiters: Vec::new(),
            cancel: cancel.clone(),
        };
        tokio::spawn(core.run(commands_rx, transport_events, timeouts_rx));
        info!("[{}] device task started", label);

        Self {
            label: label.into(),
            descriptor,
            commands: commands_tx,
            state: state_rx,
            events,
            user_info: Arc::new(Mutex::new(UserInfo::new())),
            cancel,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn interface_state(&self) -> InterfaceState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<InterfaceState> {
        self.state.clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.interface_state(),
            InterfaceState::Ready | InterfaceState::Busy
        )
    }

    /// Starts discovery. A scan already in flight is left alone.
    pub fn prepare(&self) -> Result<(), DeviceError> {
        self.command(Command::Prepare)
    }

    /// Resolves once the device is ready, or with the error of the scan that
    /// finishes next. Waits for a later `prepare` if nothing is in flight.
    pub async fn wait_ready(&self) -> Result<(), DeviceError> {
        self.request(Command::WaitReady).await?
    }

    /// Current readiness as derived from the transport.
    pub async fn discovery_state(&self) -> Result<DiscoveryState, DeviceError> {
        self.request(Command::Discovery).await
    }

    /// Writes straight to the transport, bypassing the operation queue.
    ///
    /// # Panics
    /// If the characteristic is not registered or not writable.
    pub async fn send(&self, payload: &[u8], characteristic: Uuid) -> Result<(), DeviceError> {
        if !self.descriptor.characteristic(characteristic).is_writable() {
            panic!("characteristic {} is not configured for writing", characteristic);
        }
        let payload = payload.to_vec();
        self.request(|reply| Command::Send {
            payload,
            characteristic,
            reply,
        })
        .await?
    }

    /// Requests a read straight from the transport; the value arrives as a
    /// callback.
    pub async fn read_value(&self, characteristic: Uuid) -> Result<(), DeviceError> {
        self.descriptor.assert_registered(characteristic);
        self.request(|reply| Command::Read {
            characteristic,
            reply,
        })
        .await?
    }

    /// Last pushed value nobody has consumed yet.
    pub async fn cached_value(&self, characteristic: Uuid) -> Result<Option<Vec<u8>>, DeviceError> {
        self.request(|reply| Command::CachedValue {
            characteristic,
            reply,
        })
        .await
    }

    /// Last value the transport holds for the characteristic.
    pub async fn retrieve_data(&self, characteristic: Uuid) -> Result<Option<Vec<u8>>, DeviceError> {
        self.descriptor.assert_registered(characteristic);
        self.request(|reply| Command::RetrieveData {
            characteristic,
            reply,
        })
        .await
    }

    pub fn drop_cache(&self) -> Result<(), DeviceError> {
        self.command(Command::DropCache)
    }

    /// Queues `op` behind everything submitted before it. Returns at once.
    pub fn execute_operation<O: Operation>(&self, op: O) -> Completion<O> {
        let (entry, completion) = schedule(op);
        // If the task is gone the entry is dropped with the command and the
        // completion resolves to `DeviceError::Closed`.
        let _ = self.command(Command::Execute(entry));
        completion
    }

    pub fn drop_current_operation(&self) -> Result<(), DeviceError> {
        self.command(Command::DropCurrent)
    }

    pub fn drop_all_operations(&self) -> Result<(), DeviceError> {
        self.command(Command::DropAll)
    }

    /// Resolves when the operation current at the time of the call retires,
    /// or at once if there is none.
    pub async fn wait_current_operation(&self) -> Result<(), DeviceError> {
        self.request(Command::WaitCurrent).await
    }

    pub fn did_connect(&self) -> Result<(), DeviceError> {
        self.command(Command::Connected)
    }

    pub fn did_disconnect(&self, error: Option<TransportError>) -> Result<(), DeviceError> {
        self.command(Command::Disconnected(error))
    }

    pub fn did_fail_to_connect(&self, error: Option<TransportError>) -> Result<(), DeviceError> {
        self.command(Command::FailedToConnect(error))
    }

    pub fn with_user_info<R>(&self, f: impl FnOnce(&mut UserInfo) -> R) -> R {
        let mut guard = self.user_info.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Stops the device task. Pending operations resolve with
    /// `OperationError::Interrupted`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn command(&self, command: Command) -> Result<(), DeviceError> {
        self.commands.send(command).map_err(|_| DeviceError::Closed)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.command(build(reply))?;
        rx.await.map_err(|_| DeviceError::Closed)
    }
}

struct DeviceCore {
    label: String,
    descriptor: Arc<EndpointDescriptor>,
    transport: Box<dyn TransportPort>,
    monitor: DiscoveryMonitor,
    engine: OperationEngine,
    cache: ValueCache,
    state: InterfaceState,
    state_tx: watch::Sender<InterfaceState>,
    events: broadcast::Sender<DeviceEvent>,
    timeouts: mpsc::UnboundedSender<u64>,
    current_waiters: Vec<Reply<()>>,
    ready_waiters: Vec<Reply<Result<(), DeviceError>>>,
    cancel: CancellationToken,
}

/// Borrowed view of the core handed to the engine while it dispatches.
struct Dispatch<'a> {
    link: Link<'a>,
    events: &'a broadcast::Sender<DeviceEvent>,
    timeouts: &'a mpsc::UnboundedSender<u64>,
    cancel: &'a CancellationToken,
    current_waiters: &'a mut Vec<Reply<()>>,
}

impl DispatchContext for Dispatch<'_> {
    fn link(&mut self) -> &mut dyn Interactor {
        &mut self.link
    }

    fn schedule_timeout(&mut self, generation: u64, after: Duration) {
        let timeouts = self.timeouts.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = timeouts.send(generation);
                }
            }
        });
    }

    fn will_execute(&mut self, op: &dyn Operation) {
        let _ = self.events.send(DeviceEvent::OperationWillExecute {
            name: op.name().clone(),
        });
    }

    fn did_finish(&mut self, op: &dyn Operation) {
        let _ = self.events.send(DeviceEvent::OperationDidFinish {
            name: op.name().clone(),
            error: op.error().cloned(),
        });
        for waiter in self.current_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

impl DeviceCore {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: TransportEventReceiver,
        mut timeouts: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            // Callbacks already delivered are handled before newer commands.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                Some(generation) = timeouts.recv() => {
                    self.with_engine(|engine, ctx| engine.handle_timeout(generation, ctx));
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        info!("[{}] device task stopping", self.label);
        self.cancel.cancel();
        self.engine.pause();
        self.with_engine(|engine, ctx| engine.drop_all(OperationError::Interrupted, ctx));
        self.fail_ready_waiters(DeviceError::Closed);
    }

    /// Runs an engine call with a dispatch context, then republishes the
    /// interface state.
    fn with_engine<R>(
        &mut self,
        f: impl FnOnce(&mut OperationEngine, &mut dyn DispatchContext) -> R,
    ) -> R {
        let mut ctx = Dispatch {
            link: Link::new(&self.descriptor, self.transport.as_mut(), &self.cache),
            events: &self.events,
            timeouts: &self.timeouts,
            cancel: &self.cancel,
            current_waiters: &mut self.current_waiters,
        };
        let result = f(&mut self.engine, &mut ctx);
        self.refresh_state();
        result
    }

    fn link(&mut self) -> Link<'_> {
        Link::new(&self.descriptor, self.transport.as_mut(), &self.cache)
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn refresh_state(&mut self) {
        let next = if self.monitor.is_scanning() {
            InterfaceState::Preparing
        } else if self.engine.is_paused() {
            InterfaceState::Initial
        } else if self.engine.current().is_some() {
            InterfaceState::Busy
        } else {
            InterfaceState::Ready
        };
        if next != self.state {
            debug!("[{}] interface state {:?} -> {:?}", self.label, self.state, next);
            self.state = next;
            self.state_tx.send_replace(next);
            self.emit(DeviceEvent::InterfaceStateChanged(next));
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Prepare => {
                let status = self.monitor.scan(self.transport.as_mut());
                self.on_scan_status(status);
            }
            Command::WaitReady(reply) => {
                if matches!(self.state, InterfaceState::Ready | InterfaceState::Busy) {
                    let _ = reply.send(Ok(()));
                } else {
                    self.ready_waiters.push(reply);
                }
            }
            Command::Execute(mut entry) => {
                if self.state == InterfaceState::Initial {
                    let op = entry.operation_mut();
                    warn!("[{}] rejecting {}: device not prepared", self.label, op.name());
                    op.on_external_error(DeviceError::NotPrepared.into());
                    if op.error().is_none() {
                        op.state_mut().fail(DeviceError::NotPrepared.into());
                    }
                    entry.retire();
                    return;
                }
                self.with_engine(move |engine, ctx| {
                    engine.push(entry);
                    engine.dispatch(ctx);
                });
            }
            Command::DropCurrent => {
                self.with_engine(|engine, ctx| engine.drop_current(OperationError::Interrupted, ctx));
            }
            Command::DropAll => {
                self.with_engine(|engine, ctx| engine.drop_all(OperationError::Interrupted, ctx));
            }
            Command::WaitCurrent(reply) => {
                if self.engine.current().is_none() {
                    let _ = reply.send(());
                } else {
                    self.current_waiters.push(reply);
                }
            }
            Command::Send {
                payload,
                characteristic,
                reply,
            } => {
                self.emit(DeviceEvent::WillSendData {
                    characteristic,
                    payload: payload.clone(),
                });
                let result = self.link().send(&payload, characteristic);
                if result.is_ok() {
                    self.emit(DeviceEvent::DidSendData {
                        characteristic,
                        payload,
                    });
                }
                let _ = reply.send(result.map_err(DeviceError::from));
            }
            Command::Read {
                characteristic,
                reply,
            } => {
                let result = self.link().read_value(characteristic);
                let _ = reply.send(result.map_err(DeviceError::from));
            }
            Command::CachedValue {
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.cache.get(characteristic).map(<[u8]>::to_vec));
            }
            Command::RetrieveData {
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.link().retrieve_data(characteristic));
            }
            Command::Discovery(reply) => {
                let _ = reply.send(self.monitor.state(self.transport.as_ref()));
            }
            Command::DropCache => self.cache.clear(),
            Command::Connected => {
                info!("[{}] connected", self.label);
                self.emit(DeviceEvent::Connected);
            }
            Command::Disconnected(error) => self.on_disconnected(error),
            Command::FailedToConnect(error) => {
                warn!("[{}] failed to connect: {:?}", self.label, error);
                self.emit(DeviceEvent::FailedToConnect { error });
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ServicesDiscovered { .. }
            | TransportEvent::CharacteristicsDiscovered { .. }
            | TransportEvent::NotificationStateChanged { .. } => {
                if let Some(status) = self.monitor.handle_event(&event, self.transport.as_mut()) {
                    self.on_scan_status(status);
                }
            }
            TransportEvent::ValueUpdated {
                characteristic,
                payload,
                error,
            } => {
                self.cache.store(characteristic, payload.clone());
                if self.engine.claims_update(characteristic, payload.as_deref()) {
                    let data = self.cache.take(characteristic);
                    self.with_engine(|engine, ctx| {
                        engine.deliver_update(characteristic, data.as_deref(), error.as_ref(), ctx)
                    });
                } else {
                    debug!("[{}] passive update on {}", self.label, characteristic);
                    self.emit(DeviceEvent::CharacteristicUpdated {
                        characteristic,
                        payload,
                        error,
                    });
                }
            }
            TransportEvent::ValueWritten {
                characteristic,
                error,
            } => {
                if self.engine.claims_write(characteristic) {
                    self.with_engine(|engine, ctx| {
                        engine.deliver_written(characteristic, error.as_ref(), ctx)
                    });
                } else {
                    debug!("[{}] passive write ack on {}", self.label, characteristic);
                    self.emit(DeviceEvent::CharacteristicWritten {
                        characteristic,
                        error,
                    });
                }
            }
        }
    }

    fn on_scan_status(&mut self, status: ScanStatus) {
        match status {
            ScanStatus::AlreadyScanning => {}
            ScanStatus::InProgress => {
                self.engine.pause();
                self.refresh_state();
            }
            ScanStatus::Finished => {
                self.emit(DeviceEvent::InitializationFinished { error: None });
                self.with_engine(|engine, ctx| engine.resume(ctx));
                for waiter in self.ready_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ScanStatus::Failed(e) => {
                error!("[{}] preparation failed: {}", self.label, e);
                let failure = DeviceError::Discovery(e);
                self.emit(DeviceEvent::InitializationFinished {
                    error: Some(failure.clone()),
                });
                self.engine.pause();
                self.engine.fail_queued(failure.clone().into());
                self.refresh_state();
                self.fail_ready_waiters(failure);
            }
        }
    }

    fn on_disconnected(&mut self, error: Option<TransportError>) {
        info!("[{}] disconnected: {:?}", self.label, error);
        self.monitor.reset();
        self.engine.pause();
        self.with_engine(|engine, ctx| engine.drop_all(OperationError::Disconnected, ctx));
        self.cache.clear();
        self.fail_ready_waiters(DeviceError::NotPrepared);
        self.emit(DeviceEvent::Disconnected { error });
    }

    fn fail_ready_waiters(&mut self, error: DeviceError) {
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
