//! The per-device connection state machine.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use async_io::Timer;
use futures_channel::mpsc;
use futures_lite::{StreamExt, future};
use gatt::error::AttError;
use gatt::value::{FromValue, IntoValue};
use gatt::{
    AdapterState, BluetoothUuid, CharacteristicDescriptor, CharacteristicId, ConnectionState,
    DeviceIdentity, ServiceDescriptor, Transport, TransportEvent, Uuid, WriteType,
    find_characteristic, find_characteristic_mut,
};
use local_executor::Executor;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::operation::{Completion, Operation, OperationOutput, PendingOperation, Responder};
use crate::queue::OperationQueue;
use crate::util::{EventReceiver, EventSender, defer};

/// The lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    /// The only state in which application operations are dispatched.
    Ready,
    Disconnecting,
    /// Transient: the link failed and every pending operation is being failed.
    Error,
}

impl SessionState {
    fn connection_state(self) -> ConnectionState {
        match self {
            SessionState::Idle | SessionState::Error => ConnectionState::Disconnected,
            SessionState::Connecting => ConnectionState::Connecting,
            SessionState::DiscoveringServices
            | SessionState::DiscoveringCharacteristics
            | SessionState::Ready => ConnectionState::Connected,
            SessionState::Disconnecting => ConnectionState::Disconnecting,
        }
    }
}

/// Something observable that happened to a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Characteristic discovery failed for one service. The session continues without it.
    ServiceDegraded {
        service: BluetoothUuid,
        error: Error,
    },
    /// A new value from a read, notification or indication.
    ValueUpdated {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    NameUpdated(Option<String>),
    /// The link dropped without a disconnect request.
    LinkLost {
        error: Option<gatt::Error>,
        will_retry: bool,
    },
}

/// A connection to one device.
///
/// A session owns the device's connection lifecycle, its discovered services, and a queue that
/// dispatches one operation at a time to the transport. Cloning a `Session` yields another
/// handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("queued", &self.inner.queue.borrow().len())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

struct SessionInner {
    id: Uuid,
    device: RefCell<DeviceIdentity>,
    state: Cell<SessionState>,
    services: RefCell<Vec<ServiceDescriptor>>,
    /// Indexes into `services` of the characteristic discoveries still outstanding, in dispatch
    /// order. A device may expose several instances of one service UUID.
    pending_discovery: RefCell<VecDeque<usize>>,
    /// Set when the adapter powered off under a link that should come back with it.
    reconnect_on_power: Cell<bool>,
    queue: RefCell<OperationQueue>,
    in_flight: RefCell<Option<InFlight>>,
    /// Bumped whenever the link is torn down, so late completions from an older link are ignored.
    epoch: Cell<u64>,
    idle_since: Cell<Option<Instant>>,
    events: EventSender<SessionEvent>,
    wake: mpsc::UnboundedSender<()>,
    transport: Rc<dyn Transport>,
    config: Rc<SessionConfig>,
    sequence: Rc<Cell<u64>>,
}

struct InFlight {
    seq: u64,
    is_disconnect: bool,
    responder: Option<Responder>,
    cancel: mpsc::UnboundedSender<Cancel>,
}

/// A request to stop waiting for the in-flight operation. A later `Now` overrides a pending
/// grace period.
enum Cancel {
    Now(ErrorKind),
    AfterGrace(Duration),
}

enum Outcome {
    Completed(gatt::Result<OperationOutput>),
    TimedOut,
    Cancelled(ErrorKind),
}

impl Session {
    pub(crate) fn new(
        device: DeviceIdentity,
        transport: Rc<dyn Transport>,
        config: Rc<SessionConfig>,
        sequence: Rc<Cell<u64>>,
        executor: &Executor,
    ) -> Self {
        let (wake, wake_receiver) = mpsc::unbounded();
        let inner = Rc::new(SessionInner {
            id: device.id(),
            device: RefCell::new(device),
            state: Cell::new(SessionState::Idle),
            services: RefCell::new(Vec::new()),
            pending_discovery: RefCell::new(VecDeque::new()),
            reconnect_on_power: Cell::new(false),
            queue: RefCell::new(OperationQueue::default()),
            in_flight: RefCell::new(None),
            epoch: Cell::new(0),
            idle_since: Cell::new(Some(Instant::now())),
            events: EventSender::new(config.event_capacity),
            wake,
            transport,
            config,
            sequence,
        });

        executor
            .spawn_local(drive(Rc::downgrade(&inner), wake_receiver))
            .detach();

        Session { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// A snapshot of the device this session is connected to.
    pub fn device(&self) -> DeviceIdentity {
        self.inner.device.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// A snapshot of the discovered services. Empty unless the session is connected.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.inner.services.borrow().clone()
    }

    pub fn service(&self, uuid: &BluetoothUuid) -> Option<ServiceDescriptor> {
        self.inner
            .services
            .borrow()
            .iter()
            .find(|s| s.uuid() == uuid)
            .cloned()
    }

    /// A snapshot of one characteristic, including its cached value.
    pub fn characteristic(&self, id: &CharacteristicId) -> Option<CharacteristicDescriptor> {
        find_characteristic(&self.inner.services.borrow(), id).cloned()
    }

    /// Returns a new stream of this session's events.
    ///
    /// The stream only carries events that happen after this call and never ends while the
    /// session exists.
    pub fn observe(&self) -> EventReceiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Starts connecting.
    ///
    /// The returned completion resolves when the link is up; discovery then runs automatically.
    /// Use [`ready()`][Self::ready] to wait for the session to become usable.
    pub fn connect(&self) -> Completion {
        self.inner.connect()
    }

    /// Disconnects, discarding queued operations.
    pub fn disconnect(&self) -> Completion {
        self.inner.disconnect()
    }

    /// Queues an operation without blocking.
    pub fn submit(&self, operation: Operation) -> Completion {
        self.inner.submit(operation)
    }

    /// Waits until the session is ready.
    pub async fn ready(&self) -> Result<()> {
        let mut events = self.observe();
        loop {
            match self.state() {
                SessionState::Ready => return Ok(()),
                SessionState::Idle | SessionState::Error => return Err(ErrorKind::NotReady.into()),
                SessionState::Disconnecting => return Err(ErrorKind::SessionClosing.into()),
                _ => {}
            }

            loop {
                match events.recv().await {
                    Ok(SessionEvent::StateChanged { to, .. }) => match to {
                        SessionState::Ready => return Ok(()),
                        SessionState::Error | SessionState::Idle => {
                            return Err(ErrorKind::LinkLost.into());
                        }
                        SessionState::Disconnecting => {
                            return Err(ErrorKind::SessionClosing.into());
                        }
                        _ => {}
                    },
                    Ok(_) => {}
                    // Missed events; fall back to the current state.
                    Err(async_broadcast::RecvError::Overflowed(_)) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    pub async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>> {
        match self.submit(Operation::DiscoverServices).await? {
            OperationOutput::Services(services) => Ok(services),
            output => Err(unexpected(output)),
        }
    }

    pub async fn discover_characteristics(
        &self,
        service: &BluetoothUuid,
    ) -> Result<Vec<CharacteristicDescriptor>> {
        match self
            .submit(Operation::DiscoverCharacteristics(service.clone()))
            .await?
        {
            OperationOutput::Characteristics(characteristics) => Ok(characteristics),
            output => Err(unexpected(output)),
        }
    }

    /// Reads the value of a characteristic.
    pub async fn read(&self, characteristic: &CharacteristicId) -> Result<Vec<u8>> {
        match self.submit(Operation::Read(characteristic.clone())).await? {
            OperationOutput::Value(value) => Ok(value),
            output => Err(unexpected(output)),
        }
    }

    /// Reads a characteristic and decodes it as `T`.
    pub async fn read_as<T: FromValue>(&self, characteristic: &CharacteristicId) -> Result<T> {
        let value = self.read(characteristic).await?;
        T::from_value(&value).ok_or_else(|| {
            Error::transport(
                ErrorKind::Operation,
                AttError::INVALID_ATTRIBUTE_VALUE_LENGTH.into(),
            )
        })
    }

    /// Writes raw bytes to a characteristic.
    pub async fn write(
        &self,
        characteristic: &CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<()> {
        let operation = Operation::Write {
            characteristic: characteristic.clone(),
            value,
            write_type,
        };
        match self.submit(operation).await? {
            OperationOutput::Written => Ok(()),
            output => Err(unexpected(output)),
        }
    }

    /// Encodes `value` and writes it to a characteristic.
    pub async fn write_value(
        &self,
        characteristic: &CharacteristicId,
        value: impl IntoValue,
        write_type: WriteType,
    ) -> Result<()> {
        self.write(characteristic, value.into_value(), write_type)
            .await
    }

    /// Enables or disables notifications for a characteristic.
    pub async fn set_notify(
        &self,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<bool> {
        let operation = Operation::SetNotify {
            characteristic: characteristic.clone(),
            enabled,
        };
        match self.submit(operation).await? {
            OperationOutput::Notifying(notifying) => Ok(notifying),
            output => Err(unexpected(output)),
        }
    }

    /// Reads the RSSI of the link.
    pub async fn read_rssi(&self) -> Result<i16> {
        match self.submit(Operation::ReadRssi).await? {
            OperationOutput::Rssi(rssi) => Ok(rssi),
            output => Err(unexpected(output)),
        }
    }

    pub(crate) fn handle_event(&self, event: TransportEvent) {
        self.inner.handle_event(event)
    }

    pub(crate) fn adapter_changed(&self, state: AdapterState) {
        self.inner.adapter_changed(state)
    }

    /// When the session last became idle, or `None` while it is active.
    pub(crate) fn idle_since(&self) -> Option<Instant> {
        self.inner.idle_since.get()
    }

    /// Whether handles other than the manager's exist.
    pub(crate) fn is_shared(&self) -> bool {
        Rc::strong_count(&self.inner) > 1
    }
}

fn unexpected(output: OperationOutput) -> Error {
    warn!(?output, "transport returned an output of the wrong kind");
    ErrorKind::Operation.into()
}

async fn drive(session: Weak<SessionInner>, mut wake: mpsc::UnboundedReceiver<()>) {
    loop {
        let next = match session.upgrade() {
            Some(inner) => inner.next_operation().map(|pending| (inner, pending)),
            None => return,
        };

        match next {
            Some((inner, pending)) => inner.dispatch(pending).await,
            None => {
                if wake.next().await.is_none() {
                    return;
                }
            }
        }
    }
}

impl SessionInner {
    fn next_seq(&self) -> u64 {
        let seq = self.sequence.get() + 1;
        self.sequence.set(seq);
        seq
    }

    fn wake(&self) {
        let _ = self.wake.unbounded_send(());
    }

    fn enqueue(&self, pending: PendingOperation) {
        self.queue.borrow_mut().push(pending);
        self.wake();
    }

    fn enqueue_internal(&self, operation: Operation, lifecycle: bool) {
        let pending = PendingOperation::internal(self.next_seq(), operation, lifecycle);
        self.enqueue(pending);
    }

    fn next_operation(&self) -> Option<PendingOperation> {
        let ready = self.state.get() == SessionState::Ready;
        self.queue.borrow_mut().pop_next(ready)
    }

    fn set_state(&self, to: SessionState) {
        let from = self.state.replace(to);
        if from == to {
            return;
        }

        debug!(device = %self.id, ?from, ?to, "session state changed");
        {
            let mut device = self.device.borrow_mut();
            device.set_state(to.connection_state());
            device.touch();
        }
        self.idle_since
            .set((to == SessionState::Idle).then(Instant::now));
        self.events.send(SessionEvent::StateChanged { from, to });
        self.wake();
    }

    fn connect(&self) -> Completion {
        let (pending, completion) =
            PendingOperation::new(self.next_seq(), Operation::Connect, true);
        if self.state.get() == SessionState::Idle {
            self.begin_connect(pending);
        } else {
            pending.fail(ErrorKind::NotReady);
        }
        completion
    }

    fn begin_connect(&self, pending: PendingOperation) {
        self.reconnect_on_power.set(false);
        self.set_state(SessionState::Connecting);
        self.enqueue(pending);
    }

    fn disconnect(&self) -> Completion {
        let (pending, completion) =
            PendingOperation::new(self.next_seq(), Operation::Disconnect, true);

        match self.state.get() {
            SessionState::Idle => {
                self.reconnect_on_power.set(false);
                pending.resolve(Ok(OperationOutput::Disconnected));
            }
            // The disconnect already at the front will bring the session down; this one
            // resolves right after it.
            SessionState::Disconnecting => self.enqueue(pending),
            _ => {
                self.set_state(SessionState::Disconnecting);
                self.pending_discovery.borrow_mut().clear();
                let displaced = self.queue.borrow_mut().push_disconnect(pending);
                for entry in displaced {
                    entry.fail(ErrorKind::SessionClosing);
                }
                self.cancel_in_flight(Cancel::AfterGrace(self.config.disconnect_grace));
                self.wake();
            }
        }

        completion
    }

    fn submit(&self, operation: Operation) -> Completion {
        match operation {
            Operation::Connect => return self.connect(),
            Operation::Disconnect => return self.disconnect(),
            _ => {}
        }

        let (pending, completion) = PendingOperation::new(self.next_seq(), operation, false);
        match self.state.get() {
            SessionState::Ready => self.enqueue(pending),
            SessionState::Idle if self.config.auto_connect => {
                debug!(device = %self.id, "connecting on demand");
                let connect = PendingOperation::internal(self.next_seq(), Operation::Connect, true);
                self.begin_connect(connect);
                self.enqueue(pending);
            }
            SessionState::Connecting
            | SessionState::DiscoveringServices
            | SessionState::DiscoveringCharacteristics
                if self.config.auto_connect =>
            {
                self.enqueue(pending)
            }
            _ => pending.fail(ErrorKind::NotReady),
        }
        completion
    }

    fn cancel_in_flight(&self, cancel: Cancel) {
        if let Some(in_flight) = self.in_flight.borrow().as_ref() {
            trace!(device = %self.id, seq = in_flight.seq, "cancelling in-flight operation");
            let _ = in_flight.cancel.unbounded_send(cancel);
        }
    }

    /// Checks an application operation against the discovered attributes.
    fn validate(&self, operation: &Operation) -> Result<()> {
        let services = self.services.borrow();

        if let Operation::DiscoverCharacteristics(service) = operation {
            if !services.iter().any(|s| s.uuid() == service) {
                return Err(Error::transport(
                    ErrorKind::Discovery,
                    gatt::Error::new(gatt::ErrorKind::InvalidParameters, "unknown service"),
                ));
            }
            return Ok(());
        }

        let Some(id) = operation.characteristic() else {
            return Ok(());
        };
        let Some(characteristic) = find_characteristic(&services, id) else {
            return Err(Error::transport(
                ErrorKind::Operation,
                gatt::Error::new(gatt::ErrorKind::InvalidParameters, "unknown characteristic"),
            ));
        };

        let properties = characteristic.properties();
        let rejected = match operation {
            Operation::Read(_) if !properties.contains(gatt::CharacteristicProperties::READ) => {
                Some(AttError::READ_NOT_PERMITTED)
            }
            Operation::Write { write_type, .. } if !properties.can_write(*write_type) => {
                Some(AttError::WRITE_NOT_PERMITTED)
            }
            Operation::SetNotify { .. } if !properties.can_subscribe() => {
                Some(AttError::REQUEST_NOT_SUPPORTED)
            }
            _ => None,
        };

        match rejected {
            Some(att_error) => Err(Error::transport(ErrorKind::Operation, att_error.into())),
            None => Ok(()),
        }
    }

    async fn dispatch(&self, pending: PendingOperation) {
        let PendingOperation {
            seq,
            operation,
            responder,
            lifecycle,
        } = pending;

        if operation == Operation::Disconnect && self.state.get() == SessionState::Idle {
            if let Some(responder) = responder {
                responder.resolve(Ok(OperationOutput::Disconnected));
            }
            return;
        }

        if !lifecycle {
            if let Err(error) = self.validate(&operation) {
                debug!(device = %self.id, seq, %error, "operation rejected before dispatch");
                if let Some(responder) = responder {
                    responder.resolve(Err(error));
                }
                return;
            }
        }

        let epoch = self.epoch.get();
        let (cancel, mut cancel_signal) = mpsc::unbounded();
        *self.in_flight.borrow_mut() = Some(InFlight {
            seq,
            is_disconnect: operation == Operation::Disconnect,
            responder,
            cancel,
        });
        let guard = defer(|| {
            self.in_flight.borrow_mut().take();
        });

        let deadline = self.config.timeouts.for_operation(&operation);
        debug!(device = %self.id, seq, ?operation, "dispatching");

        let completed = async { Outcome::Completed(self.call_transport(&operation).await) };
        let cancelled = async {
            let mut grace_ends: Option<Instant> = None;
            loop {
                let signal = match grace_ends {
                    Some(at) => {
                        let grace = async {
                            Timer::at(at).await;
                            Some(Cancel::Now(ErrorKind::SessionClosing))
                        };
                        future::or(cancel_signal.next(), grace).await
                    }
                    None => cancel_signal.next().await,
                };
                match signal {
                    Some(Cancel::Now(kind)) => return Outcome::Cancelled(kind),
                    Some(Cancel::AfterGrace(grace)) => {
                        let at = Instant::now() + grace;
                        grace_ends = Some(grace_ends.map_or(at, |ends| ends.min(at)));
                    }
                    None => future::pending::<()>().await,
                }
            }
        };
        let timed_out = async {
            Timer::after(deadline).await;
            Outcome::TimedOut
        };
        let outcome = future::or(completed, future::or(cancelled, timed_out)).await;

        guard.defuse();
        let responder = self
            .in_flight
            .borrow_mut()
            .take()
            .and_then(|in_flight| in_flight.responder);

        let result = match outcome {
            Outcome::Completed(result) => {
                result.map_err(|error| Error::transport(operation.failure_kind(), error))
            }
            Outcome::TimedOut => {
                warn!(device = %self.id, seq, ?operation, ?deadline, "operation timed out");
                if operation == Operation::Connect {
                    self.abort_connect().await;
                }
                Err(ErrorKind::Timeout.into())
            }
            Outcome::Cancelled(kind) => Err(kind.into()),
        };

        if self.epoch.get() == epoch {
            self.apply(&operation, lifecycle, &result);
        } else {
            trace!(device = %self.id, seq, "ignoring completion from a previous link");
        }

        if let Some(responder) = responder {
            responder.resolve(result);
        }
    }

    async fn call_transport(&self, operation: &Operation) -> gatt::Result<OperationOutput> {
        let id = self.id;
        let transport = &self.transport;
        match operation {
            Operation::Connect => transport
                .connect(id)
                .await
                .map(|_| OperationOutput::Connected),
            Operation::Disconnect => transport
                .disconnect(id)
                .await
                .map(|_| OperationOutput::Disconnected),
            Operation::DiscoverServices => transport
                .discover_services(id, self.config.service_filter.as_deref())
                .await
                .map(OperationOutput::Services),
            Operation::DiscoverCharacteristics(service) => transport
                .discover_characteristics(id, service)
                .await
                .map(OperationOutput::Characteristics),
            Operation::Read(characteristic) => transport
                .read(id, characteristic)
                .await
                .map(OperationOutput::Value),
            Operation::Write {
                characteristic,
                value,
                write_type,
            } => transport
                .write(id, characteristic, value, *write_type)
                .await
                .map(|_| OperationOutput::Written),
            Operation::SetNotify {
                characteristic,
                enabled,
            } => transport
                .set_notify(id, characteristic, *enabled)
                .await
                .map(OperationOutput::Notifying),
            Operation::ReadRssi => transport.read_rssi(id).await.map(OperationOutput::Rssi),
        }
    }

    /// Cancels a connection attempt the transport may still be pursuing.
    async fn abort_connect(&self) {
        let deadline = self.config.timeouts.disconnect;
        let disconnect = async {
            if let Err(error) = self.transport.disconnect(self.id).await {
                debug!(device = %self.id, %error, "cancelling connection attempt failed");
            }
        };
        future::or(disconnect, async {
            Timer::after(deadline).await;
        })
        .await;
    }

    /// Applies the effect of a completed operation to the state machine.
    fn apply(&self, operation: &Operation, lifecycle: bool, result: &Result<OperationOutput>) {
        let state = self.state.get();
        match (operation, result) {
            (Operation::Connect, Ok(_)) => {
                if state == SessionState::Connecting {
                    self.set_state(SessionState::DiscoveringServices);
                    self.enqueue_internal(Operation::DiscoverServices, true);
                }
            }
            (Operation::Connect, Err(error)) => {
                if state == SessionState::Connecting {
                    warn!(device = %self.id, %error, "connect failed");
                    self.fail_link(ErrorKind::LinkLost);
                }
            }
            (Operation::DiscoverServices, Ok(OperationOutput::Services(services))) => {
                if matches!(state, SessionState::DiscoveringServices | SessionState::Ready) {
                    self.begin_characteristic_discovery(services.clone());
                }
            }
            (Operation::DiscoverServices, Err(error)) => {
                if state == SessionState::DiscoveringServices {
                    warn!(device = %self.id, %error, "service discovery failed");
                    self.abandon_link(error.kind());
                }
            }
            (Operation::DiscoverCharacteristics(service), result) => {
                self.finish_characteristic_discovery(service, lifecycle, result);
            }
            (Operation::Read(id), Ok(OperationOutput::Value(value))) => {
                self.update_value(id, value.clone());
            }
            (Operation::SetNotify { characteristic, .. }, Ok(OperationOutput::Notifying(on))) => {
                let mut services = self.services.borrow_mut();
                if let Some(c) = find_characteristic_mut(&mut services, characteristic) {
                    c.set_notifying(*on);
                }
            }
            (Operation::SetNotify { characteristic, .. }, Err(error)) if !lifecycle => {
                debug!(device = %self.id, ?characteristic, %error, "set notify failed");
            }
            (Operation::ReadRssi, Ok(OperationOutput::Rssi(rssi))) => {
                self.device.borrow_mut().set_rssi(Some(*rssi));
            }
            (Operation::Disconnect, result) => {
                if let Err(error) = result {
                    debug!(device = %self.id, %error, "disconnect reported an error");
                }
                if state == SessionState::Disconnecting {
                    self.go_idle();
                }
            }
            _ => {}
        }
    }

    fn begin_characteristic_discovery(&self, services: Vec<ServiceDescriptor>) {
        let uuids: Vec<BluetoothUuid> = services.iter().map(|s| s.uuid().clone()).collect();
        debug!(device = %self.id, services = uuids.len(), "services discovered");
        *self.services.borrow_mut() = services;

        if uuids.is_empty() {
            self.become_ready();
            return;
        }

        self.set_state(SessionState::DiscoveringCharacteristics);
        *self.pending_discovery.borrow_mut() = (0..uuids.len()).collect();
        for uuid in uuids {
            self.enqueue_internal(Operation::DiscoverCharacteristics(uuid), true);
        }
    }

    fn finish_characteristic_discovery(
        &self,
        service: &BluetoothUuid,
        lifecycle: bool,
        result: &Result<OperationOutput>,
    ) {
        // Discovery rounds run in service order, so each lifecycle completion belongs to the
        // oldest outstanding instance. Anything else applies to every instance of the UUID.
        let instance = if lifecycle {
            self.pending_discovery.borrow_mut().pop_front()
        } else {
            None
        };

        {
            let mut services = self.services.borrow_mut();
            let targets = services.iter_mut().enumerate().filter(|(index, s)| {
                s.uuid() == service && instance.is_none_or(|instance| instance == *index)
            });
            for (_, descriptor) in targets {
                match result {
                    Ok(OperationOutput::Characteristics(characteristics)) => {
                        descriptor.set_characteristics(characteristics.clone());
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(
                            device = %self.id,
                            ?service,
                            %error,
                            "characteristic discovery failed"
                        );
                        descriptor.mark_degraded();
                        self.events.send(SessionEvent::ServiceDegraded {
                            service: service.clone(),
                            error: error.clone(),
                        });
                    }
                }
            }
        }

        if instance.is_some()
            && self.pending_discovery.borrow().is_empty()
            && self.state.get() == SessionState::DiscoveringCharacteristics
        {
            self.become_ready();
        }
    }

    fn become_ready(&self) {
        self.set_state(SessionState::Ready);

        let subscribe: Vec<CharacteristicId> = {
            let services = self.services.borrow();
            self.config
                .auto_subscribe
                .iter()
                .filter(|id| {
                    find_characteristic(&services, id)
                        .is_some_and(|c| c.properties().can_subscribe() && !c.is_notifying())
                })
                .cloned()
                .collect()
        };
        for characteristic in subscribe {
            self.enqueue_internal(
                Operation::SetNotify {
                    characteristic,
                    enabled: true,
                },
                false,
            );
        }
    }

    fn update_value(&self, id: &CharacteristicId, value: Vec<u8>) {
        let updated = match find_characteristic_mut(&mut self.services.borrow_mut(), id) {
            Some(characteristic) => {
                characteristic.set_value(Some(value.clone()));
                true
            }
            None => false,
        };

        if updated {
            self.events.send(SessionEvent::ValueUpdated {
                characteristic: id.clone(),
                value,
            });
        } else {
            trace!(device = %self.id, ?id, "value for unknown characteristic dropped");
        }
    }

    /// Clears everything tied to the current link and returns to idle.
    fn go_idle(&self) {
        self.epoch.set(self.epoch.get() + 1);
        self.pending_discovery.borrow_mut().clear();
        self.services.borrow_mut().clear();
        self.set_state(SessionState::Idle);
    }

    /// Fails every pending operation and returns to idle.
    fn fail_link(&self, kind: ErrorKind) {
        self.set_state(SessionState::Error);

        if let Some(in_flight) = self.in_flight.borrow_mut().as_mut() {
            if let Some(responder) = in_flight.responder.take() {
                responder.resolve(Err(kind.into()));
            }
        }
        self.cancel_in_flight(Cancel::Now(kind));

        let queued = self.queue.borrow_mut().drain();
        for entry in queued {
            entry.fail(kind);
        }

        self.go_idle();
    }

    /// Gives up on a link that is up but unusable, disconnecting it.
    fn abandon_link(&self, kind: ErrorKind) {
        self.set_state(SessionState::Error);
        let queued = self.queue.borrow_mut().drain();
        for entry in queued {
            entry.fail(kind);
        }
        self.set_state(SessionState::Disconnecting);
        self.enqueue_internal(Operation::Disconnect, true);
    }

    fn link_lost(&self, error: Option<gatt::Error>) {
        if self.drop_link(error) == Some(true) {
            let connect = PendingOperation::internal(self.next_seq(), Operation::Connect, true);
            self.begin_connect(connect);
        }
    }

    /// Tears down a link the transport reports gone. Returns whether the link should be
    /// reestablished, or `None` if there was no link to lose.
    fn drop_link(&self, error: Option<gatt::Error>) -> Option<bool> {
        match self.state.get() {
            SessionState::Idle | SessionState::Error => return None,
            SessionState::Disconnecting => {
                let in_flight_is_disconnect = self
                    .in_flight
                    .borrow()
                    .as_ref()
                    .is_some_and(|in_flight| in_flight.is_disconnect);
                if !in_flight_is_disconnect {
                    self.cancel_in_flight(Cancel::Now(ErrorKind::SessionClosing));
                }
                return None;
            }
            _ => {}
        }

        // A link that never came up is not retried.
        let will_retry =
            self.config.auto_reconnect && self.state.get() != SessionState::Connecting;
        match &error {
            Some(error) => warn!(device = %self.id, %error, will_retry, "link lost"),
            None => warn!(device = %self.id, will_retry, "link lost"),
        }

        self.fail_link(ErrorKind::LinkLost);
        self.events
            .send(SessionEvent::LinkLost { error, will_retry });
        Some(will_retry)
    }

    fn adapter_changed(&self, state: AdapterState) {
        match state {
            AdapterState::PoweredOn => {
                if self.reconnect_on_power.get() && self.state.get() == SessionState::Idle {
                    debug!(device = %self.id, "adapter powered on, reconnecting");
                    let connect =
                        PendingOperation::internal(self.next_seq(), Operation::Connect, true);
                    self.begin_connect(connect);
                }
                return;
            }
            // Reported while the radio is still starting up.
            AdapterState::Unknown => return,
            _ => {}
        }

        let error = gatt::Error::new(
            gatt::ErrorKind::AdapterUnavailable,
            format!("adapter {state:?}"),
        );
        if let Some(will_retry) = self.drop_link(Some(error)) {
            // Reconnecting now would only fail; wait for the radio instead.
            self.reconnect_on_power.set(will_retry);
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered { name, rssi, .. } => {
                let mut device = self.device.borrow_mut();
                if name.is_some() {
                    device.set_name(name);
                }
                if rssi.is_some() {
                    device.set_rssi(rssi);
                }
                device.touch();
            }
            TransportEvent::NameUpdated { name, .. } => {
                self.device.borrow_mut().set_name(name.clone());
                self.events.send(SessionEvent::NameUpdated(name));
            }
            TransportEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                error,
                ..
            } => self.link_lost(error),
            TransportEvent::ConnectionStateChanged { state, .. } => {
                trace!(device = %self.id, ?state, "connection state reported");
            }
            TransportEvent::CharacteristicValueUpdated {
                characteristic,
                value,
                ..
            } => match self.state.get() {
                SessionState::DiscoveringCharacteristics
                | SessionState::Ready
                | SessionState::Disconnecting => self.update_value(&characteristic, value),
                state => {
                    trace!(device = %self.id, ?state, "value update outside a connection dropped");
                }
            },
            TransportEvent::LinkError { error, .. } => self.link_lost(Some(error)),
            TransportEvent::AdapterStateChanged(state) => self.adapter_changed(state),
        }
    }
}
