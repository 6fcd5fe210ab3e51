use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use async_io::Timer;
use futures_lite::StreamExt;
use futures_lite::stream::BoxedLocal;
use gatt::{AdapterState, DeviceIdentity, Transport, TransportEvent, Uuid};
use local_executor::{Executor, Task};
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::operation::{Completion, Operation, OperationOutput, PendingOperation};
use crate::session::{Session, SessionEvent};
use crate::util::{EventReceiver, EventSender};

/// Owns one [`Session`] per device and routes transport events to them.
///
/// The manager also keeps a registry of every device the transport has reported, so a session
/// can be created with the device's last known name and signal strength. Once a device has a
/// session, the session's record is the authoritative one.
#[derive(Clone)]
pub struct SessionManager {
    inner: Rc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.sessions.borrow().len())
            .field("devices", &self.inner.devices.borrow().len())
            .finish()
    }
}

struct ManagerInner {
    transport: Rc<dyn Transport>,
    executor: Executor,
    config: Rc<SessionConfig>,
    sessions: RefCell<HashMap<Uuid, Session>>,
    devices: RefCell<HashMap<Uuid, DeviceIdentity>>,
    adapter: Cell<AdapterState>,
    adapter_updates: EventSender<AdapterState>,
    sequence: Rc<Cell<u64>>,
    discoveries: EventSender<DeviceIdentity>,
    /// The event router and the idle sweeper. Dropping them stops both.
    tasks: RefCell<Vec<Task<()>>>,
}

impl SessionManager {
    /// Creates a manager driving `transport` on `executor`.
    ///
    /// The manager takes the transport's event stream; nothing else should consume it.
    pub fn new(transport: Rc<dyn Transport>, config: SessionConfig, executor: &Executor) -> Self {
        let events = transport.events();
        let eviction = config.session_ttl.map(|_| config.eviction_interval);
        let inner = Rc::new(ManagerInner {
            transport,
            executor: executor.clone(),
            discoveries: EventSender::new(config.event_capacity),
            adapter_updates: EventSender::new(config.event_capacity),
            config: Rc::new(config),
            sessions: RefCell::new(HashMap::new()),
            devices: RefCell::new(HashMap::new()),
            adapter: Cell::new(AdapterState::Unknown),
            sequence: Rc::new(Cell::new(0)),
            tasks: RefCell::new(Vec::new()),
        });

        let mut tasks = vec![executor.spawn_local(route(Rc::downgrade(&inner), events))];
        if let Some(interval) = eviction {
            tasks.push(executor.spawn_local(sweep(Rc::downgrade(&inner), interval)));
        }
        *inner.tasks.borrow_mut() = tasks;

        SessionManager { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the session for `device`, creating it if needed.
    ///
    /// The device is added to the registry if the transport has not reported it.
    pub fn session_for(&self, device: &DeviceIdentity) -> Session {
        self.inner
            .devices
            .borrow_mut()
            .entry(device.id())
            .or_insert_with(|| device.clone());
        self.inner.session_for_id(device.id())
    }

    /// Returns the session for the device with `id`, creating it if needed.
    pub fn session_for_id(&self, id: Uuid) -> Session {
        self.inner.session_for_id(id)
    }

    /// Returns the session for the device with `id`, if one exists.
    pub fn session(&self, id: Uuid) -> Option<Session> {
        self.inner.sessions.borrow().get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.borrow().values().cloned().collect()
    }

    pub fn connect(&self, id: Uuid) -> Completion {
        self.session_for_id(id).connect()
    }

    /// Disconnects the device with `id`. Resolves at once if it has no session.
    pub fn disconnect(&self, id: Uuid) -> Completion {
        match self.session(id) {
            Some(session) => session.disconnect(),
            None => {
                let (pending, completion) =
                    PendingOperation::new(self.inner.next_seq(), Operation::Disconnect, true);
                pending.resolve(Ok(OperationOutput::Disconnected));
                completion
            }
        }
    }

    pub fn submit(&self, id: Uuid, operation: Operation) -> Completion {
        self.session_for_id(id).submit(operation)
    }

    pub fn observe(&self, id: Uuid) -> EventReceiver<SessionEvent> {
        self.session_for_id(id).observe()
    }

    /// A snapshot of every device in the registry.
    pub fn devices(&self) -> Vec<DeviceIdentity> {
        let ids: Vec<Uuid> = self.inner.devices.borrow().keys().copied().collect();
        ids.into_iter().filter_map(|id| self.device(id)).collect()
    }

    /// A snapshot of one device in the registry, including its connection state.
    pub fn device(&self, id: Uuid) -> Option<DeviceIdentity> {
        let known = self.inner.devices.borrow().get(&id).cloned()?;
        match self.session(id) {
            Some(session) => Some(session.device()),
            None => Some(known),
        }
    }

    /// The last power state the transport reported.
    pub fn adapter_state(&self) -> AdapterState {
        self.inner.adapter.get()
    }

    /// Whether the adapter is powered on.
    pub fn is_enabled(&self) -> bool {
        self.adapter_state().is_powered_on()
    }

    /// Returns a stream of adapter power state changes.
    pub fn adapter_updates(&self) -> EventReceiver<AdapterState> {
        self.inner.adapter_updates.subscribe()
    }

    /// Routes one transport event to the session it concerns.
    ///
    /// Events from [`Transport::events()`] are routed automatically. This is for transports that
    /// deliver some events out of band.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        self.inner.handle_transport_event(event)
    }

    /// Returns a stream of devices as the transport discovers them.
    pub fn discoveries(&self) -> EventReceiver<DeviceIdentity> {
        self.inner.discoveries.subscribe()
    }

    /// Drops idle sessions and unconnected devices not seen for longer than the session ttl.
    ///
    /// A session is kept while any handle other than the manager's exists. Returns the number of
    /// sessions evicted. This runs periodically on its own; calling it directly is only needed
    /// to evict at a specific time.
    pub fn evict_idle(&self, now: Instant) -> usize {
        self.inner.evict_idle(now)
    }

    /// Disconnects every session and stops routing transport events.
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = self
            .inner
            .sessions
            .borrow_mut()
            .drain()
            .map(|(_, session)| session)
            .collect();
        debug!(sessions = sessions.len(), "shutting down");

        let completions: Vec<Completion> = sessions.iter().map(Session::disconnect).collect();
        for completion in completions {
            if let Err(error) = completion.await {
                debug!(%error, "disconnect during shutdown failed");
            }
        }

        self.inner.tasks.borrow_mut().clear();
    }
}

impl ManagerInner {
    fn next_seq(&self) -> u64 {
        let seq = self.sequence.get() + 1;
        self.sequence.set(seq);
        seq
    }

    fn session_for_id(&self, id: Uuid) -> Session {
        if let Some(session) = self.sessions.borrow().get(&id) {
            return session.clone();
        }

        let device = self
            .devices
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| DeviceIdentity::new(id));
        debug!(device = %id, "creating session");
        let session = Session::new(
            device,
            self.transport.clone(),
            self.config.clone(),
            self.sequence.clone(),
            &self.executor,
        );
        self.sessions.borrow_mut().insert(id, session.clone());
        session
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        let Some(id) = event.device() else {
            if let TransportEvent::AdapterStateChanged(state) = event {
                self.adapter_changed(state);
            }
            return;
        };

        match &event {
            TransportEvent::DeviceDiscovered { name, rssi, .. } => {
                let device = {
                    let mut devices = self.devices.borrow_mut();
                    let device = devices.entry(id).or_insert_with(|| DeviceIdentity::new(id));
                    if name.is_some() {
                        device.set_name(name.clone());
                    }
                    if rssi.is_some() {
                        device.set_rssi(*rssi);
                    }
                    device.touch();
                    device.clone()
                };
                self.discoveries.send(device);
            }
            TransportEvent::NameUpdated { name, .. } => {
                if let Some(device) = self.devices.borrow_mut().get_mut(&id) {
                    device.set_name(name.clone());
                }
            }
            _ => {}
        }

        let session = self.sessions.borrow().get(&id).cloned();
        match session {
            Some(session) => session.handle_event(event),
            None if matches!(event, TransportEvent::DeviceDiscovered { .. }) => {}
            None => debug!(device = %id, ?event, "event for a device without a session dropped"),
        }
    }

    fn adapter_changed(&self, state: AdapterState) {
        let previous = self.adapter.replace(state);
        if previous == state {
            return;
        }
        debug!(?previous, ?state, "adapter state changed");
        self.adapter_updates.send(state);

        let sessions: Vec<Session> = self.sessions.borrow().values().cloned().collect();
        for session in sessions {
            session.adapter_changed(state);
        }
    }

    fn evict_idle(&self, now: Instant) -> usize {
        let Some(ttl) = self.config.session_ttl else {
            return 0;
        };
        let expired = |since: Instant| now.saturating_duration_since(since) >= ttl;

        let evicted: Vec<Session> = {
            let mut sessions = self.sessions.borrow_mut();
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, session)| {
                    !session.is_shared() && session.idle_since().is_some_and(expired)
                })
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &evicted {
            debug!(device = %session.id(), "evicting idle session");
        }

        let sessions = self.sessions.borrow();
        self.devices.borrow_mut().retain(|id, device| {
            let keep = sessions.contains_key(id) || !expired(device.last_seen());
            if !keep {
                trace!(device = %id, "forgetting stale device");
            }
            keep
        });

        evicted.len()
    }
}

async fn route(manager: Weak<ManagerInner>, mut events: BoxedLocal<TransportEvent>) {
    while let Some(event) = events.next().await {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        inner.handle_transport_event(event);
    }
    debug!("transport event stream ended");
}

async fn sweep(manager: Weak<ManagerInner>, interval: Duration) {
    let mut ticks = Timer::interval(interval);
    while ticks.next().await.is_some() {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        let evicted = inner.evict_idle(Instant::now());
        if evicted > 0 {
            debug!(evicted, "evicted idle sessions");
        }
    }
}
