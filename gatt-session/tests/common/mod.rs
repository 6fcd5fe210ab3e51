#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use async_io::Timer;
use async_trait::async_trait;
use futures_channel::mpsc;
use futures_lite::StreamExt;
use futures_lite::stream::BoxedLocal;
use gatt_session::{
    BluetoothUuid, CharacteristicDescriptor, CharacteristicId, CharacteristicProperties,
    ConnectionState, EventReceiver, ServiceDescriptor, Session, SessionConfig, SessionEvent,
    SessionManager, SessionState, Transport, TransportEvent, Uuid, WriteType,
};
use local_executor::Executor;

pub const DEVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const OTHER_DEVICE: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

pub const BATTERY_SERVICE: u16 = 0x180f;
pub const BATTERY_LEVEL: u16 = 0x2a19;
pub const HEART_RATE_SERVICE: u16 = 0x180d;
pub const HEART_RATE_MEASUREMENT: u16 = 0x2a37;
pub const HEART_RATE_CONTROL: u16 = 0x2a39;
pub const SENSOR_SERVICE: u16 = 0xfff0;
pub const SENSOR_VALUE: u16 = 0xfff1;
pub const SENSOR_CONTROL: u16 = 0xfff2;

pub fn uuid(value: u16) -> BluetoothUuid {
    BluetoothUuid::from_u16(value)
}

pub fn characteristic(service: u16, characteristic: u16) -> CharacteristicId {
    CharacteristicId::new(uuid(service), uuid(characteristic))
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// What a mock transport call does when it is made.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(gatt::Error),
    /// Never completes.
    Hang,
    /// Succeeds after the given delay.
    Delay(Duration),
}

/// A scripted in-memory transport.
///
/// Calls succeed immediately unless a behavior was scripted for their label. Every call is
/// recorded, and a call that starts while another is outstanding panics.
#[derive(Default)]
pub struct MockTransport {
    services: RefCell<Vec<(u16, Vec<(u16, CharacteristicProperties)>)>>,
    values: RefCell<HashMap<CharacteristicId, Vec<u8>>>,
    script: RefCell<HashMap<String, VecDeque<Behavior>>>,
    calls: RefCell<Vec<String>>,
    active: Cell<usize>,
    events: RefCell<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    sender: RefCell<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

struct ActiveCall<'a>(&'a Cell<usize>);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

fn label(uuid: &BluetoothUuid) -> String {
    match uuid {
        BluetoothUuid::Uuid16(value) => format!("{:04x}", value.to_u16()),
        other => format!("{other:?}"),
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded();
        let transport = Self::default();
        *transport.events.borrow_mut() = Some(receiver);
        *transport.sender.borrow_mut() = Some(sender);
        transport
    }

    /// A device with a battery service holding a readable, notifying level.
    pub fn battery() -> Self {
        Self::new().with_service(
            BATTERY_SERVICE,
            &[(
                BATTERY_LEVEL,
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )],
        )
    }

    /// A device with a vendor service holding a read/write/notify value and a write-only control
    /// point.
    pub fn sensor() -> Self {
        Self::new().with_service(
            SENSOR_SERVICE,
            &[
                (
                    SENSOR_VALUE,
                    CharacteristicProperties::READ
                        | CharacteristicProperties::WRITE
                        | CharacteristicProperties::NOTIFY,
                ),
                (SENSOR_CONTROL, CharacteristicProperties::WRITE),
            ],
        )
    }

    pub fn with_service(
        self,
        service: u16,
        characteristics: &[(u16, CharacteristicProperties)],
    ) -> Self {
        self.services
            .borrow_mut()
            .push((service, characteristics.to_vec()));
        self
    }

    pub fn with_value(self, id: CharacteristicId, value: &[u8]) -> Self {
        self.values.borrow_mut().insert(id, value.to_vec());
        self
    }

    /// Queues a behavior for the next call with `label`, e.g. `"read 2a19"`.
    pub fn script(&self, label: &str, behavior: Behavior) {
        self.script
            .borrow_mut()
            .entry(label.to_owned())
            .or_default()
            .push_back(behavior);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self, label: &str) -> usize {
        self.calls.borrow().iter().filter(|c| *c == label).count()
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(sender) = self.sender.borrow().as_ref() {
            let _ = sender.unbounded_send(event);
        }
    }

    pub fn drop_link(&self, device: Uuid) {
        self.emit(TransportEvent::ConnectionStateChanged {
            device,
            state: ConnectionState::Disconnected,
            error: Some(gatt::Error::new(
                gatt::ErrorKind::PeripheralDisconnected,
                "supervision timeout",
            )),
        });
    }

    async fn call(&self, label: String) -> gatt::Result<()> {
        assert_eq!(self.active.get(), 0, "overlapping transport call: {label}");
        self.active.set(1);
        let _active = ActiveCall(&self.active);

        let behavior = self
            .script
            .borrow_mut()
            .get_mut(&label)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Succeed);
        self.calls.borrow_mut().push(label);

        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(error) => Err(error),
            Behavior::Hang => futures_lite::future::pending().await,
            Behavior::Delay(delay) => {
                Timer::after(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait(?Send)]
impl Transport for MockTransport {
    async fn connect(&self, _device: Uuid) -> gatt::Result<()> {
        self.call("connect".to_owned()).await
    }

    async fn disconnect(&self, _device: Uuid) -> gatt::Result<()> {
        self.call("disconnect".to_owned()).await
    }

    async fn discover_services(
        &self,
        device: Uuid,
        services: Option<&[BluetoothUuid]>,
    ) -> gatt::Result<Vec<ServiceDescriptor>> {
        self.call("discover_services".to_owned()).await?;
        Ok(self
            .services
            .borrow()
            .iter()
            .map(|(service, _)| uuid(*service))
            .filter(|service| services.is_none_or(|filter| filter.contains(service)))
            .map(|service| ServiceDescriptor::new(device, service, true))
            .collect())
    }

    async fn discover_characteristics(
        &self,
        _device: Uuid,
        service: &BluetoothUuid,
    ) -> gatt::Result<Vec<CharacteristicDescriptor>> {
        self.call(format!("discover_characteristics {}", label(service)))
            .await?;
        Ok(self
            .services
            .borrow()
            .iter()
            .filter(|(s, _)| uuid(*s) == *service)
            .flat_map(|(_, characteristics)| characteristics.iter())
            .map(|(c, properties)| {
                CharacteristicDescriptor::new(service.clone(), uuid(*c), *properties)
            })
            .collect())
    }

    async fn read(
        &self,
        _device: Uuid,
        characteristic: &CharacteristicId,
    ) -> gatt::Result<Vec<u8>> {
        self.call(format!("read {}", label(&characteristic.uuid)))
            .await?;
        Ok(self
            .values
            .borrow()
            .get(characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        _device: Uuid,
        characteristic: &CharacteristicId,
        value: &[u8],
        _write_type: WriteType,
    ) -> gatt::Result<()> {
        self.call(format!("write {}", label(&characteristic.uuid)))
            .await?;
        self.values
            .borrow_mut()
            .insert(characteristic.clone(), value.to_vec());
        Ok(())
    }

    async fn set_notify(
        &self,
        _device: Uuid,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> gatt::Result<bool> {
        self.call(format!("set_notify {} {enabled}", label(&characteristic.uuid)))
            .await?;
        Ok(enabled)
    }

    async fn read_rssi(&self, _device: Uuid) -> gatt::Result<i16> {
        self.call("read_rssi".to_owned()).await?;
        Ok(-58)
    }

    fn events(&self) -> BoxedLocal<TransportEvent> {
        match self.events.borrow_mut().take() {
            Some(receiver) => receiver.boxed_local(),
            None => futures_lite::stream::empty().boxed_local(),
        }
    }
}

pub struct Harness {
    pub executor: Executor,
    pub transport: Rc<MockTransport>,
    pub manager: SessionManager,
}

pub fn harness(transport: MockTransport, config: SessionConfig) -> Harness {
    init_tracing();
    let executor = Executor::new();
    let transport = Rc::new(transport);
    let manager = SessionManager::new(transport.clone(), config, &executor);
    Harness {
        executor,
        transport,
        manager,
    }
}

/// Connects the session for `DEVICE` and waits until it is ready.
pub async fn ready_session(manager: &SessionManager) -> Session {
    let session = manager.session_for_id(DEVICE);
    session.connect().await.expect("connect");
    session.ready().await.expect("ready");
    session
}

/// Drains the state transitions an observer has seen so far.
pub fn transitions(events: &mut EventReceiver<SessionEvent>) -> Vec<SessionState> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            SessionEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

/// Drains every event an observer has seen so far.
pub fn drain(events: &mut EventReceiver<SessionEvent>) -> Vec<SessionEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

/// Lets spawned tasks run for a moment.
pub async fn settle() {
    Timer::after(Duration::from_millis(20)).await;
}
