use std::cell::Cell;
use std::error::Error;
use std::rc::Rc;
use std::time::Duration;

use async_io::Timer;
use async_trait::async_trait;
use futures_lite::StreamExt;
use futures_lite::stream::BoxedLocal;
use gatt_session::{
    BluetoothUuid, CharacteristicDescriptor, CharacteristicId, CharacteristicProperties,
    ServiceDescriptor, SessionConfig, SessionEvent, SessionManager, Transport, TransportEvent,
    Uuid, WriteType,
};
use local_executor::Executor;
use tracing::info;
use tracing::metadata::LevelFilter;

const BATTERY_SERVICE: BluetoothUuid = BluetoothUuid::from_u16(0x180f);
const BATTERY_LEVEL: BluetoothUuid = BluetoothUuid::from_u16(0x2a19);
const DEVICE: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// A peripheral that only exists in memory and slowly drains its battery.
struct SimulatedBattery {
    level: Cell<u8>,
}

impl SimulatedBattery {
    async fn radio_delay() {
        Timer::after(Duration::from_millis(20)).await;
    }
}

#[async_trait(?Send)]
impl Transport for SimulatedBattery {
    async fn connect(&self, _device: Uuid) -> gatt::Result<()> {
        Self::radio_delay().await;
        Ok(())
    }

    async fn disconnect(&self, _device: Uuid) -> gatt::Result<()> {
        Ok(())
    }

    async fn discover_services(
        &self,
        device: Uuid,
        _services: Option<&[BluetoothUuid]>,
    ) -> gatt::Result<Vec<ServiceDescriptor>> {
        Self::radio_delay().await;
        Ok(vec![ServiceDescriptor::new(device, BATTERY_SERVICE, true)])
    }

    async fn discover_characteristics(
        &self,
        _device: Uuid,
        service: &BluetoothUuid,
    ) -> gatt::Result<Vec<CharacteristicDescriptor>> {
        Self::radio_delay().await;
        Ok(vec![CharacteristicDescriptor::new(
            service.clone(),
            BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        )])
    }

    async fn read(
        &self,
        _device: Uuid,
        _characteristic: &CharacteristicId,
    ) -> gatt::Result<Vec<u8>> {
        Self::radio_delay().await;
        let level = self.level.get();
        self.level.set(level.saturating_sub(3));
        Ok(vec![level])
    }

    async fn write(
        &self,
        _device: Uuid,
        _characteristic: &CharacteristicId,
        _value: &[u8],
        _write_type: WriteType,
    ) -> gatt::Result<()> {
        Err(gatt::error::AttError::WRITE_NOT_PERMITTED.into())
    }

    async fn set_notify(
        &self,
        _device: Uuid,
        _characteristic: &CharacteristicId,
        enabled: bool,
    ) -> gatt::Result<bool> {
        Ok(enabled)
    }

    async fn read_rssi(&self, _device: Uuid) -> gatt::Result<i16> {
        Ok(-52)
    }

    fn events(&self) -> BoxedLocal<TransportEvent> {
        futures_lite::stream::once(TransportEvent::DeviceDiscovered {
            device: DEVICE,
            name: Some("Simulated Battery".to_owned()),
            rssi: Some(-52),
        })
        .boxed_local()
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let executor = Executor::new();
    let transport = Rc::new(SimulatedBattery {
        level: Cell::new(100),
    });
    let manager = SessionManager::new(transport, SessionConfig::default(), &executor);

    executor.block_on(async {
        let device = manager.discoveries().recv().await?;
        info!(
            "found {} ({}dBm)",
            device.name().unwrap_or("(unknown)"),
            device.rssi().unwrap_or_default()
        );

        let session = manager.session_for(&device);
        let mut events = session.observe();
        session.connect().await?;
        session.ready().await?;

        for service in session.services() {
            info!(
                "service {:?}: {} characteristics",
                service.uuid(),
                service.characteristics().len()
            );
        }

        let level = CharacteristicId::new(BATTERY_SERVICE, BATTERY_LEVEL);
        for _ in 0..3 {
            let percent: u8 = session.read_as(&level).await?;
            info!("battery level {percent}%");
        }

        session.disconnect().await?;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged { from, to } = event {
                info!("{from:?} -> {to:?}");
            }
        }

        manager.shutdown().await;
        Ok::<_, Box<dyn Error>>(())
    })
}
