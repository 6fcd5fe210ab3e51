//! The contract between GATT sessions and the radio driver.

use async_trait::async_trait;
use btuuid::BluetoothUuid;
use futures_lite::stream::BoxedLocal;
use uuid::Uuid;

use crate::characteristic::{CharacteristicDescriptor, CharacteristicId, WriteType};
use crate::device::ConnectionState;
use crate::error::{Error, Result};
use crate::service::ServiceDescriptor;

/// A Bluetooth LE central transport.
///
/// Each method starts one GATT primitive and completes when the radio reports its outcome.
/// Callers guarantee that at most one primitive is outstanding per device. Native handles stay
/// inside the implementation; devices, services and characteristics are addressed by UUID only.
#[async_trait(?Send)]
pub trait Transport {
    /// Establishes a link to `device`.
    async fn connect(&self, device: Uuid) -> Result<()>;

    /// Tears down the link to `device`. Always succeeds once the link is gone.
    async fn disconnect(&self, device: Uuid) -> Result<()>;

    /// Discovers the services of `device`.
    ///
    /// If `services` is provided, only services with those UUIDs are discovered. The returned
    /// descriptors have no characteristics yet.
    async fn discover_services(
        &self,
        device: Uuid,
        services: Option<&[BluetoothUuid]>,
    ) -> Result<Vec<ServiceDescriptor>>;

    /// Discovers the characteristics of one service of `device`.
    async fn discover_characteristics(
        &self,
        device: Uuid,
        service: &BluetoothUuid,
    ) -> Result<Vec<CharacteristicDescriptor>>;

    /// Reads the value of a characteristic.
    async fn read(&self, device: Uuid, characteristic: &CharacteristicId) -> Result<Vec<u8>>;

    /// Writes the value of a characteristic.
    async fn write(
        &self,
        device: Uuid,
        characteristic: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Enables or disables notifications or indications, returning the resulting state.
    async fn set_notify(
        &self,
        device: Uuid,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<bool>;

    /// Reads the signal strength of the link in dBm.
    async fn read_rssi(&self, device: Uuid) -> Result<i16>;

    /// Returns the stream of unsolicited events.
    ///
    /// Called once by the owner of the transport; the stream ends when the transport shuts down.
    fn events(&self) -> BoxedLocal<TransportEvent>;
}

/// The power state of the radio behind a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AdapterState {
    /// The transport has not reported a state yet.
    #[default]
    Unknown,
    /// The platform has no usable Bluetooth LE radio.
    Unsupported,
    /// The application is not allowed to use the radio.
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Whether links can be established in this state.
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

/// An unsolicited event from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The radio changed power state. Applies to every device.
    AdapterStateChanged(AdapterState),
    /// The transport saw the device for the first time or saw it again.
    DeviceDiscovered {
        device: Uuid,
        name: Option<String>,
        rssi: Option<i16>,
    },
    NameUpdated {
        device: Uuid,
        name: Option<String>,
    },
    ConnectionStateChanged {
        device: Uuid,
        state: ConnectionState,
        error: Option<Error>,
    },
    /// A notification, an indication or an unsolicited read response.
    CharacteristicValueUpdated {
        device: Uuid,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    LinkError {
        device: Uuid,
        error: Error,
    },
}

impl TransportEvent {
    /// The device the event is about, or `None` for adapter-wide events.
    pub fn device(&self) -> Option<Uuid> {
        match self {
            TransportEvent::AdapterStateChanged(_) => None,
            TransportEvent::DeviceDiscovered { device, .. }
            | TransportEvent::NameUpdated { device, .. }
            | TransportEvent::ConnectionStateChanged { device, .. }
            | TransportEvent::CharacteristicValueUpdated { device, .. }
            | TransportEvent::LinkError { device, .. } => Some(*device),
        }
    }
}
