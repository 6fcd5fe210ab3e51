use btuuid::BluetoothUuid;
use uuid::Uuid;

use crate::characteristic::{CharacteristicDescriptor, CharacteristicId};

/// A service discovered on a device.
///
/// Characteristics keep the order in which the transport reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    device: Uuid,
    uuid: BluetoothUuid,
    is_primary: bool,
    characteristics: Vec<CharacteristicDescriptor>,
    degraded: bool,
}

impl ServiceDescriptor {
    pub fn new(device: Uuid, uuid: BluetoothUuid, is_primary: bool) -> Self {
        Self {
            device,
            uuid,
            is_primary,
            characteristics: Vec::new(),
            degraded: false,
        }
    }

    pub fn device(&self) -> Uuid {
        self.device
    }

    pub fn uuid(&self) -> &BluetoothUuid {
        &self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn characteristics(&self) -> &[CharacteristicDescriptor] {
        &self.characteristics
    }

    pub fn characteristic(&self, uuid: &BluetoothUuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid() == uuid)
    }

    pub fn characteristic_mut(
        &mut self,
        uuid: &BluetoothUuid,
    ) -> Option<&mut CharacteristicDescriptor> {
        self.characteristics.iter_mut().find(|c| c.uuid() == uuid)
    }

    /// Whether characteristic discovery failed for this service.
    ///
    /// A degraded service has no characteristics, but the rest of the device stays usable.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Replaces the characteristic list with a freshly discovered one.
    pub fn set_characteristics(&mut self, characteristics: Vec<CharacteristicDescriptor>) {
        self.characteristics = characteristics;
        self.degraded = false;
    }

    /// Marks characteristic discovery as failed, dropping any previous characteristics.
    pub fn mark_degraded(&mut self) {
        self.characteristics.clear();
        self.degraded = true;
    }
}

/// Looks up a characteristic across a list of services.
pub fn find_characteristic<'a>(
    services: &'a [ServiceDescriptor],
    id: &CharacteristicId,
) -> Option<&'a CharacteristicDescriptor> {
    services
        .iter()
        .find(|s| s.uuid() == &id.service)
        .and_then(|s| s.characteristic(&id.uuid))
}

/// Mutable variant of [`find_characteristic`].
pub fn find_characteristic_mut<'a>(
    services: &'a mut [ServiceDescriptor],
    id: &CharacteristicId,
) -> Option<&'a mut CharacteristicDescriptor> {
    services
        .iter_mut()
        .find(|s| s.uuid() == &id.service)
        .and_then(|s| s.characteristic_mut(&id.uuid))
}
