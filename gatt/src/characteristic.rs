use bitflags::bitflags;
use btuuid::BluetoothUuid;

bitflags! {
    /// The GATT characteristic property bits (Core Specification Vol 3, Part G, 3.3.1.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    /// Whether the characteristic can push values with either notifications or indications.
    pub fn can_subscribe(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// Whether the characteristic accepts writes of the given type.
    pub fn can_write(&self, write_type: WriteType) -> bool {
        match write_type {
            WriteType::WithResponse => self.contains(Self::WRITE),
            WriteType::WithoutResponse => self.contains(Self::WRITE_WITHOUT_RESPONSE),
        }
    }
}

/// Whether a write expects an acknowledgement from the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WriteType {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// Addresses a characteristic by its service UUID and its own UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: BluetoothUuid,
    pub uuid: BluetoothUuid,
}

impl CharacteristicId {
    pub fn new(service: BluetoothUuid, uuid: BluetoothUuid) -> Self {
        Self { service, uuid }
    }
}

/// A characteristic discovered on a service, with the last value the session saw for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    id: CharacteristicId,
    properties: CharacteristicProperties,
    value: Option<Vec<u8>>,
    is_notifying: bool,
}

impl CharacteristicDescriptor {
    pub fn new(
        service: BluetoothUuid,
        uuid: BluetoothUuid,
        properties: CharacteristicProperties,
    ) -> Self {
        Self {
            id: CharacteristicId::new(service, uuid),
            properties,
            value: None,
            is_notifying: false,
        }
    }

    pub fn id(&self) -> &CharacteristicId {
        &self.id
    }

    pub fn uuid(&self) -> &BluetoothUuid {
        &self.id.uuid
    }

    pub fn service(&self) -> &BluetoothUuid {
        &self.id.service
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// The cached value from the most recent read, notification or indication.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn is_notifying(&self) -> bool {
        self.is_notifying
    }

    pub fn set_value(&mut self, value: Option<Vec<u8>>) {
        self.value = value;
    }

    pub fn set_notifying(&mut self, is_notifying: bool) {
        self.is_notifying = is_notifying;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_capability_follows_write_type() {
        let properties = CharacteristicProperties::READ | CharacteristicProperties::WRITE;
        assert!(properties.can_write(WriteType::WithResponse));
        assert!(!properties.can_write(WriteType::WithoutResponse));
        assert!(!properties.can_subscribe());
    }

    #[test]
    fn indicate_counts_as_subscribable() {
        assert!(CharacteristicProperties::INDICATE.can_subscribe());
        assert!(CharacteristicProperties::NOTIFY.can_subscribe());
    }

    #[test]
    fn new_descriptor_has_no_cached_value() {
        let characteristic = CharacteristicDescriptor::new(
            BluetoothUuid::from_u16(0x180f),
            BluetoothUuid::from_u16(0x2a19),
            CharacteristicProperties::READ,
        );
        assert_eq!(characteristic.value(), None);
        assert!(!characteristic.is_notifying());
        assert_eq!(characteristic.uuid(), &BluetoothUuid::from_u16(0x2a19));
    }
}
