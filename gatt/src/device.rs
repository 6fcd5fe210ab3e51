use std::time::Instant;

use uuid::Uuid;

/// The last known link state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A physical peripheral as reported by the transport.
///
/// The identifier is stable for the lifetime of the transport context. Values handed out to
/// callers are snapshots; the live record is owned by the session for this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: Uuid,
    name: Option<String>,
    state: ConnectionState,
    rssi: Option<i16>,
    last_seen: Instant,
}

impl DeviceIdentity {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            name: None,
            state: ConnectionState::Disconnected,
            rssi: None,
            last_seen: Instant::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The signal strength from the most recent advertisement or RSSI read, in dBm.
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// When the transport last reported anything about this device.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn set_rssi(&mut self, rssi: Option<i16>) {
        self.rssi = rssi;
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_device_is_disconnected_and_unnamed() {
        let device = DeviceIdentity::new(Uuid::nil());
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert_eq!(device.name(), None);
        assert_eq!(device.rssi(), None);
    }

    #[test]
    fn snapshot_is_detached_from_source() {
        let mut device = DeviceIdentity::new(Uuid::nil()).with_name("Thermometer");
        let snapshot = device.clone();
        device.set_state(ConnectionState::Connected);
        device.set_name(Some("Renamed".into()));
        assert_eq!(snapshot.state(), ConnectionState::Disconnected);
        assert_eq!(snapshot.name(), Some("Thermometer"));
    }
}
