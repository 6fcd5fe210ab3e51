use std::time::Duration;

use gatt::{BluetoothUuid, CharacteristicId};

use crate::operation::Operation;

/// How long each kind of operation may wait for the transport.
///
/// An operation that exceeds its deadline fails with
/// [`ErrorKind::Timeout`](crate::error::ErrorKind::Timeout) and is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub disconnect: Duration,
    /// Applies to both service and characteristic discovery.
    pub discovery: Duration,
    pub read: Duration,
    pub write: Duration,
    /// Applies to enabling and disabling notifications.
    pub notify: Duration,
    pub rssi: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            disconnect: Duration::from_secs(5),
            discovery: Duration::from_secs(15),
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
            notify: Duration::from_secs(5),
            rssi: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// Sets every deadline to `timeout`.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            connect: timeout,
            disconnect: timeout,
            discovery: timeout,
            read: timeout,
            write: timeout,
            notify: timeout,
            rssi: timeout,
        }
    }

    pub fn for_operation(&self, operation: &Operation) -> Duration {
        match operation {
            Operation::Connect => self.connect,
            Operation::Disconnect => self.disconnect,
            Operation::DiscoverServices | Operation::DiscoverCharacteristics(_) => self.discovery,
            Operation::Read(_) => self.read,
            Operation::Write { .. } => self.write,
            Operation::SetNotify { .. } => self.notify,
            Operation::ReadRssi => self.rssi,
        }
    }
}

/// Options shared by every session of a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub timeouts: Timeouts,
    /// Whether an operation submitted to an idle session connects it first.
    ///
    /// When set, operations submitted before the session is ready wait in the queue instead of
    /// failing with `NotReady`.
    pub auto_connect: bool,
    /// Whether a session reconnects after the link drops without a disconnect request.
    pub auto_reconnect: bool,
    /// How long an in-flight operation may keep running after a disconnect request.
    pub disconnect_grace: Duration,
    /// How long an idle session, or a discovered device without a session, is kept.
    ///
    /// `None` disables eviction.
    pub session_ttl: Option<Duration>,
    /// How often the manager looks for idle sessions to evict.
    pub eviction_interval: Duration,
    /// Restricts service discovery to these service UUIDs.
    pub service_filter: Option<Vec<BluetoothUuid>>,
    /// Characteristics to subscribe to as soon as a session becomes ready.
    pub auto_subscribe: Vec<CharacteristicId>,
    /// Capacity of each session's event channel. Slow observers lose the oldest events.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            auto_connect: false,
            auto_reconnect: false,
            disconnect_grace: Duration::from_secs(1),
            session_ttl: Some(Duration::from_secs(300)),
            eviction_interval: Duration::from_secs(30),
            service_filter: None,
            auto_subscribe: Vec::new(),
            event_capacity: 16,
        }
    }
}
