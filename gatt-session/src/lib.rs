//! Serialized, lifecycle-aware GATT sessions over a Bluetooth LE [`Transport`].
//!
//! A [`SessionManager`] owns one [`Session`] per device. Each session connects, discovers the
//! device's services and characteristics, and then dispatches reads, writes, notification
//! changes and RSSI reads to the transport strictly one at a time, in submission order. Every
//! submitted operation resolves exactly once through its [`Completion`].
//!
//! Sessions are driven by tasks on a [`local_executor::Executor`] and are not `Send`.
//!
//! See the `examples` directory for a complete program.

mod config;
pub mod error;
mod manager;
mod operation;
mod queue;
mod session;
mod util;

pub use config::{SessionConfig, Timeouts};
pub use gatt::error::AttError;
pub use gatt::{
    AdapterState, BluetoothUuid, CharacteristicDescriptor, CharacteristicId,
    CharacteristicProperties, ConnectionState, DeviceIdentity, ServiceDescriptor, Transport,
    TransportEvent, Uuid, WriteType, value,
};
pub use manager::SessionManager;
pub use operation::{Completion, Operation, OperationOutput};
pub use session::{Session, SessionEvent, SessionState};
pub use util::EventReceiver;
