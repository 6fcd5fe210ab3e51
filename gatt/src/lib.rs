//! Identifier, descriptor and transport types for Bluetooth LE GATT clients.
//!
//! This crate holds the value types shared by every layer of a GATT client: device identities,
//! service and characteristic descriptors, and the [`Transport`] trait a radio driver implements
//! to be driven by `gatt-session`. Nothing here holds a native handle; everything is addressed
//! by UUID so that a transport can be substituted in tests.

mod characteristic;
mod device;
pub mod error;
mod service;
mod transport;
pub mod value;

pub use characteristic::*;
pub use device::*;
pub use error::{Error, ErrorKind, Result};
pub use service::*;
pub use transport::*;

pub use btuuid::BluetoothUuid;
pub use uuid::Uuid;
