//! One BLE client object model over two kinds of GATT platform.
//!
//! Server-driven platforms (native mobile stacks, BlueZ) enumerate a
//! peripheral's services on connect and address everything by id. Client-
//! driven platforms (WebBluetooth) pick the device during connect and hand
//! out object handles that must be discovered one request at a time. A
//! [`Bluetooth`] object hides that difference behind one state machine and
//! one callback surface.

pub mod backend;
pub mod bluetooth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod platform;
pub mod resolver;
pub mod state;

#[cfg(test)]
mod testing;

pub use crate::{
   bluetooth::{Bluetooth, NativeBluetooth, WebBluetooth},
   config::{BleConfig, RequestDeviceOptions, ScanFilter},
   error::{BleError, ErrorCode, PlatformError, Result},
   event::{Callbacks, CharacteristicInfo, DeviceInfo, ServiceInfo},
   resolver::{IdType, NOTIFY, WRITE},
   state::{ConnectionState, StateChange},
};
