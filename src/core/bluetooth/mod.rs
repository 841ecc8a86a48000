//! Bluetooth backend built on bluest.
//! This module handles scanning, connecting, and the transport the engine
//! drives once a peripheral is connected.

mod connection;
mod constants;
mod notification;
mod scanner;
mod transport;
mod types;

pub use connection::ConnectionManager;
pub use constants::*;
pub use notification::NotificationHandler;
pub use scanner::BluetoothScanner;
pub use transport::BluestTransport;
pub use types::{KnownGatt, PeripheralInfo, SharedGatt};
