//! GATT operation engine library.
//!
//! A [`Device`] prepares a peripheral by walking the service, characteristic
//! and notification discovery gates, then executes queued request/response
//! [`Operation`]s strictly one at a time over any [`TransportPort`].

pub mod config;
pub mod core;
pub mod logging;
mod utils;

pub use crate::core::{
    Device, DeviceError, DeviceEvent, DeviceOptions, EndpointDescriptor, InterfaceState,
    Operation, OperationError, TransportError, TransportPort,
};
