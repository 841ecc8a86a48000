//! Core of the GATT engine: descriptor table, discovery handshake, the
//! operation engine and the device facade that ties them to a transport.

pub mod bluetooth;
pub mod cache;
pub mod descriptor;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod link;
pub mod operation;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use descriptor::{
    CharacteristicDescriptor, DescriptorError, EndpointDescriptor, ServiceDescriptor, WriteMode,
};
pub use device::{Device, DeviceEvent, DeviceOptions, InterfaceState};
pub use error::{DeviceError, OperationError, TransportError};
pub use operation::{
    Completion, Interactor, Operation, OperationName, OperationState, ReadOperation,
    RequestOperation, UserInfo,
};
pub use transport::{TransportEvent, TransportPort, event_channel};
