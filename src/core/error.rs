//! Error types shared by the transport, the discovery monitor and the
//! operation engine.

use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the transport, either synchronously when a request is
/// issued or asynchronously through a callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not available")]
    Unavailable,

    #[error("service {0} has not been discovered")]
    ServiceNotDiscovered(Uuid),

    #[error("characteristic {0} has not been discovered")]
    CharacteristicNotDiscovered(Uuid),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<bluest::Error> for TransportError {
    fn from(e: bluest::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// Failure surfaced by the device facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device is not prepared")]
    NotPrepared,

    #[error("discovery failed: {0}")]
    Discovery(TransportError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("device task has stopped")]
    Closed,
}

/// Terminal error of an operation. The first one recorded wins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Delivered by `drop_current_operation` / `drop_all_operations`.
    #[error("operation was interrupted")]
    Interrupted,

    #[error("device disconnected")]
    Disconnected,

    #[error("no response before the timeout elapsed")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
