//! The narrow interface the engine drives.
//!
//! Requests are issued synchronously and never block: a backend queues the
//! real work and reports completion later as a [`TransportEvent`] on the
//! channel handed to it at construction. The query methods expose what the
//! backend currently knows about the peripheral and are re-read by the
//! discovery monitor after every callback.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::descriptor::WriteMode;
use crate::core::error::TransportError;

/// Callback delivered by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ServicesDiscovered {
        error: Option<TransportError>,
    },
    CharacteristicsDiscovered {
        service: Uuid,
        error: Option<TransportError>,
    },
    NotificationStateChanged {
        characteristic: Uuid,
        error: Option<TransportError>,
    },
    ValueUpdated {
        characteristic: Uuid,
        payload: Option<Vec<u8>>,
        error: Option<TransportError>,
    },
    ValueWritten {
        characteristic: Uuid,
        error: Option<TransportError>,
    },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates the callback channel shared by a backend and its device.
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Capability set consumed by the discovery monitor and the engine.
pub trait TransportPort: Send {
    /// Whether `service` is in the currently discovered service set.
    fn has_service(&self, service: Uuid) -> bool;

    /// Whether `characteristic` has been discovered under `service`.
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Whether notifications are active for `characteristic`.
    fn is_notifying(&self, characteristic: Uuid) -> bool;

    /// Last value the backend holds for `characteristic`, if any.
    fn value(&self, characteristic: Uuid) -> Option<Vec<u8>>;

    fn discover_services(&mut self, services: &[Uuid]) -> Result<(), TransportError>;

    fn discover_characteristics(
        &mut self,
        characteristics: &[Uuid],
        service: Uuid,
    ) -> Result<(), TransportError>;

    fn set_notification(&mut self, enabled: bool, characteristic: Uuid)
    -> Result<(), TransportError>;

    fn write(
        &mut self,
        payload: &[u8],
        characteristic: Uuid,
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    fn read(&mut self, characteristic: Uuid) -> Result<(), TransportError>;
}
