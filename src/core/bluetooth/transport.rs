//! [`TransportPort`] over a connected bluest peripheral.
//!
//! bluest is async while the port is not, so every request is handed to a
//! spawned task and its outcome comes back as a [`TransportEvent`]. Handles
//! that were discovered are kept in [`SharedGatt`] for the query methods.

use bluest::Device;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::types::SharedGatt;
use crate::core::descriptor::WriteMode;
use crate::core::error::TransportError;
use crate::core::transport::{TransportEvent, TransportEventSender, TransportPort};

pub struct BluestTransport {
    peripheral: Device,
    known: SharedGatt,
    events: TransportEventSender,
    notification_handler: NotificationHandler,
}

impl BluestTransport {
    /// Must be created inside a tokio runtime; callbacks go to `events`.
    pub fn new(peripheral: Device, events: TransportEventSender) -> Self {
        let known = SharedGatt::default();
        let notification_handler = NotificationHandler::new(known.clone(), events.clone());
        Self {
            peripheral,
            known,
            events,
            notification_handler,
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<bluest::Characteristic, TransportError> {
        self.known
            .lock()
            .characteristics
            .get(&uuid)
            .map(|(_, c)| c.clone())
            .ok_or(TransportError::CharacteristicNotDiscovered(uuid))
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.notification_handler.stop_all();
    }
}

impl TransportPort for BluestTransport {
    fn has_service(&self, service: Uuid) -> bool {
        self.known.lock().services.contains_key(&service)
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.known
            .lock()
            .characteristics
            .get(&characteristic)
            .is_some_and(|(owner, _)| *owner == service)
    }

    fn is_notifying(&self, characteristic: Uuid) -> bool {
        self.known.lock().notifying.contains(&characteristic)
    }

    fn value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.known.lock().values.get(&characteristic).cloned()
    }

    fn discover_services(&mut self, services: &[Uuid]) -> Result<(), TransportError> {
        let peripheral = self.peripheral.clone();
        let known = self.known.clone();
        let events = self.events.clone();
        let wanted = services.to_vec();

        tokio::spawn(async move {
            let mut error = None;
            for uuid in wanted {
                match peripheral.discover_services_with_uuid(uuid).await {
                    Ok(found) => match found.into_iter().next() {
                        Some(service) => {
                            info!("Found service: {}", uuid);
                            known.lock().services.insert(uuid, service);
                        }
                        None => {
                            warn!("Service not found: {}", uuid);
                            error = Some(TransportError::ServiceNotDiscovered(uuid));
                            break;
                        }
                    },
                    Err(e) => {
                        error = Some(e.into());
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::ServicesDiscovered { error });
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        characteristics: &[Uuid],
        service: Uuid,
    ) -> Result<(), TransportError> {
        let handle = self
            .known
            .lock()
            .services
            .get(&service)
            .cloned()
            .ok_or(TransportError::ServiceNotDiscovered(service))?;
        let known = self.known.clone();
        let events = self.events.clone();
        let wanted = characteristics.to_vec();

        tokio::spawn(async move {
            let error = match handle.discover_characteristics().await {
                Ok(found) => {
                    let mut known = known.lock();
                    for characteristic in found {
                        let uuid = characteristic.uuid();
                        if wanted.contains(&uuid) {
                            debug!("Found characteristic {} on {}", uuid, service);
                            known.characteristics.insert(uuid, (service, characteristic));
                        }
                    }
                    wanted
                        .iter()
                        .find(|c| !known.characteristics.contains_key(c))
                        .map(|&missing| TransportError::CharacteristicNotDiscovered(missing))
                }
                Err(e) => Some(e.into()),
            };
            let _ = events.send(TransportEvent::CharacteristicsDiscovered { service, error });
        });
        Ok(())
    }

    fn set_notification(
        &mut self,
        enabled: bool,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if enabled {
            let handle = self.characteristic(characteristic)?;
            self.notification_handler.subscribe(handle);
        } else {
            self.notification_handler.unsubscribe(characteristic);
        }
        Ok(())
    }

    fn write(
        &mut self,
        payload: &[u8],
        characteristic: Uuid,
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let handle = self.characteristic(characteristic)?;
        let events = self.events.clone();
        let data = payload.to_vec();

        match mode {
            WriteMode::WithResponse => {
                tokio::spawn(async move {
                    let error = handle.write(&data).await.err().map(TransportError::from);
                    let _ = events.send(TransportEvent::ValueWritten {
                        characteristic,
                        error,
                    });
                });
            }
            WriteMode::WithoutResponse => {
                tokio::spawn(async move {
                    // No acknowledgement is reported for this mode.
                    if let Err(e) = handle.write_without_response(&data).await {
                        warn!("Unacknowledged write to {} failed: {}", characteristic, e);
                    }
                });
            }
            WriteMode::None => {
                return Err(TransportError::Backend(format!(
                    "characteristic {} is not writable",
                    characteristic
                )));
            }
        }
        Ok(())
    }

    fn read(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        let handle = self.characteristic(characteristic)?;
        let known = self.known.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let event = match handle.read().await {
                Ok(value) => {
                    known.lock().values.insert(characteristic, value.clone());
                    TransportEvent::ValueUpdated {
                        characteristic,
                        payload: Some(value),
                        error: None,
                    }
                }
                Err(e) => TransportEvent::ValueUpdated {
                    characteristic,
                    payload: None,
                    error: Some(e.into()),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }
}
