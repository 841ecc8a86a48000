//! Notification handling for a connected peripheral.
//! Each subscribed characteristic gets its own task that pumps the bluest
//! notification stream into the device's transport channel.

use std::collections::HashMap;

use bluest::Characteristic;
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::types::SharedGatt;
use crate::core::transport::{TransportEvent, TransportEventSender};

pub struct NotificationHandler {
    known: SharedGatt,
    events: TransportEventSender,
    subscriptions: HashMap<Uuid, CancellationToken>,
}

impl NotificationHandler {
    pub fn new(known: SharedGatt, events: TransportEventSender) -> Self {
        Self {
            known,
            events,
            subscriptions: HashMap::new(),
        }
    }

    /// Starts a pump task for `characteristic` unless one is running.
    ///
    /// `NotificationStateChanged` is reported once the subscription is in
    /// place, or with the error if it could not be made.
    pub fn subscribe(&mut self, characteristic: Characteristic) {
        let uuid = characteristic.uuid();
        if self.subscriptions.get(&uuid).is_some_and(|t| !t.is_cancelled()) {
            debug!("Already subscribed to {}", uuid);
            let _ = self.events.send(TransportEvent::NotificationStateChanged {
                characteristic: uuid,
                error: None,
            });
            return;
        }

        let cancel_token = CancellationToken::new();
        self.subscriptions.insert(uuid, cancel_token.clone());
        tokio::spawn(Self::process_notifications(
            characteristic,
            self.known.clone(),
            self.events.clone(),
            cancel_token,
        ));
    }

    pub fn unsubscribe(&mut self, characteristic: Uuid) {
        match self.subscriptions.remove(&characteristic) {
            Some(token) if !token.is_cancelled() => token.cancel(),
            _ => {
                let _ = self.events.send(TransportEvent::NotificationStateChanged {
                    characteristic,
                    error: None,
                });
            }
        }
    }

    pub fn stop_all(&mut self) {
        for (_, token) in self.subscriptions.drain() {
            token.cancel();
        }
    }

    async fn process_notifications(
        characteristic: Characteristic,
        known: SharedGatt,
        events: TransportEventSender,
        cancel_token: CancellationToken,
    ) {
        let uuid = characteristic.uuid();
        info!("Subscribing to notifications on {}", uuid);

        let mut stream = match characteristic.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to {}: {}", uuid, e);
                cancel_token.cancel();
                let _ = events.send(TransportEvent::NotificationStateChanged {
                    characteristic: uuid,
                    error: Some(e.into()),
                });
                return;
            }
        };

        known.lock().notifying.insert(uuid);
        let _ = events.send(TransportEvent::NotificationStateChanged {
            characteristic: uuid,
            error: None,
        });

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        debug!("Notification on {}: {:02x?}", uuid, value);
                        known.lock().values.insert(uuid, value.clone());
                        let _ = events.send(TransportEvent::ValueUpdated {
                            characteristic: uuid,
                            payload: Some(value),
                            error: None,
                        });
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream for {}: {}", uuid, e);
                        let _ = events.send(TransportEvent::ValueUpdated {
                            characteristic: uuid,
                            payload: None,
                            error: Some(e.into()),
                        });
                        break;
                    }
                    None => break,
                },
            }
        }

        drop(stream);
        cancel_token.cancel();
        known.lock().notifying.remove(&uuid);
        let _ = events.send(TransportEvent::NotificationStateChanged {
            characteristic: uuid,
            error: None,
        });
        info!("Notification stream for {} ended", uuid);
    }
}
