//! Defines shared data structures for the Bluetooth module.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bluest::{Characteristic, Service};
use uuid::Uuid;

/// Summary of a peripheral found by the scanner.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeripheralInfo {
    /// Platform-specific unique identifier for the device
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub is_connected: bool,
}

/// What the backend has learned about the peripheral so far.
#[derive(Default)]
pub struct KnownGatt {
    pub services: HashMap<Uuid, Service>,
    /// Characteristic handles keyed by address, with their owning service.
    pub characteristics: HashMap<Uuid, (Uuid, Characteristic)>,
    pub notifying: HashSet<Uuid>,
    pub values: HashMap<Uuid, Vec<u8>>,
}

/// `KnownGatt` shared between the transport and its background tasks.
#[derive(Clone, Default)]
pub struct SharedGatt(Arc<Mutex<KnownGatt>>);

impl SharedGatt {
    pub fn lock(&self) -> MutexGuard<'_, KnownGatt> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
