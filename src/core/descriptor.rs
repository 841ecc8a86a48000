//! Static description of a peripheral's addressable surface.
//!
//! The table is built once per device class and never mutated afterwards.
//! Asking it about an address it does not know is a programming error and
//! panics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a characteristic accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Read/notify only.
    #[default]
    None,
    WithResponse,
    WithoutResponse,
}

/// One characteristic of a configured service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub address: Uuid,
    pub write_mode: WriteMode,
    pub notifiable: bool,
}

impl CharacteristicDescriptor {
    pub fn new(address: Uuid, write_mode: WriteMode, notifiable: bool) -> Self {
        Self {
            address,
            write_mode,
            notifiable,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.write_mode != WriteMode::None
    }
}

/// A configured service and its characteristics, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub address: Uuid,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(address: Uuid, characteristics: Vec<CharacteristicDescriptor>) -> Self {
        Self {
            address,
            characteristics,
        }
    }

    pub fn characteristic_addresses(&self) -> Vec<Uuid> {
        self.characteristics.iter().map(|c| c.address).collect()
    }
}

/// Validated descriptor table with lookup indices derived at construction.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    services: Vec<ServiceDescriptor>,
    service_index: HashMap<Uuid, usize>,
    /// characteristic address -> (service position, characteristic position)
    characteristic_index: HashMap<Uuid, (usize, usize)>,
}

/// Returned by [`EndpointDescriptor::try_new`] when an address is declared
/// twice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("service {0} is declared more than once")]
    DuplicateService(Uuid),

    #[error("characteristic {0} is declared more than once")]
    DuplicateCharacteristic(Uuid),
}

impl EndpointDescriptor {
    /// Builds the table, rejecting duplicate service or characteristic
    /// addresses.
    pub fn try_new(services: Vec<ServiceDescriptor>) -> Result<Self, DescriptorError> {
        let mut service_index = HashMap::new();
        let mut characteristic_index = HashMap::new();

        for (s, service) in services.iter().enumerate() {
            if service_index.insert(service.address, s).is_some() {
                return Err(DescriptorError::DuplicateService(service.address));
            }
            for (c, characteristic) in service.characteristics.iter().enumerate() {
                if characteristic_index
                    .insert(characteristic.address, (s, c))
                    .is_some()
                {
                    return Err(DescriptorError::DuplicateCharacteristic(characteristic.address));
                }
            }
        }

        Ok(Self {
            services,
            service_index,
            characteristic_index,
        })
    }

    /// Builds the table from a list known to be valid.
    ///
    /// # Panics
    /// If an address is declared twice.
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        match Self::try_new(services) {
            Ok(descriptor) => descriptor,
            Err(e) => panic!("invalid endpoint descriptor: {}", e),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn service_addresses(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| s.address).collect()
    }

    pub fn try_service(&self, address: Uuid) -> Option<&ServiceDescriptor> {
        self.service_index.get(&address).map(|&s| &self.services[s])
    }

    /// # Panics
    /// If `address` is not a configured service.
    pub fn service(&self, address: Uuid) -> &ServiceDescriptor {
        self.try_service(address)
            .unwrap_or_else(|| panic!("service {} is not registered", address))
    }

    pub fn try_characteristic(&self, address: Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristic_index
            .get(&address)
            .map(|&(s, c)| &self.services[s].characteristics[c])
    }

    /// # Panics
    /// If `address` is not a configured characteristic.
    pub fn characteristic(&self, address: Uuid) -> &CharacteristicDescriptor {
        self.try_characteristic(address)
            .unwrap_or_else(|| panic!("characteristic {} is not registered", address))
    }

    /// # Panics
    /// If `address` is not a configured characteristic.
    pub fn assert_registered(&self, address: Uuid) {
        if !self.characteristic_index.contains_key(&address) {
            panic!("characteristic {} is not registered", address);
        }
    }

    /// Address of the service owning the characteristic.
    ///
    /// # Panics
    /// If `address` is not a configured characteristic.
    pub fn service_of(&self, characteristic: Uuid) -> Uuid {
        match self.characteristic_index.get(&characteristic) {
            Some(&(s, _)) => self.services[s].address,
            None => panic!("characteristic {} is not registered", characteristic),
        }
    }

    /// All notify-flagged characteristics in descriptor order.
    pub fn notifiable(&self) -> impl Iterator<Item = &CharacteristicDescriptor> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .filter(|c| c.notifiable)
    }
}
