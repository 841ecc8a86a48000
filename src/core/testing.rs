//! In-memory transport used by the unit tests.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::core::descriptor::{
    CharacteristicDescriptor, EndpointDescriptor, ServiceDescriptor, WriteMode,
};
use crate::core::error::TransportError;
use crate::core::transport::TransportPort;

pub fn uuid(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

/// Service 0x100 with a write-with-response characteristic 0x101 and a
/// notify characteristic 0x102.
pub fn profile() -> EndpointDescriptor {
    EndpointDescriptor::new(vec![ServiceDescriptor::new(
        uuid(0x100),
        vec![
            CharacteristicDescriptor::new(uuid(0x101), WriteMode::WithResponse, false),
            CharacteristicDescriptor::new(uuid(0x102), WriteMode::None, true),
        ],
    )])
}

pub fn two_service_profile() -> EndpointDescriptor {
    EndpointDescriptor::new(vec![
        ServiceDescriptor::new(
            uuid(0x100),
            vec![CharacteristicDescriptor::new(uuid(0x101), WriteMode::WithResponse, false)],
        ),
        ServiceDescriptor::new(
            uuid(0x200),
            vec![CharacteristicDescriptor::new(uuid(0x201), WriteMode::None, false)],
        ),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics { service: Uuid, characteristics: Vec<Uuid> },
    SetNotification(bool, Uuid),
    Write(Uuid, Vec<u8>, WriteMode),
    Read(Uuid),
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    services: HashSet<Uuid>,
    characteristics: HashSet<(Uuid, Uuid)>,
    notifying: HashSet<Uuid>,
    values: HashMap<Uuid, Vec<u8>>,
    requests: Vec<Request>,
    fail_next: Option<TransportError>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that already knows everything `descriptor` asks for.
    pub fn ready_for(descriptor: &EndpointDescriptor) -> Self {
        let mut transport = Self::new();
        for service in descriptor.services() {
            transport.add_service(service.address);
            for c in &service.characteristics {
                transport.add_characteristic(service.address, c.address);
                if c.notifiable {
                    transport.set_notifying(c.address, true);
                }
            }
        }
        transport
    }

    pub fn add_service(&mut self, service: Uuid) {
        self.services.insert(service);
    }

    pub fn add_characteristic(&mut self, service: Uuid, characteristic: Uuid) {
        self.characteristics.insert((service, characteristic));
    }

    pub fn set_notifying(&mut self, characteristic: Uuid, enabled: bool) {
        if enabled {
            self.notifying.insert(characteristic);
        } else {
            self.notifying.remove(&characteristic);
        }
    }

    pub fn set_value(&mut self, characteristic: Uuid, value: Vec<u8>) {
        self.values.insert(characteristic, value);
    }

    /// Makes the next request fail synchronously.
    pub fn fail_next(&mut self, error: TransportError) {
        self.fail_next = Some(error);
    }

    pub fn take_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    fn record(&mut self, request: Request) -> Result<(), TransportError> {
        if let Some(e) = self.fail_next.take() {
            return Err(e);
        }
        self.requests.push(request);
        Ok(())
    }
}

impl TransportPort for FakeTransport {
    fn has_service(&self, service: Uuid) -> bool {
        self.services.contains(&service)
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.characteristics.contains(&(service, characteristic))
    }

    fn is_notifying(&self, characteristic: Uuid) -> bool {
        self.notifying.contains(&characteristic)
    }

    fn value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.values.get(&characteristic).cloned()
    }

    fn discover_services(&mut self, services: &[Uuid]) -> Result<(), TransportError> {
        self.record(Request::DiscoverServices(services.to_vec()))
    }

    fn discover_characteristics(
        &mut self,
        characteristics: &[Uuid],
        service: Uuid,
    ) -> Result<(), TransportError> {
        self.record(Request::DiscoverCharacteristics {
            service,
            characteristics: characteristics.to_vec(),
        })
    }

    fn set_notification(
        &mut self,
        enabled: bool,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.record(Request::SetNotification(enabled, characteristic))
    }

    fn write(
        &mut self,
        payload: &[u8],
        characteristic: Uuid,
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.record(Request::Write(characteristic, payload.to_vec(), mode))
    }

    fn read(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        self.record(Request::Read(characteristic))
    }
}
