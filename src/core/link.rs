//! [`Interactor`] over a transport, checked against the descriptor table.

use uuid::Uuid;

use crate::core::cache::ValueCache;
use crate::core::descriptor::{EndpointDescriptor, WriteMode};
use crate::core::error::TransportError;
use crate::core::operation::Interactor;
use crate::core::transport::TransportPort;

pub struct Link<'a> {
    descriptor: &'a EndpointDescriptor,
    transport: &'a mut dyn TransportPort,
    cache: &'a ValueCache,
}

impl<'a> Link<'a> {
    pub fn new(
        descriptor: &'a EndpointDescriptor,
        transport: &'a mut dyn TransportPort,
        cache: &'a ValueCache,
    ) -> Self {
        Self {
            descriptor,
            transport,
            cache,
        }
    }

    fn ensure_discovered(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let service = self.descriptor.service_of(characteristic);
        if !self.transport.has_service(service) {
            return Err(TransportError::ServiceNotDiscovered(service));
        }
        if !self.transport.has_characteristic(service, characteristic) {
            return Err(TransportError::CharacteristicNotDiscovered(characteristic));
        }
        Ok(())
    }

    /// Last value the transport itself holds for the characteristic.
    pub fn retrieve_data(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.ensure_discovered(characteristic).ok()?;
        self.transport.value(characteristic)
    }
}

impl Interactor for Link<'_> {
    /// # Panics
    /// If the characteristic is not registered or not writable.
    fn send(&mut self, payload: &[u8], characteristic: Uuid) -> Result<(), TransportError> {
        let mode = self.descriptor.characteristic(characteristic).write_mode;
        if mode == WriteMode::None {
            panic!("characteristic {} is not configured for writing", characteristic);
        }
        self.ensure_discovered(characteristic)?;
        self.transport.write(payload, characteristic, mode)
    }

    fn read_value(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        self.descriptor.assert_registered(characteristic);
        self.ensure_discovered(characteristic)?;
        self.transport.read(characteristic)
    }

    fn write_mode(&self, characteristic: Uuid) -> WriteMode {
        self.descriptor.characteristic(characteristic).write_mode
    }

    fn cached_value(&self, characteristic: Uuid) -> Option<&[u8]> {
        self.cache.get(characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{FakeTransport, Request, profile, uuid};

    #[test]
    fn test_send_requires_discovery() {
        let descriptor = profile();
        let cache = ValueCache::new();
        let mut transport = FakeTransport::new();
        let mut link = Link::new(&descriptor, &mut transport, &cache);
        assert_eq!(
            link.send(&[1], uuid(0x101)),
            Err(TransportError::ServiceNotDiscovered(uuid(0x100)))
        );
    }

    #[test]
    fn test_send_uses_configured_write_mode() {
        let descriptor = profile();
        let cache = ValueCache::new();
        let mut transport = FakeTransport::ready_for(&descriptor);
        {
            let mut link = Link::new(&descriptor, &mut transport, &cache);
            link.send(&[1, 2], uuid(0x101)).unwrap();
            link.read_value(uuid(0x102)).unwrap();
        }
        assert_eq!(
            transport.take_requests(),
            vec![
                Request::Write(uuid(0x101), vec![1, 2], WriteMode::WithResponse),
                Request::Read(uuid(0x102)),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "not configured for writing")]
    fn test_send_to_read_only_characteristic_is_fatal() {
        let descriptor = profile();
        let cache = ValueCache::new();
        let mut transport = FakeTransport::ready_for(&descriptor);
        let mut link = Link::new(&descriptor, &mut transport, &cache);
        let _ = link.send(&[1], uuid(0x102));
    }
}
