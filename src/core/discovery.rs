//! Discovery handshake: services, then characteristics, then notification
//! subscriptions.
//!
//! The monitor keeps no per-step continuation. Every pass re-reads what the
//! transport currently knows and walks the three gates from the top, issuing
//! at most one request. The only stored state is whether a scan is in flight.

use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::descriptor::EndpointDescriptor;
use crate::core::error::TransportError;
use crate::core::transport::{TransportEvent, TransportPort};

/// Readiness derived from the transport's current knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    NeedsPreparation,
    Preparing,
    Ready,
}

/// The single request a readiness pass wants issued next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStep {
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics { service: Uuid, characteristics: Vec<Uuid> },
    EnableNotification(Uuid),
}

/// Result of [`DiscoveryMonitor::scan`] or of a callback-driven pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    /// A scan was already in flight; nothing was done.
    AlreadyScanning,
    /// A request was issued; the pass continues on its callback.
    InProgress,
    /// All gates passed. Scanning is over.
    Finished,
    /// The transport failed. Scanning is over and must be restarted.
    Failed(TransportError),
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Finished | ScanStatus::Failed(_))
    }
}

pub struct DiscoveryMonitor {
    descriptor: Arc<EndpointDescriptor>,
    scanning: bool,
    label: String,
}

impl DiscoveryMonitor {
    pub fn new(descriptor: Arc<EndpointDescriptor>, label: impl Into<String>) -> Self {
        Self {
            descriptor,
            scanning: false,
            label: label.into(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Forgets an in-flight scan, e.g. after the link went down.
    pub fn reset(&mut self) {
        self.scanning = false;
    }

    /// Starts a scan unless one is already in flight.
    pub fn scan(&mut self, transport: &mut dyn TransportPort) -> ScanStatus {
        if self.scanning {
            debug!("[{}] scan already in flight", self.label);
            return ScanStatus::AlreadyScanning;
        }
        info!("[{}] starting discovery", self.label);
        self.scanning = true;
        self.run_pass(transport)
    }

    /// Feeds a discovery-phase callback into the in-flight scan.
    ///
    /// Returns `None` for value/write callbacks and for callbacks that arrive
    /// while no scan is running.
    pub fn handle_event(
        &mut self,
        event: &TransportEvent,
        transport: &mut dyn TransportPort,
    ) -> Option<ScanStatus> {
        let error = match event {
            TransportEvent::ServicesDiscovered { error } => error,
            TransportEvent::CharacteristicsDiscovered { error, .. } => error,
            TransportEvent::NotificationStateChanged { error, .. } => error,
            TransportEvent::ValueUpdated { .. } | TransportEvent::ValueWritten { .. } => {
                return None;
            }
        };

        if !self.scanning {
            debug!("[{}] ignoring {:?} outside of a scan", self.label, event);
            return None;
        }

        if let Some(e) = error {
            return Some(self.abort(e.clone()));
        }
        Some(self.run_pass(transport))
    }

    /// Computed readiness. Never stored.
    pub fn state(&self, transport: &dyn TransportPort) -> DiscoveryState {
        if self.scanning {
            DiscoveryState::Preparing
        } else if self.next_step(transport).is_none() {
            DiscoveryState::Ready
        } else {
            DiscoveryState::NeedsPreparation
        }
    }

    /// Walks the gates and returns the first unmet one.
    pub fn next_step(&self, transport: &dyn TransportPort) -> Option<DiscoveryStep> {
        let services = self.descriptor.service_addresses();
        if !services.iter().all(|&s| transport.has_service(s)) {
            return Some(DiscoveryStep::DiscoverServices(services));
        }

        for service in self.descriptor.services() {
            let missing = service
                .characteristics
                .iter()
                .any(|c| !transport.has_characteristic(service.address, c.address));
            if missing {
                return Some(DiscoveryStep::DiscoverCharacteristics {
                    service: service.address,
                    characteristics: service.characteristic_addresses(),
                });
            }
        }

        self.descriptor
            .notifiable()
            .find(|c| !transport.is_notifying(c.address))
            .map(|c| DiscoveryStep::EnableNotification(c.address))
    }

    fn run_pass(&mut self, transport: &mut dyn TransportPort) -> ScanStatus {
        let Some(step) = self.next_step(transport) else {
            info!("[{}] discovery finished", self.label);
            self.scanning = false;
            return ScanStatus::Finished;
        };

        debug!("[{}] discovery step {:?}", self.label, step);
        let issued = match &step {
            DiscoveryStep::DiscoverServices(services) => transport.discover_services(services),
            DiscoveryStep::DiscoverCharacteristics {
                service,
                characteristics,
            } => transport.discover_characteristics(characteristics, *service),
            DiscoveryStep::EnableNotification(characteristic) => {
                transport.set_notification(true, *characteristic)
            }
        };

        match issued {
            Ok(()) => ScanStatus::InProgress,
            Err(e) => self.abort(e),
        }
    }

    fn abort(&mut self, error: TransportError) -> ScanStatus {
        warn!("[{}] discovery failed: {}", self.label, error);
        self.scanning = false;
        ScanStatus::Failed(error)
    }
}
