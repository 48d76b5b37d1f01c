//! GATT link abstraction shared by the connection controller and the
//! transport backends.
//!
//! A [`GattLink`] is the driver side of one peripheral connection. Its
//! methods are fire-and-forget requests; every outcome comes back
//! asynchronously as a [`LinkEvent`] on the channel handed to
//! [`LinkOpener::open`]. Implementations must stop emitting events once
//! [`GattLink::close`] has been called.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use uuid::{uuid, Uuid};

/// Client Characteristic Configuration descriptor, present on every
/// characteristic that supports notifications.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid =
    uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// CCCD payload that turns notifications on (bit 0 of a little-endian u16).
pub const NOTIFICATION_ENABLE: [u8; 2] = [0x01, 0x00];

/// Outcome of a single GATT request, as reported by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    /// The request was accepted and executed.
    Success,
    /// The request failed with a transport- or peripheral-level code.
    Failure(u8),
}

impl GattStatus {
    /// Whether this status reports success.
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Address of a characteristic within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    /// Service the characteristic belongs to.
    pub service: Uuid,
    /// The characteristic itself.
    pub characteristic: Uuid,
}

impl CharacteristicId {
    /// Build a characteristic address.
    #[must_use]
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// Address of a descriptor within a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
    /// Service the owning characteristic belongs to.
    pub service: Uuid,
    /// The owning characteristic.
    pub characteristic: Uuid,
    /// The descriptor itself.
    pub descriptor: Uuid,
}

impl DescriptorId {
    /// Build a descriptor address.
    #[must_use]
    pub const fn new(service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Self {
        Self {
            service,
            characteristic,
            descriptor,
        }
    }

    /// The characteristic this descriptor hangs off.
    #[must_use]
    pub const fn characteristic_id(&self) -> CharacteristicId {
        CharacteristicId::new(self.service, self.characteristic)
    }
}

/// Attribute layout discovered on a peripheral: services, their
/// characteristics, and each characteristic's descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTopology {
    services: HashMap<Uuid, HashMap<Uuid, HashSet<Uuid>>>,
}

impl ServiceTopology {
    /// An empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a service, keeping any characteristics already recorded under
    /// it.
    pub fn insert_service(&mut self, service: Uuid) {
        self.services.entry(service).or_default();
    }

    /// Record a characteristic under a service.
    pub fn insert_characteristic(&mut self, service: Uuid, characteristic: Uuid) {
        self.services
            .entry(service)
            .or_default()
            .entry(characteristic)
            .or_default();
    }

    /// Record a descriptor under a characteristic.
    pub fn insert_descriptor(&mut self, service: Uuid, characteristic: Uuid, descriptor: Uuid) {
        self.services
            .entry(service)
            .or_default()
            .entry(characteristic)
            .or_default()
            .insert(descriptor);
    }

    /// Whether the peripheral exposes `service`.
    #[must_use]
    pub fn has_service(&self, service: Uuid) -> bool {
        self.services.contains_key(&service)
    }

    /// Whether `service` exposes `characteristic`.
    #[must_use]
    pub fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.services
            .get(&service)
            .is_some_and(|chars| chars.contains_key(&characteristic))
    }

    /// Whether `characteristic` carries `descriptor`.
    #[must_use]
    pub fn has_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> bool {
        self.services
            .get(&service)
            .and_then(|chars| chars.get(&characteristic))
            .is_some_and(|descriptors| descriptors.contains(&descriptor))
    }
}

/// Something that happened on a link, delivered on the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The physical connection came up.
    Connected,
    /// The physical connection dropped, locally or remotely.
    Disconnected,
    /// Service discovery finished; `services` is empty unless `status`
    /// reports success.
    ServicesDiscovered {
        /// Discovery outcome.
        status: GattStatus,
        /// Attribute layout of the peripheral.
        services: ServiceTopology,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        /// The characteristic that was read.
        id: CharacteristicId,
        /// Read outcome.
        status: GattStatus,
        /// Value returned by the peripheral, if any came back.
        value: Option<Vec<u8>>,
    },
    /// A characteristic write finished.
    CharacteristicWritten {
        /// The characteristic that was written.
        id: CharacteristicId,
        /// Write outcome.
        status: GattStatus,
    },
    /// A descriptor read finished.
    DescriptorRead {
        /// The descriptor that was read.
        id: DescriptorId,
        /// Read outcome.
        status: GattStatus,
        /// Value returned by the peripheral, if any came back.
        value: Option<Vec<u8>>,
    },
    /// A descriptor write finished.
    DescriptorWritten {
        /// The descriptor that was written.
        id: DescriptorId,
        /// Write outcome.
        status: GattStatus,
    },
    /// The peripheral pushed a notification for a subscribed characteristic.
    Notification {
        /// The characteristic that notified.
        id: CharacteristicId,
        /// Notified value.
        value: Vec<u8>,
    },
}

/// Driver side of one peripheral connection.
///
/// All methods are non-blocking requests; outcomes arrive as [`LinkEvent`]s.
/// After [`close`](Self::close) the implementation must emit no further
/// events for this link.
pub trait GattLink: Send {
    /// Open the physical connection.
    fn connect(&mut self);
    /// Tear the physical connection down and release its resources.
    fn close(&mut self);
    /// Enumerate services, characteristics and descriptors.
    fn discover_services(&mut self);
    /// Read a characteristic value.
    fn read_characteristic(&mut self, id: &CharacteristicId);
    /// Write a characteristic value.
    fn write_characteristic(&mut self, id: &CharacteristicId, value: &[u8]);
    /// Read a descriptor value.
    fn read_descriptor(&mut self, id: &DescriptorId);
    /// Write a descriptor value.
    fn write_descriptor(&mut self, id: &DescriptorId, value: &[u8]);
    /// Enable or disable local dispatch of notifications for a
    /// characteristic.
    fn set_notifications(&mut self, id: &CharacteristicId, enable: bool);
}

impl<T: GattLink + ?Sized> GattLink for Box<T> {
    fn connect(&mut self) {
        (**self).connect();
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn discover_services(&mut self) {
        (**self).discover_services();
    }

    fn read_characteristic(&mut self, id: &CharacteristicId) {
        (**self).read_characteristic(id);
    }

    fn write_characteristic(&mut self, id: &CharacteristicId, value: &[u8]) {
        (**self).write_characteristic(id, value);
    }

    fn read_descriptor(&mut self, id: &DescriptorId) {
        (**self).read_descriptor(id);
    }

    fn write_descriptor(&mut self, id: &DescriptorId, value: &[u8]) {
        (**self).write_descriptor(id, value);
    }

    fn set_notifications(&mut self, id: &CharacteristicId, enable: bool) {
        (**self).set_notifications(id, enable);
    }
}

/// Factory for links, one per peripheral address.
///
/// The opener hands every link a sender for its events; the receiving half
/// stays with whoever drives the link.
pub trait LinkOpener: Send + Sync {
    /// Create a link to the peripheral at `address`, wired to `events`.
    fn open(&self, address: &str, events: mpsc::UnboundedSender<LinkEvent>) -> Box<dyn GattLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = uuid!("59ec0800-0b1e-4063-8b16-b00b50aa3a7e");
    const CHARACTERISTIC: Uuid = uuid!("59ec0a05-0b1e-4063-8b16-b00b50aa3a7e");

    #[test]
    fn test_status_classification() {
        assert!(GattStatus::Success.is_success());
        assert!(!GattStatus::Failure(0x85).is_success());
    }

    #[test]
    fn test_topology_lookups() {
        let mut topology = ServiceTopology::new();
        topology.insert_characteristic(SERVICE, CHARACTERISTIC);
        topology.insert_descriptor(SERVICE, CHARACTERISTIC, CLIENT_CHARACTERISTIC_CONFIGURATION);

        assert!(topology.has_service(SERVICE));
        assert!(topology.has_characteristic(SERVICE, CHARACTERISTIC));
        assert!(topology.has_descriptor(
            SERVICE,
            CHARACTERISTIC,
            CLIENT_CHARACTERISTIC_CONFIGURATION
        ));

        assert!(!topology.has_service(CHARACTERISTIC));
        assert!(!topology.has_characteristic(SERVICE, SERVICE));
        assert!(!topology.has_descriptor(SERVICE, CHARACTERISTIC, SERVICE));
    }

    #[test]
    fn test_empty_service_has_no_characteristics() {
        let mut topology = ServiceTopology::new();
        topology.insert_service(SERVICE);

        assert!(topology.has_service(SERVICE));
        assert!(!topology.has_characteristic(SERVICE, CHARACTERISTIC));
    }

    #[test]
    fn test_descriptor_id_projects_characteristic() {
        let id = DescriptorId::new(SERVICE, CHARACTERISTIC, CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(
            id.characteristic_id(),
            CharacteristicId::new(SERVICE, CHARACTERISTIC)
        );
    }
}
