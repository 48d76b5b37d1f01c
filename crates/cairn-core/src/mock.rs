//! Test doubles for the GATT seam.
//!
//! [`MockLink`] records every request a controller issues; tests read the
//! recording back through a [`LinkProbe`] and inject [`LinkEvent`]s by hand.
//! [`MockOpener`] hands out mock links and keeps the event sender of each,
//! so tests can drive a whole monitor without any radio. Compiled for this
//! crate's own tests and for downstream ones via the `mock-link` feature.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::gatt::{CharacteristicId, DescriptorId, GattLink, LinkEvent, LinkOpener};

/// One request issued against a [`MockLink`], in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    /// `connect` was called.
    Connect,
    /// `close` was called.
    Close,
    /// `discover_services` was called.
    DiscoverServices,
    /// `read_characteristic` was called.
    ReadCharacteristic(CharacteristicId),
    /// `write_characteristic` was called with these bytes.
    WriteCharacteristic(CharacteristicId, Vec<u8>),
    /// `read_descriptor` was called.
    ReadDescriptor(DescriptorId),
    /// `write_descriptor` was called with these bytes.
    WriteDescriptor(DescriptorId, Vec<u8>),
    /// `set_notifications` was called with this flag.
    SetNotifications(CharacteristicId, bool),
}

/// [`GattLink`] implementation that records requests instead of touching a
/// radio. Events never originate here; tests inject them directly.
#[derive(Debug)]
pub struct MockLink {
    requests: Arc<Mutex<Vec<LinkRequest>>>,
}

impl MockLink {
    /// Create a link together with the probe over its recording.
    #[must_use]
    pub fn new() -> (Self, LinkProbe) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let probe = LinkProbe {
            requests: Arc::clone(&requests),
        };
        (Self { requests }, probe)
    }

    fn record(&self, request: LinkRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }
}

impl GattLink for MockLink {
    fn connect(&mut self) {
        self.record(LinkRequest::Connect);
    }

    fn close(&mut self) {
        self.record(LinkRequest::Close);
    }

    fn discover_services(&mut self) {
        self.record(LinkRequest::DiscoverServices);
    }

    fn read_characteristic(&mut self, id: &CharacteristicId) {
        self.record(LinkRequest::ReadCharacteristic(*id));
    }

    fn write_characteristic(&mut self, id: &CharacteristicId, value: &[u8]) {
        self.record(LinkRequest::WriteCharacteristic(*id, value.to_vec()));
    }

    fn read_descriptor(&mut self, id: &DescriptorId) {
        self.record(LinkRequest::ReadDescriptor(*id));
    }

    fn write_descriptor(&mut self, id: &DescriptorId, value: &[u8]) {
        self.record(LinkRequest::WriteDescriptor(*id, value.to_vec()));
    }

    fn set_notifications(&mut self, id: &CharacteristicId, enable: bool) {
        self.record(LinkRequest::SetNotifications(*id, enable));
    }
}

/// Shared view over a [`MockLink`]'s recorded requests.
#[derive(Debug, Clone)]
pub struct LinkProbe {
    requests: Arc<Mutex<Vec<LinkRequest>>>,
}

impl LinkProbe {
    /// Drain and return everything recorded since the last call.
    pub fn take(&self) -> Vec<LinkRequest> {
        std::mem::take(
            &mut *self
                .requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Record of one link handed out by a [`MockOpener`].
#[derive(Debug, Clone)]
pub struct OpenedLink {
    /// Peripheral address the link was opened for.
    pub address: String,
    /// Sender for injecting link events into the owning task's loop.
    pub events: mpsc::UnboundedSender<LinkEvent>,
    /// Probe over the link's recorded requests.
    pub probe: LinkProbe,
}

/// [`LinkOpener`] producing [`MockLink`]s, retaining each link's address,
/// event sender and probe for the test to pick up.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    opened: Arc<Mutex<Vec<OpenedLink>>>,
}

impl MockOpener {
    /// An opener with no links handed out yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Links opened so far, oldest first.
    #[must_use]
    pub fn opened(&self) -> Vec<OpenedLink> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LinkOpener for MockOpener {
    fn open(&self, address: &str, events: mpsc::UnboundedSender<LinkEvent>) -> Box<dyn GattLink> {
        let (link, probe) = MockLink::new();
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OpenedLink {
                address: address.to_owned(),
                events,
                probe,
            });
        Box::new(link)
    }
}

#[cfg(test)]
mod tests {
    use uuid::uuid;

    use super::*;

    #[test]
    fn test_probe_drains_requests_in_order() {
        let (mut link, probe) = MockLink::new();
        let id = CharacteristicId::new(
            uuid!("59ec0800-0b1e-4063-8b16-b00b50aa3a7e"),
            uuid!("59ec0a05-0b1e-4063-8b16-b00b50aa3a7e"),
        );

        link.connect();
        link.write_characteristic(&id, &[1, 2]);
        assert_eq!(
            probe.take(),
            vec![
                LinkRequest::Connect,
                LinkRequest::WriteCharacteristic(id, vec![1, 2]),
            ]
        );
        assert_eq!(probe.take(), vec![]);
    }

    #[test]
    fn test_opener_retains_address_and_probe() {
        let opener = MockOpener::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let mut link = opener.open("DC:0D:30:01:02:03", events_tx);
        link.connect();

        let opened = opener.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].address, "DC:0D:30:01:02:03");
        assert_eq!(opened[0].probe.take(), vec![LinkRequest::Connect]);
    }
}
