//! BlueZ transport backend.
//!
//! [`BeaconScanner`] drives adapter discovery and translates BlueZ device
//! state into monitor calls: iBeacon advertisements become detections, and
//! devices advertising the configuration service are reported as
//! configuration-mode sightings. [`BluezLinkOpener`] opens [`GattLink`]s
//! against the same adapter; each link is a thin request channel into a
//! worker task that owns the D-Bus device proxy and reports every outcome
//! as a [`LinkEvent`].
//!
//! Linux only, compiled behind the `bluetooth` feature.

use std::collections::HashMap;

use bluer::gatt::remote::{Characteristic, Descriptor};
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{pin_mut, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::beacon::{Detection, IBEACON_COMPANY_ID, IBeaconFrame};
use crate::error::{CairnError, Result};
use crate::gatt::{
    CharacteristicId, DescriptorId, GattLink, GattStatus, LinkEvent, LinkOpener, ServiceTopology,
};
use crate::monitor::BeaconMonitor;
use crate::settings::CONFIGURATION_SERVICE;

/// ATT "unlikely error", reported when BlueZ gives no finer code.
const ATT_UNLIKELY_ERROR: u8 = 0x0e;

/// How long to wait for BlueZ to resolve services after a connect.
const SERVICE_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Adapter-wide discovery loop feeding a [`BeaconMonitor`].
#[derive(Debug)]
pub struct BeaconScanner {
    adapter: Adapter,
}

impl BeaconScanner {
    /// Connect to the BlueZ session and power the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`CairnError::AdapterUnavailable`] when the session cannot be
    /// established, no adapter exists, or the adapter refuses to power on.
    pub async fn new() -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|err| CairnError::AdapterUnavailable(err.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|err| CairnError::AdapterUnavailable(err.to_string()))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|err| CairnError::AdapterUnavailable(err.to_string()))?;
        info!(adapter = %adapter.name(), "bluetooth adapter powered");
        Ok(Self { adapter })
    }

    /// A [`LinkOpener`] creating GATT links through this scanner's adapter.
    #[must_use]
    pub fn link_opener(&self) -> BluezLinkOpener {
        BluezLinkOpener {
            adapter: self.adapter.clone(),
        }
    }

    /// Run discovery until the session dies, feeding `monitor`.
    ///
    /// New devices are inspected as BlueZ announces them; on top of that
    /// every cached device is re-inspected each
    /// [`rescan_interval`](crate::config::MonitorConfig::rescan_interval),
    /// since RSSI and advertisement updates do not re-announce a device.
    ///
    /// # Errors
    ///
    /// Returns [`CairnError::DiscoveryFailed`] when discovery cannot be
    /// started or the adapter stops responding.
    pub async fn run(&self, monitor: &BeaconMonitor) -> Result<()> {
        let discovery = self
            .adapter
            .discover_devices()
            .await
            .map_err(|err| CairnError::DiscoveryFailed(err.to_string()))?;
        tokio::pin!(discovery);
        info!(adapter = %self.adapter.name(), "scanning for beacons");

        let mut rescan = time::interval(monitor.config().rescan_interval());
        loop {
            tokio::select! {
                event = discovery.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        self.inspect_address(monitor, address).await;
                    }
                    Some(AdapterEvent::DeviceRemoved(address)) => {
                        monitor.config_device_lost(&address.to_string());
                    }
                    Some(AdapterEvent::PropertyChanged(_)) => {}
                    None => {
                        return Err(CairnError::DiscoveryFailed(
                            "discovery session ended".to_owned(),
                        ));
                    }
                },
                _ = rescan.tick() => self.sweep(monitor).await?,
            }
        }
    }

    /// Inspect every device BlueZ currently knows about.
    async fn sweep(&self, monitor: &BeaconMonitor) -> Result<()> {
        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(|err| CairnError::DiscoveryFailed(err.to_string()))?;
        for address in addresses {
            self.inspect_address(monitor, address).await;
        }
        Ok(())
    }

    async fn inspect_address(&self, monitor: &BeaconMonitor, address: Address) {
        let device = match self.adapter.device(address) {
            Ok(device) => device,
            Err(err) => {
                debug!(%address, %err, "device disappeared before inspection");
                return;
            }
        };
        if let Err(err) = Self::inspect(monitor, &device).await {
            debug!(%address, %err, "device inspection failed");
        }
    }

    /// Classify one cached device. Devices without a current RSSI are not
    /// being sighted and are left alone.
    async fn inspect(monitor: &BeaconMonitor, device: &Device) -> bluer::Result<()> {
        let Some(rssi) = device.rssi().await? else {
            return Ok(());
        };
        let address = device.address().to_string();
        let config_mode = device
            .uuids()
            .await?
            .is_some_and(|uuids| uuids.contains(&CONFIGURATION_SERVICE));
        if !config_mode {
            monitor.config_device_lost(&address);
        }

        let frame = device.manufacturer_data().await?.and_then(|data| {
            data.get(&IBEACON_COMPANY_ID)
                .and_then(|bytes| IBeaconFrame::parse(bytes))
        });
        let Some(frame) = frame else {
            return Ok(());
        };
        monitor.handle_detection(Detection::new(
            frame.beacon,
            rssi,
            frame.tx_power,
            Instant::now(),
        ));
        if config_mode {
            monitor.config_device_found(&address, frame.beacon);
        }
        Ok(())
    }
}

/// [`LinkOpener`] backed by one BlueZ adapter.
#[derive(Debug, Clone)]
pub struct BluezLinkOpener {
    adapter: Adapter,
}

impl LinkOpener for BluezLinkOpener {
    fn open(&self, address: &str, events: mpsc::UnboundedSender<LinkEvent>) -> Box<dyn GattLink> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let worker = LinkWorker {
            adapter: self.adapter.clone(),
            address: address.to_owned(),
            events,
            requests: requests_rx,
            device: None,
            watcher: None,
            notifiers: HashMap::new(),
            characteristics: HashMap::new(),
            descriptors: HashMap::new(),
        };
        tokio::spawn(worker.run());
        Box::new(BluezLink {
            requests: requests_tx,
        })
    }
}

enum WorkerRequest {
    Connect,
    Close,
    DiscoverServices,
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic(CharacteristicId, Vec<u8>),
    ReadDescriptor(DescriptorId),
    WriteDescriptor(DescriptorId, Vec<u8>),
    SetNotifications(CharacteristicId, bool),
}

/// Request-forwarding half of a BlueZ link; the worker does the I/O.
struct BluezLink {
    requests: mpsc::UnboundedSender<WorkerRequest>,
}

impl GattLink for BluezLink {
    fn connect(&mut self) {
        let _ = self.requests.send(WorkerRequest::Connect);
    }

    fn close(&mut self) {
        let _ = self.requests.send(WorkerRequest::Close);
    }

    fn discover_services(&mut self) {
        let _ = self.requests.send(WorkerRequest::DiscoverServices);
    }

    fn read_characteristic(&mut self, id: &CharacteristicId) {
        let _ = self.requests.send(WorkerRequest::ReadCharacteristic(*id));
    }

    fn write_characteristic(&mut self, id: &CharacteristicId, value: &[u8]) {
        let _ = self
            .requests
            .send(WorkerRequest::WriteCharacteristic(*id, value.to_vec()));
    }

    fn read_descriptor(&mut self, id: &DescriptorId) {
        let _ = self.requests.send(WorkerRequest::ReadDescriptor(*id));
    }

    fn write_descriptor(&mut self, id: &DescriptorId, value: &[u8]) {
        let _ = self
            .requests
            .send(WorkerRequest::WriteDescriptor(*id, value.to_vec()));
    }

    fn set_notifications(&mut self, id: &CharacteristicId, enable: bool) {
        let _ = self
            .requests
            .send(WorkerRequest::SetNotifications(*id, enable));
    }
}

/// Task owning the D-Bus device proxy for one link.
///
/// Requests are served strictly in order, one at a time; the connection
/// watcher and notification forwarders are the only concurrent pieces, and
/// both are aborted on close so nothing is emitted past it.
struct LinkWorker {
    adapter: Adapter,
    address: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    device: Option<Device>,
    watcher: Option<JoinHandle<()>>,
    notifiers: HashMap<CharacteristicId, JoinHandle<()>>,
    characteristics: HashMap<CharacteristicId, Characteristic>,
    descriptors: HashMap<DescriptorId, Descriptor>,
}

impl LinkWorker {
    async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                WorkerRequest::Connect => self.connect().await,
                WorkerRequest::Close => self.close().await,
                WorkerRequest::DiscoverServices => self.discover_services().await,
                WorkerRequest::ReadCharacteristic(id) => self.read_characteristic(id).await,
                WorkerRequest::WriteCharacteristic(id, value) => {
                    self.write_characteristic(id, &value).await;
                }
                WorkerRequest::ReadDescriptor(id) => self.read_descriptor(id).await,
                WorkerRequest::WriteDescriptor(id, value) => {
                    self.write_descriptor(id, &value).await;
                }
                WorkerRequest::SetNotifications(id, enable) => {
                    self.set_notifications(id, enable).await;
                }
            }
        }
        // Link handle dropped: release the connection.
        self.close().await;
    }

    async fn connect(&mut self) {
        if let Err(err) = self.try_connect().await {
            warn!(address = %self.address, %err, "connect failed");
            let _ = self.events.send(LinkEvent::Disconnected);
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        let address = self
            .address
            .parse::<Address>()
            .map_err(|err| self.setup_error(err))?;
        let device = self
            .adapter
            .device(address)
            .map_err(|err| self.setup_error(err))?;
        device
            .connect()
            .await
            .map_err(|err| self.setup_error(err))?;
        debug!(address = %self.address, "link up");
        self.watch_disconnect(&device);
        self.device = Some(device);
        let _ = self.events.send(LinkEvent::Connected);
        Ok(())
    }

    fn setup_error(&self, message: impl ToString) -> CairnError {
        CairnError::LinkSetupFailed {
            address: self.address.clone(),
            message: message.to_string(),
        }
    }

    /// Watch the device's property stream and surface an unsolicited drop.
    fn watch_disconnect(&mut self, device: &Device) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let events = self.events.clone();
        let device = device.clone();
        self.watcher = Some(tokio::spawn(async move {
            let Ok(stream) = device.events().await else {
                return;
            };
            pin_mut!(stream);
            while let Some(DeviceEvent::PropertyChanged(property)) = stream.next().await {
                if matches!(property, DeviceProperty::Connected(false)) {
                    let _ = events.send(LinkEvent::Disconnected);
                    return;
                }
            }
        }));
    }

    async fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for (_, notifier) in self.notifiers.drain() {
            notifier.abort();
        }
        self.characteristics.clear();
        self.descriptors.clear();
        if let Some(device) = self.device.take() {
            if let Err(err) = device.disconnect().await {
                debug!(address = %self.address, %err, "disconnect failed");
            }
        }
    }

    async fn discover_services(&mut self) {
        let Some(device) = self.device.clone() else {
            self.send_discovery_failure();
            return;
        };
        let resolved =
            time::timeout(SERVICE_RESOLUTION_TIMEOUT, Self::services_resolved(&device)).await;
        if !matches!(resolved, Ok(Ok(true))) {
            debug!(address = %self.address, "service resolution did not finish");
            self.send_discovery_failure();
            return;
        }
        match self.collect_topology(&device).await {
            Ok(topology) => {
                let _ = self.events.send(LinkEvent::ServicesDiscovered {
                    status: GattStatus::Success,
                    services: topology,
                });
            }
            Err(err) => {
                debug!(address = %self.address, %err, "service enumeration failed");
                self.send_discovery_failure();
            }
        }
    }

    fn send_discovery_failure(&self) {
        let _ = self.events.send(LinkEvent::ServicesDiscovered {
            status: GattStatus::Failure(ATT_UNLIKELY_ERROR),
            services: ServiceTopology::new(),
        });
    }

    /// Wait until BlueZ reports the device's services resolved. Returns
    /// `false` when the connection drops first.
    async fn services_resolved(device: &Device) -> bluer::Result<bool> {
        if device.is_services_resolved().await? {
            return Ok(true);
        }
        let events = device.events().await?;
        pin_mut!(events);
        while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
            match property {
                DeviceProperty::ServicesResolved(true) => return Ok(true),
                DeviceProperty::Connected(false) => return Ok(false),
                _ => {}
            }
        }
        Ok(false)
    }

    async fn collect_topology(&mut self, device: &Device) -> bluer::Result<ServiceTopology> {
        self.characteristics.clear();
        self.descriptors.clear();
        let mut topology = ServiceTopology::new();
        for service in device.services().await? {
            let service_uuid = service.uuid().await?;
            topology.insert_service(service_uuid);
            for characteristic in service.characteristics().await? {
                let characteristic_uuid = characteristic.uuid().await?;
                topology.insert_characteristic(service_uuid, characteristic_uuid);
                for descriptor in characteristic.descriptors().await? {
                    let descriptor_uuid = descriptor.uuid().await?;
                    topology.insert_descriptor(service_uuid, characteristic_uuid, descriptor_uuid);
                    self.descriptors.insert(
                        DescriptorId::new(service_uuid, characteristic_uuid, descriptor_uuid),
                        descriptor,
                    );
                }
                self.characteristics.insert(
                    CharacteristicId::new(service_uuid, characteristic_uuid),
                    characteristic,
                );
            }
        }
        Ok(topology)
    }

    async fn read_characteristic(&self, id: CharacteristicId) {
        let event = match self.characteristics.get(&id) {
            Some(characteristic) => match characteristic.read().await {
                Ok(value) => LinkEvent::CharacteristicRead {
                    id,
                    status: GattStatus::Success,
                    value: Some(value),
                },
                Err(err) => {
                    debug!(characteristic = %id.characteristic, %err, "read failed");
                    LinkEvent::CharacteristicRead {
                        id,
                        status: GattStatus::Failure(ATT_UNLIKELY_ERROR),
                        value: None,
                    }
                }
            },
            None => LinkEvent::CharacteristicRead {
                id,
                status: GattStatus::Failure(ATT_UNLIKELY_ERROR),
                value: None,
            },
        };
        let _ = self.events.send(event);
    }

    async fn write_characteristic(&self, id: CharacteristicId, value: &[u8]) {
        let status = match self.characteristics.get(&id) {
            Some(characteristic) => match characteristic.write(value).await {
                Ok(()) => GattStatus::Success,
                Err(err) => {
                    debug!(characteristic = %id.characteristic, %err, "write failed");
                    GattStatus::Failure(ATT_UNLIKELY_ERROR)
                }
            },
            None => GattStatus::Failure(ATT_UNLIKELY_ERROR),
        };
        let _ = self
            .events
            .send(LinkEvent::CharacteristicWritten { id, status });
    }

    async fn read_descriptor(&self, id: DescriptorId) {
        let event = match self.descriptors.get(&id) {
            Some(descriptor) => match descriptor.read().await {
                Ok(value) => LinkEvent::DescriptorRead {
                    id,
                    status: GattStatus::Success,
                    value: Some(value),
                },
                Err(err) => {
                    debug!(descriptor = %id.descriptor, %err, "descriptor read failed");
                    LinkEvent::DescriptorRead {
                        id,
                        status: GattStatus::Failure(ATT_UNLIKELY_ERROR),
                        value: None,
                    }
                }
            },
            None => LinkEvent::DescriptorRead {
                id,
                status: GattStatus::Failure(ATT_UNLIKELY_ERROR),
                value: None,
            },
        };
        let _ = self.events.send(event);
    }

    async fn write_descriptor(&self, id: DescriptorId, value: &[u8]) {
        let status = match self.descriptors.get(&id) {
            Some(descriptor) => match descriptor.write(value).await {
                Ok(()) => GattStatus::Success,
                Err(err) => {
                    debug!(descriptor = %id.descriptor, %err, "descriptor write failed");
                    GattStatus::Failure(ATT_UNLIKELY_ERROR)
                }
            },
            None => GattStatus::Failure(ATT_UNLIKELY_ERROR),
        };
        let _ = self.events.send(LinkEvent::DescriptorWritten { id, status });
    }

    /// Start or stop a notification forwarder for one characteristic.
    ///
    /// BlueZ writes the client configuration descriptor itself as part of
    /// `StartNotify`; it also hides that descriptor, so the controller's
    /// follow-up descriptor write never targets this backend.
    async fn set_notifications(&mut self, id: CharacteristicId, enable: bool) {
        if let Some(notifier) = self.notifiers.remove(&id) {
            notifier.abort();
        }
        if !enable {
            return;
        }
        let Some(characteristic) = self.characteristics.get(&id) else {
            debug!(characteristic = %id.characteristic, "cannot notify an unknown characteristic");
            return;
        };
        match characteristic.notify().await {
            Ok(stream) => {
                let events = self.events.clone();
                self.notifiers.insert(
                    id,
                    tokio::spawn(async move {
                        pin_mut!(stream);
                        while let Some(value) = stream.next().await {
                            let _ = events.send(LinkEvent::Notification { id, value });
                        }
                    }),
                );
            }
            Err(err) => {
                debug!(characteristic = %id.characteristic, %err, "notify session failed");
            }
        }
    }
}
