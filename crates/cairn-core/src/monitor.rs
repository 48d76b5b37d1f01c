//! Beacon registry and event fan-in.
//!
//! A [`BeaconMonitor`] owns everything the SDK tracks: one watcher task per
//! registered beacon, the command batch to push when that beacon shows up
//! in configuration mode, and one update session per peripheral address
//! currently being configured. All caller-visible activity comes out of a
//! single [`TagEvent`] channel handed back by [`BeaconMonitor::new`].
//!
//! The monitor is cheap to clone and safe to share; a transport backend
//! (see the `bluez` module) feeds it detections and configuration-mode
//! sightings, and tests drive the same entry points directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::beacon::{BeaconId, Detection};
use crate::config::MonitorConfig;
use crate::gatt::LinkOpener;
use crate::settings::{TagSettings, WriteCommand};
use crate::trigger::{BeaconWatcher, WatcherHandle};
use crate::updater::{TagUpdater, UpdaterHandle};

/// Caller-visible event emitted on the monitor's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagEvent {
    /// A registered beacon's trigger policy matched a zone transition.
    TriggerFired {
        /// The beacon that triggered.
        beacon: BeaconId,
        /// When the transition was evaluated.
        at: DateTime<Utc>,
    },
    /// A configuration push converged every attribute of its checklist.
    TagUpdated {
        /// The beacon that was updated.
        beacon: BeaconId,
        /// When the update completed.
        at: DateTime<Utc>,
    },
}

struct MonitorInner {
    config: MonitorConfig,
    opener: Box<dyn LinkOpener>,
    watchers: Mutex<HashMap<BeaconId, WatcherHandle>>,
    commands: Mutex<HashMap<BeaconId, Vec<WriteCommand>>>,
    sessions: Mutex<HashMap<String, UpdaterHandle>>,
    events: mpsc::UnboundedSender<TagEvent>,
}

/// Shared handle over one monitoring context.
///
/// Watcher and updater tasks are spawned onto the current tokio runtime, so
/// the monitor must be created and used within one.
#[derive(Clone)]
pub struct BeaconMonitor {
    inner: Arc<MonitorInner>,
}

impl BeaconMonitor {
    /// Create a monitor and the receiving half of its event channel.
    #[must_use]
    pub fn new(
        config: MonitorConfig,
        opener: impl LinkOpener + 'static,
    ) -> (Self, mpsc::UnboundedReceiver<TagEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                config,
                opener: Box::new(opener),
                watchers: Mutex::new(HashMap::new()),
                commands: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                events: events_tx,
            }),
        };
        (monitor, events_rx)
    }

    /// The configuration this monitor runs with.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Register a beacon for detection and configuration.
    ///
    /// Spawns the beacon's watcher task and stores the settings' command
    /// batch for the next configuration-mode sighting. Registering an
    /// already-registered beacon replaces the previous registration; its
    /// watcher is deactivated first.
    pub fn register(&self, settings: &TagSettings) {
        let beacon = settings.beacon();
        let (watcher, handle) = BeaconWatcher::new(
            beacon,
            settings.policy(),
            self.inner.config.window(),
            self.inner.config.visibility_timeout(),
            self.inner.events.clone(),
        );
        if let Some(previous) = lock(&self.inner.watchers).insert(beacon, handle) {
            debug!(%beacon, "replacing existing registration");
            previous.deactivate();
        }
        lock(&self.inner.commands).insert(beacon, settings.commands());
        tokio::spawn(watcher.run());
        info!(%beacon, policy = ?settings.policy(), "beacon registered");
    }

    /// Drop a beacon's registration: its watcher is deactivated and its
    /// command batch forgotten. An update already running against the
    /// beacon is left to finish.
    pub fn unregister(&self, beacon: BeaconId) {
        if let Some(handle) = lock(&self.inner.watchers).remove(&beacon) {
            handle.deactivate();
        }
        lock(&self.inner.commands).remove(&beacon);
        info!(%beacon, "beacon unregistered");
    }

    /// Feed one detection; routed to the beacon's watcher, dropped when the
    /// beacon is not registered.
    pub fn handle_detection(&self, detection: Detection) {
        if let Some(handle) = lock(&self.inner.watchers).get(&detection.beacon) {
            handle.observe(detection);
        }
    }

    /// A registered beacon was sighted advertising configuration mode at
    /// `address`. Starts an update session unless one is already running
    /// for that address.
    pub fn config_device_found(&self, address: &str, beacon: BeaconId) {
        let commands = match lock(&self.inner.commands).get(&beacon) {
            Some(commands) => commands.clone(),
            None => return,
        };
        let mut sessions = lock(&self.inner.sessions);
        if sessions.contains_key(address) {
            return;
        }
        info!(%beacon, address, "tag in configuration mode, starting update");
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let link = self.inner.opener.open(address, link_tx);
        let (updater, handle) = TagUpdater::new(
            beacon,
            address.to_owned(),
            commands,
            link,
            link_rx,
            &self.inner.config,
            self.inner.events.clone(),
        );
        sessions.insert(address.to_owned(), handle);
        tokio::spawn(updater.run());
    }

    /// The peripheral at `address` stopped advertising configuration mode:
    /// abort its update session, if one is running.
    pub fn config_device_lost(&self, address: &str) {
        if let Some(handle) = lock(&self.inner.sessions).remove(address) {
            debug!(address, "tag left configuration mode, aborting update");
            handle.abort();
        }
    }

    /// Deactivate every watcher and abort every update session.
    pub fn shutdown(&self) {
        let watchers: Vec<_> = lock(&self.inner.watchers).drain().collect();
        for (_, handle) in watchers {
            handle.deactivate();
        }
        lock(&self.inner.commands).clear();
        let sessions: Vec<_> = lock(&self.inner.sessions).drain().collect();
        for (_, handle) in sessions {
            handle.abort();
        }
        info!("monitor shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::{self, Duration, Instant};
    use uuid::uuid;

    use crate::beacon::Zone;
    use crate::gatt::{CharacteristicId, GattStatus, LinkEvent, ServiceTopology};
    use crate::mock::{LinkRequest, MockOpener};
    use crate::settings::{
        ACCELERATION_CHARACTERISTIC, ANGULAR_SPEED_CHARACTERISTIC, SLEEP_CHARACTERISTIC,
        TEMPERATURE_CHARACTERISTIC, WAKE_UP_SERVICE,
    };
    use crate::trigger::TriggerPolicy;

    use super::*;

    const ADDRESS: &str = "DC:0D:30:01:02:03";

    fn beacon() -> BeaconId {
        BeaconId::new(uuid!("e2c56db5-dffb-48d2-b060-d0f5a71096e0"), 11, 7)
    }

    fn sample(zone: Zone) -> Detection {
        let rssi = match zone {
            Zone::Immediate => -59,
            Zone::Near => -69,
            Zone::Far => -89,
        };
        Detection::new(beacon(), rssi, -59, Instant::now())
    }

    fn wake_up_topology() -> ServiceTopology {
        let mut topology = ServiceTopology::new();
        topology.insert_characteristic(WAKE_UP_SERVICE, SLEEP_CHARACTERISTIC);
        topology.insert_characteristic(WAKE_UP_SERVICE, TEMPERATURE_CHARACTERISTIC);
        topology.insert_characteristic(WAKE_UP_SERVICE, ACCELERATION_CHARACTERISTIC);
        topology.insert_characteristic(WAKE_UP_SERVICE, ANGULAR_SPEED_CHARACTERISTIC);
        topology
    }

    /// Drain event-driven work; too short for any configured delay to
    /// elapse.
    async fn quiesce() {
        time::sleep(Duration::from_millis(1)).await;
    }

    /// Run past the updater's pre-connect grace delay.
    async fn connect_grace() {
        time::sleep(Duration::from_millis(150)).await;
    }

    fn new_monitor() -> (BeaconMonitor, mpsc::UnboundedReceiver<TagEvent>, MockOpener) {
        let opener = MockOpener::new();
        let (monitor, events) = BeaconMonitor::new(MonitorConfig::default(), opener.clone());
        (monitor, events, opener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_detections_reach_registered_watcher() {
        let (monitor, mut events, _opener) = new_monitor();
        monitor.register(&TagSettings::new(beacon()));

        monitor.handle_detection(sample(Zone::Near));
        quiesce().await;

        assert!(matches!(
            events.try_recv(),
            Ok(TagEvent::TriggerFired { beacon: b, .. }) if b == beacon()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_detections_are_dropped() {
        let (monitor, mut events, _opener) = new_monitor();

        monitor.handle_detection(sample(Zone::Near));
        quiesce().await;

        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistering_replaces_the_watcher() {
        let (monitor, mut events, _opener) = new_monitor();

        monitor.register(&TagSettings::new(beacon()));
        let mut exit_settings = TagSettings::new(beacon());
        exit_settings.set_policy(TriggerPolicy::Exit);
        monitor.register(&exit_settings);
        quiesce().await;

        // Under the old Enter policy this sample would fire; the replaced
        // watcher must stay silent and the new Exit policy has nothing yet.
        monitor.handle_detection(sample(Zone::Near));
        quiesce().await;
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

        // The visibility timeout turns the commitment into a loss, which
        // the Exit policy reports exactly once.
        let event = events.recv().await;
        assert!(matches!(event, Some(TagEvent::TriggerFired { .. })));
        quiesce().await;
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_silences_the_beacon() {
        let (monitor, mut events, _opener) = new_monitor();

        monitor.register(&TagSettings::new(beacon()));
        monitor.unregister(beacon());
        monitor.handle_detection(sample(Zone::Near));
        quiesce().await;

        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_sighting_opens_one_session() {
        let (monitor, _events, opener) = new_monitor();
        monitor.register(&TagSettings::new(beacon()));

        monitor.config_device_found(ADDRESS, beacon());
        monitor.config_device_found(ADDRESS, beacon());
        connect_grace().await;

        let opened = opener.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].address, ADDRESS);
        assert_eq!(opened[0].probe.take(), vec![LinkRequest::Connect]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_beacon_opens_no_session() {
        let (monitor, _events, opener) = new_monitor();

        monitor.config_device_found(ADDRESS, beacon());
        quiesce().await;

        assert!(opener.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_runs_to_completion_through_the_monitor() {
        let (monitor, mut events, opener) = new_monitor();
        monitor.register(&TagSettings::new(beacon()));
        monitor.config_device_found(ADDRESS, beacon());
        connect_grace().await;

        let opened = opener.opened();
        let link = &opened[0];
        assert_eq!(link.probe.take(), vec![LinkRequest::Connect]);

        link.events.send(LinkEvent::Connected).unwrap();
        quiesce().await;
        assert_eq!(link.probe.take(), vec![LinkRequest::DiscoverServices]);

        link.events
            .send(LinkEvent::ServicesDiscovered {
                status: GattStatus::Success,
                services: wake_up_topology(),
            })
            .unwrap();
        quiesce().await;

        // Default settings converge without writes when every read already
        // matches the desired value: sleep [1, 0, 0], switches all off.
        let reads = [
            (SLEEP_CHARACTERISTIC, vec![1, 0, 0]),
            (TEMPERATURE_CHARACTERISTIC, vec![0, 10, 20]),
            (ACCELERATION_CHARACTERISTIC, vec![0, 0, 0, 0, 0]),
            (ANGULAR_SPEED_CHARACTERISTIC, vec![0, 0, 0, 0, 0]),
        ];
        for (characteristic, value) in reads {
            link.events
                .send(LinkEvent::CharacteristicRead {
                    id: CharacteristicId::new(WAKE_UP_SERVICE, characteristic),
                    status: GattStatus::Success,
                    value: Some(value),
                })
                .unwrap();
            quiesce().await;
        }

        assert!(matches!(
            events.try_recv(),
            Ok(TagEvent::TagUpdated { beacon: b, .. }) if b == beacon()
        ));
        assert!(link.probe.take().contains(&LinkRequest::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_configuration_mode_aborts_and_frees_the_address() {
        let (monitor, mut events, opener) = new_monitor();
        monitor.register(&TagSettings::new(beacon()));

        monitor.config_device_found(ADDRESS, beacon());
        connect_grace().await;
        monitor.config_device_lost(ADDRESS);
        quiesce().await;

        assert!(opener.opened()[0].probe.take().contains(&LinkRequest::Close));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

        // The address is free again: a fresh sighting opens a new session.
        monitor.config_device_found(ADDRESS, beacon());
        quiesce().await;
        assert_eq!(opener.opened().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_watchers_and_sessions() {
        let (monitor, mut events, opener) = new_monitor();
        monitor.register(&TagSettings::new(beacon()));
        monitor.config_device_found(ADDRESS, beacon());
        connect_grace().await;

        monitor.shutdown();
        quiesce().await;

        assert!(opener.opened()[0].probe.take().contains(&LinkRequest::Close));
        monitor.handle_detection(sample(Zone::Near));
        quiesce().await;
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_events_round_trip_through_json() {
        let event = TagEvent::TriggerFired {
            beacon: beacon(),
            at: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"trigger_fired\""));
        let parsed: TagEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
