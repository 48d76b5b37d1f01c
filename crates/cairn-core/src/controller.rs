//! Per-peripheral operation queue and connection state machine.
//!
//! A [`ConnectionController`] owns exactly one [`GattLink`] and serializes
//! every attribute operation against it: at most one operation is ever
//! outstanding, the rest wait in a FIFO queue. Link failures tear the
//! connection down and arm a single fixed-delay reconnect; the pending queue
//! does not survive the boundary, so owners re-enqueue what they still need
//! once the controller reports ready again.
//!
//! The controller performs no I/O of its own and never sleeps. Timing is
//! pushed out to the owning task: [`reconnect_deadline`] exposes when the
//! next attempt is due and the owner calls [`reconnect_due`] once it has
//! waited that long.
//!
//! [`reconnect_deadline`]: ConnectionController::reconnect_deadline
//! [`reconnect_due`]: ConnectionController::reconnect_due

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::gatt::{
    CharacteristicId, CLIENT_CHARACTERISTIC_CONFIGURATION, DescriptorId, GattLink, GattStatus,
    LinkEvent, NOTIFICATION_ENABLE, ServiceTopology,
};

/// One queued attribute operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOperation {
    /// Read a characteristic value.
    ReadCharacteristic {
        /// Target characteristic.
        id: CharacteristicId,
    },
    /// Write a characteristic value.
    WriteCharacteristic {
        /// Target characteristic.
        id: CharacteristicId,
        /// Bytes to write.
        value: Vec<u8>,
    },
    /// Read a descriptor value.
    ReadDescriptor {
        /// Target descriptor.
        id: DescriptorId,
    },
    /// Write a descriptor value.
    WriteDescriptor {
        /// Target descriptor.
        id: DescriptorId,
        /// Bytes to write.
        value: Vec<u8>,
    },
    /// Subscribe to notifications for a characteristic.
    ///
    /// Not dispatched directly: processing enables local delivery and
    /// appends the client-configuration descriptor write to the back of the
    /// queue. Absent that descriptor, the subscription is satisfied as-is.
    SubscribeNotifications {
        /// Target characteristic.
        id: CharacteristicId,
    },
}

/// Connection lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No physical connection.
    Disconnected,
    /// Connection requested, link not yet up.
    Connecting,
    /// Physical link up, discovery not yet requested.
    LinkUp,
    /// Waiting for service discovery to finish.
    ServiceDiscovery,
    /// Services known; operations are dispatched.
    Ready,
    /// Teardown in progress.
    Closing,
}

/// Completion of one dispatched operation, with the peripheral's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// A characteristic read finished; `value` may be absent on failure.
    CharacteristicRead {
        /// The characteristic that was read.
        id: CharacteristicId,
        /// Peripheral-reported status.
        status: GattStatus,
        /// Returned value, if any.
        value: Option<Vec<u8>>,
    },
    /// A characteristic write finished.
    CharacteristicWritten {
        /// The characteristic that was written.
        id: CharacteristicId,
        /// Peripheral-reported status.
        status: GattStatus,
    },
    /// A descriptor read finished; `value` may be absent on failure.
    DescriptorRead {
        /// The descriptor that was read.
        id: DescriptorId,
        /// Peripheral-reported status.
        status: GattStatus,
        /// Returned value, if any.
        value: Option<Vec<u8>>,
    },
    /// A descriptor write finished.
    DescriptorWritten {
        /// The descriptor that was written.
        id: DescriptorId,
        /// Peripheral-reported status.
        status: GattStatus,
    },
}

/// What a link event meant for this controller, surfaced to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Service discovery succeeded; queued operations are moving.
    Ready,
    /// A dispatched operation completed.
    Operation(OperationOutcome),
    /// The peripheral pushed a notification.
    Notification {
        /// Notifying characteristic.
        id: CharacteristicId,
        /// Notified value.
        value: Vec<u8>,
    },
}

/// Serializes attribute operations over one peripheral connection and
/// recovers from link failures.
#[derive(Debug)]
pub struct ConnectionController<L: GattLink> {
    link: L,
    state: LinkState,
    queue: VecDeque<GattOperation>,
    in_flight: Option<GattOperation>,
    force_closed: bool,
    reconnect_at: Option<Instant>,
    reconnect_delay: Duration,
    services: Option<ServiceTopology>,
}

impl<L: GattLink> ConnectionController<L> {
    /// Build a controller over `link`. Reconnect attempts are armed
    /// `reconnect_delay` after each failure, with no backoff and no cap.
    pub fn new(link: L, reconnect_delay: Duration) -> Self {
        Self {
            link,
            state: LinkState::Disconnected,
            queue: VecDeque::new(),
            in_flight: None,
            force_closed: false,
            reconnect_at: None,
            reconnect_delay,
            services: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Whether queued operations are currently being dispatched.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.state, LinkState::Ready)
    }

    /// Attribute layout from the last successful discovery, if the link is
    /// still up.
    #[must_use]
    pub const fn services(&self) -> Option<&ServiceTopology> {
        self.services.as_ref()
    }

    /// When the armed reconnect attempt is due, if one is armed.
    #[must_use]
    pub const fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Open the connection. Ignored unless the controller is disconnected
    /// and has not been force-closed.
    pub fn connect(&mut self) {
        if self.state != LinkState::Disconnected || self.force_closed {
            return;
        }
        debug!("connecting");
        self.state = LinkState::Connecting;
        self.link.connect();
    }

    /// Tear the connection down: drop every queued operation and the
    /// in-flight slot, cancel any armed reconnect, release the link.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.state != LinkState::Disconnected {
            debug!("closing link");
            self.state = LinkState::Closing;
            self.link.close();
        }
        self.queue.clear();
        self.in_flight = None;
        self.reconnect_at = None;
        self.services = None;
        self.state = LinkState::Disconnected;
    }

    /// Close and additionally suppress every future automatic reconnect and
    /// explicit [`connect`](Self::connect) for this controller. Idempotent.
    pub fn force_close(&mut self) {
        self.force_closed = true;
        self.close();
    }

    /// Append an operation; dispatch immediately when the controller is
    /// ready and idle.
    pub fn enqueue(&mut self, op: GattOperation) {
        self.queue.push_back(op);
        if self.state == LinkState::Ready && self.in_flight.is_none() {
            self.pump();
        }
    }

    /// Re-attempt the connection; called by the owner once the deadline
    /// from [`reconnect_deadline`](Self::reconnect_deadline) has passed.
    pub fn reconnect_due(&mut self) {
        self.reconnect_at = None;
        self.connect();
    }

    /// Digest one link event, returning whatever the owner needs to react
    /// to. Stray events (completions with nothing matching in flight,
    /// transitions from the wrong state) are logged and dropped.
    pub fn on_link_event(&mut self, event: LinkEvent) -> Option<ControllerEvent> {
        match event {
            LinkEvent::Connected => {
                if self.state != LinkState::Connecting {
                    warn!(state = ?self.state, "unexpected link-up");
                    return None;
                }
                self.state = LinkState::LinkUp;
                debug!("link up, discovering services");
                self.link.discover_services();
                self.state = LinkState::ServiceDiscovery;
                None
            }
            LinkEvent::Disconnected => {
                if self.state != LinkState::Disconnected {
                    debug!("link lost");
                    self.reconnect();
                }
                None
            }
            LinkEvent::ServicesDiscovered { status, services } => {
                if self.state != LinkState::ServiceDiscovery {
                    warn!(state = ?self.state, "unexpected discovery result");
                    return None;
                }
                if !status.is_success() {
                    debug!(?status, "service discovery failed");
                    self.reconnect();
                    return None;
                }
                self.services = Some(services);
                self.state = LinkState::Ready;
                self.pump();
                Some(ControllerEvent::Ready)
            }
            LinkEvent::CharacteristicRead { id, status, value } => {
                let matched = self.clear_in_flight(|op| {
                    matches!(op, GattOperation::ReadCharacteristic { id: expected } if *expected == id)
                });
                if !matched {
                    warn!(characteristic = %id.characteristic, "stray characteristic read completion");
                    return None;
                }
                if status.is_success() {
                    self.pump();
                } else {
                    self.reconnect();
                }
                Some(ControllerEvent::Operation(OperationOutcome::CharacteristicRead {
                    id,
                    status,
                    value,
                }))
            }
            LinkEvent::CharacteristicWritten { id, status } => {
                let matched = self.clear_in_flight(|op| {
                    matches!(op, GattOperation::WriteCharacteristic { id: expected, .. } if *expected == id)
                });
                if !matched {
                    warn!(characteristic = %id.characteristic, "stray characteristic write completion");
                    return None;
                }
                // Failed writes do not reconnect; the owner decides what a
                // rejected write means.
                self.pump();
                Some(ControllerEvent::Operation(OperationOutcome::CharacteristicWritten {
                    id,
                    status,
                }))
            }
            LinkEvent::DescriptorRead { id, status, value } => {
                let matched = self.clear_in_flight(|op| {
                    matches!(op, GattOperation::ReadDescriptor { id: expected } if *expected == id)
                });
                if !matched {
                    warn!(descriptor = %id.descriptor, "stray descriptor read completion");
                    return None;
                }
                if status.is_success() {
                    self.pump();
                } else {
                    self.reconnect();
                }
                Some(ControllerEvent::Operation(OperationOutcome::DescriptorRead {
                    id,
                    status,
                    value,
                }))
            }
            LinkEvent::DescriptorWritten { id, status } => {
                let matched = self.clear_in_flight(|op| {
                    matches!(op, GattOperation::WriteDescriptor { id: expected, .. } if *expected == id)
                });
                if !matched {
                    warn!(descriptor = %id.descriptor, "stray descriptor write completion");
                    return None;
                }
                self.pump();
                Some(ControllerEvent::Operation(OperationOutcome::DescriptorWritten {
                    id,
                    status,
                }))
            }
            LinkEvent::Notification { id, value } => {
                Some(ControllerEvent::Notification { id, value })
            }
        }
    }

    /// Close, then arm a reconnect attempt after the fixed delay unless
    /// force-closed.
    fn reconnect(&mut self) {
        self.close();
        if !self.force_closed {
            self.reconnect_at = Some(Instant::now() + self.reconnect_delay);
        }
    }

    fn clear_in_flight(&mut self, matches: impl FnOnce(&GattOperation) -> bool) -> bool {
        if self.in_flight.as_ref().is_some_and(matches) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Dispatch queued operations until one occupies the in-flight slot or
    /// the queue drains. Subscriptions never occupy the slot.
    fn pump(&mut self) {
        while self.in_flight.is_none() && self.state == LinkState::Ready {
            let Some(op) = self.queue.pop_front() else { break };
            match op {
                GattOperation::ReadCharacteristic { id } => {
                    self.link.read_characteristic(&id);
                    self.in_flight = Some(GattOperation::ReadCharacteristic { id });
                }
                GattOperation::WriteCharacteristic { id, value } => {
                    self.link.write_characteristic(&id, &value);
                    self.in_flight = Some(GattOperation::WriteCharacteristic { id, value });
                }
                GattOperation::ReadDescriptor { id } => {
                    self.link.read_descriptor(&id);
                    self.in_flight = Some(GattOperation::ReadDescriptor { id });
                }
                GattOperation::WriteDescriptor { id, value } => {
                    self.link.write_descriptor(&id, &value);
                    self.in_flight = Some(GattOperation::WriteDescriptor { id, value });
                }
                GattOperation::SubscribeNotifications { id } => self.subscribe(id),
            }
        }
    }

    fn subscribe(&mut self, id: CharacteristicId) {
        let has_cccd = self.services.as_ref().is_some_and(|topology| {
            topology.has_descriptor(
                id.service,
                id.characteristic,
                CLIENT_CHARACTERISTIC_CONFIGURATION,
            )
        });
        if !has_cccd {
            debug!(characteristic = %id.characteristic, "no client configuration descriptor, nothing to write");
            return;
        }
        self.link.set_notifications(&id, true);
        let descriptor = DescriptorId::new(
            id.service,
            id.characteristic,
            CLIENT_CHARACTERISTIC_CONFIGURATION,
        );
        self.queue.push_back(GattOperation::WriteDescriptor {
            id: descriptor,
            value: NOTIFICATION_ENABLE.to_vec(),
        });
    }
}
