//! Configuration push protocol for one tag in configuration mode.
//!
//! A [`TagUpdater`] drives a [`ConnectionController`] through the
//! convergence checklist: once services are discovered it sweeps the command
//! batch, reads each targeted attribute, writes it only when the value on
//! the device differs from the desired one, and marks it settled on write
//! completion regardless of reported status (writes are not retried). When
//! every checklist entry is settled the updater force-closes the connection
//! and emits a single [`TagEvent::TagUpdated`].
//!
//! Reads that fail leave their attribute unsettled; the controller
//! reconnects and the next ready sweep picks up only what is still open.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::beacon::BeaconId;
use crate::config::MonitorConfig;
use crate::controller::{ConnectionController, ControllerEvent, GattOperation, OperationOutcome};
use crate::gatt::{CharacteristicId, GattLink, LinkEvent};
use crate::monitor::TagEvent;
use crate::settings::{WAKE_UP_SERVICE, WriteCommand};

#[derive(Debug)]
enum UpdaterCommand {
    Abort,
}

/// Control handle for a running [`TagUpdater`].
///
/// Dropping the handle has the same effect as [`abort`](Self::abort).
#[derive(Debug)]
pub struct UpdaterHandle {
    control: mpsc::UnboundedSender<UpdaterCommand>,
}

impl UpdaterHandle {
    /// Stop the update: the connection is force-closed and no completion
    /// event is emitted.
    pub fn abort(&self) {
        let _ = self.control.send(UpdaterCommand::Abort);
    }
}

/// Task converging one command batch onto one tag.
pub struct TagUpdater<L: GattLink> {
    beacon: BeaconId,
    address: String,
    controller: ConnectionController<L>,
    commands: Vec<WriteCommand>,
    checklist: HashMap<Uuid, bool>,
    allow_skip: bool,
    connect_delay: time::Duration,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    control: mpsc::UnboundedReceiver<UpdaterCommand>,
    events: mpsc::UnboundedSender<TagEvent>,
    complete: bool,
}

impl<L: GattLink> TagUpdater<L> {
    /// Build an updater for the tag at `address`, pushing `commands`.
    ///
    /// `link_events` must be the receiving half of the channel the link was
    /// opened with. Completion and nothing else is reported on `events`.
    #[must_use]
    pub fn new(
        beacon: BeaconId,
        address: String,
        commands: Vec<WriteCommand>,
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: &MonitorConfig,
        events: mpsc::UnboundedSender<TagEvent>,
    ) -> (Self, UpdaterHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let checklist = commands
            .iter()
            .map(|command| (command.characteristic, false))
            .collect();
        let updater = Self {
            beacon,
            address,
            controller: ConnectionController::new(link, config.reconnect_delay()),
            commands,
            checklist,
            allow_skip: config.skip_optional_service,
            connect_delay: config.connect_delay(),
            link_events,
            control: control_rx,
            events,
            complete: false,
        };
        (updater, UpdaterHandle { control: control_tx })
    }

    /// Run the update to completion, abort, or link shutdown.
    pub async fn run(mut self) {
        debug!(beacon = %self.beacon, address = %self.address, "starting tag update");
        time::sleep(self.connect_delay).await;
        self.controller.connect();

        loop {
            let reconnect_at = self.controller.reconnect_deadline();
            tokio::select! {
                event = self.link_events.recv() => {
                    let Some(event) = event else { break };
                    if self.handle_link_event(event) {
                        break;
                    }
                }
                command = self.control.recv() => {
                    match command {
                        Some(UpdaterCommand::Abort) | None => {
                            debug!(beacon = %self.beacon, address = %self.address, "tag update aborted");
                            self.controller.force_close();
                            break;
                        }
                    }
                }
                () = time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.controller.reconnect_due();
                }
            }
        }
    }

    /// Digest one link event; returns whether the updater is finished.
    fn handle_link_event(&mut self, event: LinkEvent) -> bool {
        let Some(event) = self.controller.on_link_event(event) else {
            return false;
        };
        match event {
            ControllerEvent::Ready => self.sweep(),
            ControllerEvent::Operation(OperationOutcome::CharacteristicRead {
                id, value, ..
            }) => self.handle_read(id, value),
            ControllerEvent::Operation(OperationOutcome::CharacteristicWritten { id, .. }) => {
                // Settled regardless of status: a rejected write is treated
                // as done rather than retried.
                self.settle(id.characteristic)
            }
            ControllerEvent::Operation(_) | ControllerEvent::Notification { .. } => false,
        }
    }

    /// Walk the command batch against the discovered topology, settling
    /// what cannot or need not converge and enqueueing reads for the rest.
    /// Returns whether the updater is finished (all settled, or aborted
    /// because a required service is missing).
    fn sweep(&mut self) -> bool {
        let Some(topology) = self.controller.services().cloned() else {
            return false;
        };
        let commands = self.commands.clone();
        for command in &commands {
            if self.is_settled(command.characteristic) {
                continue;
            }
            if !topology.has_service(command.service) {
                if command.service == WAKE_UP_SERVICE && self.allow_skip {
                    debug!(
                        address = %self.address,
                        characteristic = %command.characteristic,
                        "optional service absent, skipping attribute"
                    );
                    if self.settle(command.characteristic) {
                        return true;
                    }
                    continue;
                }
                warn!(
                    address = %self.address,
                    service = %command.service,
                    "required service absent, aborting tag update"
                );
                self.controller.close();
                return true;
            }
            if !topology.has_characteristic(command.service, command.characteristic) {
                debug!(
                    address = %self.address,
                    characteristic = %command.characteristic,
                    "attribute absent, nothing to converge"
                );
                if self.settle(command.characteristic) {
                    return true;
                }
                continue;
            }
            self.controller.enqueue(GattOperation::ReadCharacteristic {
                id: command.characteristic_id(),
            });
        }
        false
    }

    /// Compare a read-back value with the command's desired one and write
    /// only on mismatch. Returns whether the updater is finished.
    fn handle_read(&mut self, id: CharacteristicId, value: Option<Vec<u8>>) -> bool {
        let Some(value) = value else {
            // No payload came back; the attribute stays unsettled and the
            // next ready sweep reads it again.
            warn!(characteristic = %id.characteristic, "read returned no value");
            return false;
        };
        let desired = match self
            .commands
            .iter()
            .find(|command| command.characteristic_id() == id)
        {
            Some(command) => command.desired_value(&value),
            None => {
                debug!(characteristic = %id.characteristic, "read completion for an untracked attribute");
                return false;
            }
        };
        if desired == value {
            self.settle(id.characteristic)
        } else {
            self.controller.enqueue(GattOperation::WriteCharacteristic {
                id,
                value: desired,
            });
            false
        }
    }

    /// Mark an attribute settled and fire completion when the checklist is
    /// full. Returns whether completion fired.
    fn settle(&mut self, characteristic: Uuid) -> bool {
        if let Some(flag) = self.checklist.get_mut(&characteristic) {
            *flag = true;
        }
        self.check_complete()
    }

    fn check_complete(&mut self) -> bool {
        if self.complete || !self.checklist.values().all(|settled| *settled) {
            return false;
        }
        self.complete = true;
        info!(beacon = %self.beacon, address = %self.address, "tag update complete");
        self.controller.force_close();
        let _ = self.events.send(TagEvent::TagUpdated {
            beacon: self.beacon,
            at: Utc::now(),
        });
        true
    }

    fn is_settled(&self, characteristic: Uuid) -> bool {
        self.checklist.get(&characteristic).copied().unwrap_or(false)
    }
}
