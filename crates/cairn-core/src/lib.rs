//! # cairn-core
//!
//! Bluetooth Low Energy beacon monitoring and over-the-air tag
//! configuration.
//!
//! This crate provides:
//! - iBeacon advertisement parsing with distance and zone estimation
//! - Zone smoothing over a sliding window, with trigger policies on top
//! - A serialized GATT operation queue with automatic reconnects
//! - A read-compare-write convergence protocol for pushing tag settings
//! - A BlueZ transport backend (Linux, behind the `bluetooth` feature)
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`beacon`] - Beacon identity, advertisement parsing, proximity zones
//! - `bluez` - BlueZ adapter scanning and GATT links (feature `bluetooth`)
//! - [`config`] - Monitoring configuration loading and saving
//! - [`controller`] - Per-peripheral operation queue and reconnect logic
//! - [`error`] - Unified error types for the crate
//! - [`gatt`] - Link abstraction shared by the controller and the backends
//! - `mock` - Scripted in-memory links for tests (feature `mock-link`)
//! - [`monitor`] - Beacon registry, task lifecycle, and the event channel
//! - [`settings`] - Tag attribute map, validated settings, command codec
//! - [`smoothing`] - Zone commitment over a sliding sample window
//! - [`trigger`] - Trigger policies and per-beacon watcher tasks
//! - [`updater`] - Configuration push protocol for one tag

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod beacon;
#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod config;
pub mod controller;
pub mod error;
pub mod gatt;
#[cfg(any(test, feature = "mock-link"))]
pub mod mock;
pub mod monitor;
pub mod settings;
pub mod smoothing;
pub mod trigger;
pub mod updater;

// Re-export primary types for convenience
pub use beacon::{BeaconId, Detection, IBeaconFrame, Zone};
#[cfg(feature = "bluetooth")]
pub use bluez::{BeaconScanner, BluezLinkOpener};
pub use config::MonitorConfig;
pub use error::{CairnError, Result};
pub use gatt::{GattLink, LinkEvent, LinkOpener};
pub use monitor::{BeaconMonitor, TagEvent};
pub use settings::TagSettings;
pub use trigger::TriggerPolicy;
