//! Unified error types for the cairn core library.
//!
//! The detection and update pipeline itself never surfaces errors to the
//! caller: transient link failures are recovered via reconnect, and the only
//! observable outcome of an update is the presence or absence of its
//! completion event. [`CairnError`] covers everything outside that pipeline:
//! configuration files, adapter setup, and link establishment.
//!
//! # Example
//!
//! ```rust
//! use cairn_core::error::{CairnError, Result};
//!
//! fn require_adapter(powered: bool) -> Result<()> {
//!     if !powered {
//!         return Err(CairnError::AdapterUnavailable(
//!             "adapter is powered off".into(),
//!         ));
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_adapter(false).unwrap_err().is_bluetooth_error());
//! ```

use thiserror::Error;

/// The unified error type for all cairn operations.
#[derive(Debug, Error)]
pub enum CairnError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No usable Bluetooth adapter was found, or it could not be powered on.
    #[error("Bluetooth adapter unavailable: {0}. Ensure BlueZ is running and the adapter is powered.")]
    AdapterUnavailable(String),

    /// Starting or maintaining device discovery failed.
    #[error("Bluetooth discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A GATT link to a specific device could not be set up.
    #[error("Failed to open link to '{address}': {message}")]
    LinkSetupFailed {
        /// Device address the link was opened for.
        address: String,
        /// Underlying failure description.
        message: String,
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The platform configuration directory could not be determined.
    #[error("Cannot determine configuration directory for this platform")]
    ConfigDirUnavailable,

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// The configuration could not be serialized for writing.
    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(String),

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for cairn operations.
pub type Result<T> = std::result::Result<T, CairnError>;

impl CairnError {
    /// Returns `true` if this error is related to Bluetooth operations.
    #[inline]
    #[must_use]
    pub const fn is_bluetooth_error(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable(_) | Self::DiscoveryFailed(_) | Self::LinkSetupFailed { .. }
        )
    }

    /// Returns `true` if this error is related to configuration handling.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigDirUnavailable | Self::ConfigParse(_) | Self::ConfigSerialize(_)
        )
    }

    /// Returns `true` if this error is likely transient and worth retrying.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::DiscoveryFailed(_) | Self::LinkSetupFailed { .. })
    }
}

// =============================================================================
// TESTS
// =============================================================================
