//! # adbridge-core - Core Domain Types
//!
//! Foundation crate for adbridge. Provides the device/client domain types,
//! the shared error type, and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, regex, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`DeviceState`] - Daemon-reported device state (Offline, Bootloader, Online, Disconnected)
//! - [`DeviceSnapshot`] - Point-in-time copy of one device's registry record
//! - [`ClientInfo`] - A debuggable process on a device
//! - [`DeviceEvent`], [`DeviceChange`] - Registry change notifications
//! - [`ForwardRule`] - One entry of the daemon's forward table
//! - [`SyncResultCode`] - Outcome category of a file transfer
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `retryable` and `daemon rejection` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Logging (`logging`)
//! - [`logging::init()`] - Daily rolling file logger filtered by `ADBRIDGE_LOG`
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use adbridge_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod types;

/// Prelude for common imports used throughout all adbridge crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

pub use error::{Error, Result, ResultExt};
pub use types::{
    emulator_console_port, ClientInfo, DeviceChange, DeviceEvent, DeviceSnapshot, DeviceState,
    ForwardRule, SyncResultCode, MNT_DATA, MNT_EXTERNAL_STORAGE, MNT_ROOT, MOUNT_POINT_NAMES,
    PROP_BUILD_API_LEVEL, PROP_BUILD_CODENAME, PROP_BUILD_VERSION, PROP_DEBUGGABLE,
    PROP_DEVICE_MANUFACTURER, PROP_DEVICE_MODEL,
};
