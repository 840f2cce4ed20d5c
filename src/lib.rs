//! adbridge Library
//!
//! A client for the Android Debug Bridge host protocol: device discovery
//! and tracking, remote shell, file sync, port forwarding and package
//! install against a running adb daemon.
//!
//! ```no_run
//! use adbridge::engine::{load_default_settings, Bridge};
//!
//! # async fn demo() -> adbridge::core::Result<()> {
//! let bridge = Bridge::start(load_default_settings())?;
//! for device in bridge.devices() {
//!     println!("{} {}", device.serial(), device.state());
//! }
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Module re-exports
pub use adbridge_client as client;
pub use adbridge_core as core;
pub use adbridge_engine as engine;

// Re-export main entry points
pub use adbridge_core::{DeviceEvent, DeviceSnapshot, DeviceState, Error, Result};
pub use adbridge_engine::{Bridge, Device, DeviceChangeListener, Settings};
