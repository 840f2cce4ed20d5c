//! # adbridge-engine - Device Tracking and Orchestration
//!
//! Builds the device model on top of [`adbridge_client`]: a registry kept in
//! sync with the daemon by a background monitor, change notification for
//! listeners and async subscribers, device handles, package install and
//! instrumentation test runs.
//!
//! ## Public API
//!
//! - [`Bridge`] - Entry point; owns the registry, monitor and dispatcher
//! - [`Device`] - Handle for shell, sync, install, forwarding and reboot
//! - [`DeviceRegistry`] - Authoritative device and client records
//! - [`DeviceMonitor`], [`MonitorState`] - Background device tracking
//! - [`DeviceChangeListener`], [`ListenerId`] - Callback notification
//! - [`PackageTarget`], [`InstallReceiver`] - Install orchestration
//! - [`RemoteTestRunner`] - Instrumentation test runs
//! - [`Settings`], [`load_settings()`], [`save_settings()`] - Configuration

pub mod bridge;
pub mod config;
pub mod debug_ports;
pub mod device;
pub mod events;
pub mod install;
pub mod monitor;
pub mod registry;
pub mod testrunner;

pub use bridge::Bridge;
pub use config::{
    load_default_settings, load_settings, save_settings, DaemonSettings, MonitorSettings,
    Settings, TimeoutSettings,
};
pub use debug_ports::DebugPortAllocator;
pub use device::Device;
pub use events::{DeviceChangeListener, ListenerId};
pub use install::{InstallReceiver, LocalPackageTarget, PackageTarget};
pub use monitor::{DeviceMonitor, MonitorState};
pub use registry::DeviceRegistry;
pub use testrunner::{RemoteTestRunner, TestSize};
