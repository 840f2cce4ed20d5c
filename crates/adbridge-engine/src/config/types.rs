//! Configuration types

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use adbridge_client::AdbEndpoint;
use adbridge_core::prelude::*;
use serde::{Deserialize, Serialize};

/// Bridge settings (`config.toml`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl Settings {
    /// Daemon endpoint with the configured connect and I/O timeouts.
    pub fn endpoint(&self) -> Result<AdbEndpoint> {
        let ip: IpAddr = if self.daemon.host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.daemon.host.parse().map_err(|e| {
                Error::config(format!("Invalid daemon host '{}': {}", self.daemon.host, e))
            })?
        };
        Ok(AdbEndpoint::new(SocketAddr::new(ip, self.daemon.port))
            .with_connect_timeout(Duration::from_millis(self.timeouts.connect_ms))
            .with_io_timeout(Duration::from_millis(self.timeouts.io_ms)))
    }

    pub fn shell_inactivity(&self) -> Duration {
        Duration::from_millis(self.timeouts.shell_inactivity_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.install_ms)
    }
}

/// Where the adb daemon listens
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DaemonSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Timeouts, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeoutSettings {
    /// Connecting to the daemon
    #[serde(default = "default_timeout_ms")]
    pub connect_ms: u64,

    /// Any single read or write on a daemon connection
    #[serde(default = "default_timeout_ms")]
    pub io_ms: u64,

    /// Silence after which a shell command is considered unresponsive (0 = wait forever)
    #[serde(default = "default_timeout_ms")]
    pub shell_inactivity_ms: u64,

    /// Silence allowed from `pm install`
    #[serde(default = "default_install_ms")]
    pub install_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: default_timeout_ms(),
            io_ms: default_timeout_ms(),
            shell_inactivity_ms: default_timeout_ms(),
            install_ms: default_install_ms(),
        }
    }
}

/// Device monitor behavior
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitorSettings {
    /// Track debuggable processes on online devices
    #[serde(default = "default_true")]
    pub track_clients: bool,

    /// Read properties and mount points when a device comes online
    #[serde(default = "default_true")]
    pub query_device_info: bool,

    /// Ask emulator consoles for their AVD name
    #[serde(default = "default_true")]
    pub query_avd_name: bool,

    /// Require a JDWP handshake before reporting a process as a client
    #[serde(default = "default_true")]
    pub jdwp_handshake: bool,

    /// First local port handed out to debuggable clients
    #[serde(default = "default_debug_port_base")]
    pub debug_port_base: u16,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Give up reconnecting after this many consecutive failures (unset = never)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            track_clients: true,
            query_device_info: true,
            query_avd_name: true,
            jdwp_handshake: true,
            debug_port_base: default_debug_port_base(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_reconnect_attempts: None,
        }
    }
}

impl MonitorSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    adbridge_client::DEFAULT_ADB_PORT
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_install_ms() -> u64 {
    120_000
}

fn default_debug_port_base() -> u16 {
    8600
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}
