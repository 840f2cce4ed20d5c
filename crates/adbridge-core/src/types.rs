//! Domain types shared by every adbridge crate

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Serial prefix the daemon gives to emulator instances, followed by the console port.
static EMULATOR_SERIAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^emulator-(\d+)$").expect("emulator serial regex is valid"));

// ─────────────────────────────────────────────────────────────────
// Property and mount-point names
// ─────────────────────────────────────────────────────────────────

pub const PROP_BUILD_VERSION: &str = "ro.build.version.release";
pub const PROP_BUILD_API_LEVEL: &str = "ro.build.version.sdk";
pub const PROP_BUILD_CODENAME: &str = "ro.build.version.codename";
pub const PROP_DEVICE_MODEL: &str = "ro.product.model";
pub const PROP_DEVICE_MANUFACTURER: &str = "ro.product.manufacturer";
pub const PROP_DEBUGGABLE: &str = "ro.debuggable";

pub const MNT_EXTERNAL_STORAGE: &str = "EXTERNAL_STORAGE";
pub const MNT_ROOT: &str = "ANDROID_ROOT";
pub const MNT_DATA: &str = "ANDROID_DATA";

/// Mount-point environment variables queried on every device that comes online.
pub const MOUNT_POINT_NAMES: [&str; 3] = [MNT_DATA, MNT_EXTERNAL_STORAGE, MNT_ROOT];

// ─────────────────────────────────────────────────────────────────
// Device state
// ─────────────────────────────────────────────────────────────────

/// Connection state of a device as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Attached but not answering (also covers `unauthorized` and friends).
    Offline,
    /// Sitting in the bootloader.
    Bootloader,
    /// Fully usable; reported by the daemon as `device`.
    Online,
    /// Gone from the daemon's list. Only ever seen on final snapshots.
    Disconnected,
}

impl DeviceState {
    /// Map a state token from the daemon's device list.
    ///
    /// Tokens that do not correspond to a usable or bootloader device
    /// (`unauthorized`, `recovery`, `no permissions`, ...) count as offline.
    pub fn from_adb_token(token: &str) -> Self {
        match token {
            "device" => DeviceState::Online,
            "bootloader" => DeviceState::Bootloader,
            "offline" => DeviceState::Offline,
            other => {
                tracing::debug!("Treating device state '{}' as offline", other);
                DeviceState::Offline
            }
        }
    }

    /// Token the daemon uses for this state.
    pub fn as_adb_token(&self) -> &'static str {
        match self {
            DeviceState::Online => "device",
            DeviceState::Offline => "offline",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Online => write!(f, "online"),
            other => write!(f, "{}", other.as_adb_token()),
        }
    }
}

/// Returns the emulator console port encoded in an `emulator-<port>` serial.
pub fn emulator_console_port(serial: &str) -> Option<u16> {
    EMULATOR_SERIAL_REGEX
        .captures(serial)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

// ─────────────────────────────────────────────────────────────────
// Clients and devices
// ─────────────────────────────────────────────────────────────────

/// A debuggable process running on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub pid: u32,
    /// Serial of the owning device.
    pub device_serial: String,
    /// Process name from `/proc/<pid>/cmdline`, once known.
    pub description: Option<String>,
    /// Local port a debugger can attach to.
    pub debugger_port: Option<u16>,
}

impl ClientInfo {
    pub fn new(device_serial: impl Into<String>, pid: u32) -> Self {
        Self {
            pid,
            device_serial: device_serial.into(),
            description: None,
            debugger_port: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_debugger_port(mut self, port: u16) -> Self {
        self.debugger_port = Some(port);
        self
    }
}

/// Point-in-time copy of everything the registry knows about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub serial: String,
    pub state: DeviceState,
    pub properties: BTreeMap<String, String>,
    pub mount_points: BTreeMap<String, String>,
    pub clients: Vec<ClientInfo>,
    /// AVD name, for emulators whose console answered.
    pub avd_name: Option<String>,
}

impl DeviceSnapshot {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            properties: BTreeMap::new(),
            mount_points: BTreeMap::new(),
            clients: Vec::new(),
            avd_name: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    pub fn is_emulator(&self) -> bool {
        EMULATOR_SERIAL_REGEX.is_match(&self.serial)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn mount_point(&self, name: &str) -> Option<&str> {
        self.mount_points.get(name).map(String::as_str)
    }

    /// Human-readable name: AVD name for emulators, otherwise manufacturer and model.
    pub fn display_name(&self) -> String {
        if let Some(avd) = &self.avd_name {
            return avd.clone();
        }
        match (
            self.property(PROP_DEVICE_MANUFACTURER),
            self.property(PROP_DEVICE_MODEL),
        ) {
            (Some(maker), Some(model)) => format!("{maker} {model}"),
            (None, Some(model)) => model.to_string(),
            _ => self.serial.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// What changed on a device that stayed connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceChange {
    State,
    ClientList,
    BuildInfo,
}

/// Registry change notification delivered to listeners and subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected(DeviceSnapshot),
    Changed {
        device: DeviceSnapshot,
        change: DeviceChange,
    },
    /// Final snapshot; its state is always [`DeviceState::Disconnected`].
    Disconnected(DeviceSnapshot),
}

impl DeviceEvent {
    /// The snapshot carried by this event.
    pub fn device(&self) -> &DeviceSnapshot {
        match self {
            DeviceEvent::Connected(device)
            | DeviceEvent::Changed { device, .. }
            | DeviceEvent::Disconnected(device) => device,
        }
    }

    pub fn serial(&self) -> &str {
        &self.device().serial
    }
}

// ─────────────────────────────────────────────────────────────────
// Port forwarding
// ─────────────────────────────────────────────────────────────────

/// One entry of the daemon's forward table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub serial: String,
    /// Local spec, e.g. `tcp:8600`.
    pub local: String,
    /// Remote spec, e.g. `tcp:5005` or `jdwp:1234`.
    pub remote: String,
}

// ─────────────────────────────────────────────────────────────────
// Sync results
// ─────────────────────────────────────────────────────────────────

/// Outcome category of a sync transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncResultCode {
    Ok,
    /// The daemon answered `FAIL`.
    RemoteError,
    /// The daemon sent something outside the sync framing.
    ProtocolError,
    NoLocalFile,
    LocalIsDirectory,
    NoRemoteObject,
    RemotePathLength,
    /// A `DATA` chunk exceeded the maximum chunk size.
    BufferOverrun,
    FileReadError,
    FileWriteError,
    Timeout,
    TransferError,
}

impl fmt::Display for SyncResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SyncResultCode::Ok => "ok",
            SyncResultCode::RemoteError => "remote error",
            SyncResultCode::ProtocolError => "protocol error",
            SyncResultCode::NoLocalFile => "local file not found",
            SyncResultCode::LocalIsDirectory => "local path is a directory",
            SyncResultCode::NoRemoteObject => "remote object not found",
            SyncResultCode::RemotePathLength => "remote path too long",
            SyncResultCode::BufferOverrun => "buffer overrun",
            SyncResultCode::FileReadError => "local read error",
            SyncResultCode::FileWriteError => "local write error",
            SyncResultCode::Timeout => "timeout",
            SyncResultCode::TransferError => "transfer error",
        };
        f.write_str(text)
    }
}
