//! # adbridge-client - adb Host Protocol Client
//!
//! Speaks the wire protocol of the adb host daemon over loopback TCP:
//! request encoding, single-use connections, remote shell execution, file
//! sync, port forwarding and the long-lived tracking streams.
//!
//! Depends on [`adbridge_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Wire Codec
//! - [`encode_request()`] - Hex length-prefixed service request
//! - [`read_status()`], [`read_length_prefixed()`] - Reply decoding
//! - [`parse_device_list()`], [`parse_pid_list()`] - Tracking payload parsing
//!
//! ### Transport
//! - [`AdbEndpoint`] - Daemon address plus connect/I/O timeouts
//! - [`AdbConnection`] - One socket for one logical operation
//!
//! ### Services
//! - [`execute_remote_command()`] - Run a shell command, streaming lines to a [`ShellOutputReceiver`]
//! - [`SyncSession`] - Push, pull, stat and list remote files
//! - [`create_forward()`], [`remove_forward()`], [`list_forwards()`] - Port forwarding
//! - [`DeviceListStream`], [`JdwpPidStream`] - Device and debuggable-process tracking
//! - [`query_properties()`], [`query_mount_point()`] - Device information
//! - [`query_avd_name()`] - Emulator AVD name via the emulator console
//! - [`jdwp::handshake()`] - JDWP handshake identification
//! - [`InstrumentationResultParser`] - Reports `am instrument -r` output to a [`TestRunListener`]

pub mod emulator_console;
pub mod forward;
pub mod host;
pub mod instrumentation;
pub mod jdwp;
pub mod properties;
pub mod protocol;
pub mod shell;
pub mod sync;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod track;
pub mod transport;

// Public API re-exports
pub use emulator_console::query_avd_name;
pub use forward::{create_forward, create_forward_spec, list_forwards, remove_forward};
pub use host::{query_version, reboot};
pub use instrumentation::{
    InstrumentationResultParser, TestFailure, TestIdentifier, TestRunListener,
};
pub use properties::{query_mount_point, query_properties, GetPropReceiver};
pub use protocol::{
    encode_request, parse_device_list, parse_forward_list, parse_pid_list, read_length_prefixed,
    read_status, AdbStatus, DeviceListEntry,
};
pub use shell::{
    execute_remote_command, CollectingReceiver, LineSplitter, NullReceiver, ShellOutputReceiver,
};
pub use sync::{FileEntry, NullSyncProgress, SyncProgress, SyncResult, SyncSession};
pub use track::{DeviceListStream, JdwpPidStream};
pub use transport::{AdbConnection, AdbEndpoint, DEFAULT_ADB_PORT, DEFAULT_TIMEOUT};
