//! JDWP handshake identification of debuggable processes
//!
//! Only the handshake is spoken: the client sends `JDWP-Handshake` over the
//! `jdwp:<pid>` service and a live VM echoes it back. Nothing past that is
//! parsed.

use std::time::Duration;

use adbridge_core::prelude::*;

use crate::shell::{execute_remote_command, CollectingReceiver};
use crate::transport::{AdbConnection, AdbEndpoint};

pub const JDWP_HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

/// Check that `pid` on `serial` answers the JDWP handshake.
pub async fn handshake(endpoint: &AdbEndpoint, serial: &str, pid: u32) -> Result<bool> {
    let mut conn = AdbConnection::open(endpoint).await?;
    conn.select_device(serial).await?;
    conn.send_request(&format!("jdwp:{pid}")).await?;

    let limit = conn.io_timeout();
    conn.send(JDWP_HANDSHAKE, limit).await?;
    let reply = conn.read_exact(JDWP_HANDSHAKE.len(), limit).await?;
    conn.close().await;

    let ok = reply.as_slice() == JDWP_HANDSHAKE;
    if !ok {
        debug!(
            "pid {} on {} answered the JDWP handshake with {:?}",
            pid,
            serial,
            String::from_utf8_lossy(&reply)
        );
    }
    Ok(ok)
}

/// Process name from `/proc/<pid>/cmdline`, if it has one.
pub async fn process_description(
    endpoint: &AdbEndpoint,
    serial: &str,
    pid: u32,
    max_inactivity: Duration,
) -> Result<Option<String>> {
    let mut receiver = CollectingReceiver::new();
    execute_remote_command(
        endpoint,
        serial,
        &format!("cat /proc/{pid}/cmdline"),
        &mut receiver,
        max_inactivity,
    )
    .await?;
    Ok(parse_cmdline(&receiver.output()))
}

/// First NUL-separated argument of a cmdline, trimmed.
pub fn parse_cmdline(raw: &str) -> Option<String> {
    raw.split('\0')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "<pre-initialized>")
        .map(str::to_string)
}
