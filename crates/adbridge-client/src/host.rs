//! One-shot daemon and device commands

use adbridge_core::prelude::*;

use crate::protocol::parse_hex_length;
use crate::transport::{AdbConnection, AdbEndpoint};

/// Protocol version the running daemon reports for `host:version`.
pub async fn query_version(endpoint: &AdbEndpoint) -> Result<u32> {
    let mut conn = AdbConnection::open(endpoint).await?;
    conn.send_request("host:version").await?;
    let payload = conn.read_frame().await?;
    conn.close().await;
    let version = parse_hex_length(&payload)?;
    Ok(version as u32)
}

/// Reboot `serial`, optionally into `bootloader` or `recovery`.
pub async fn reboot(endpoint: &AdbEndpoint, serial: &str, into: Option<&str>) -> Result<()> {
    let mut conn = AdbConnection::open(endpoint).await?;
    conn.select_device(serial).await?;
    conn.send_request(&format!("reboot:{}", into.unwrap_or(""))).await?;
    info!(
        "Rebooting {}{}",
        serial,
        into.map(|target| format!(" into {target}")).unwrap_or_default()
    );
    conn.close().await;
    Ok(())
}
