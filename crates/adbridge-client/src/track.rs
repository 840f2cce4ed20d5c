//! Long-lived tracking streams
//!
//! Both `host:track-devices` and `track-jdwp` keep the connection open and
//! push a full snapshot as a length-prefixed payload whenever something
//! changes. Reads on these streams have no deadline since they idle
//! legitimately.

use adbridge_core::prelude::*;

use crate::protocol::{parse_device_list, parse_pid_list, DeviceListEntry};
use crate::transport::{AdbConnection, AdbEndpoint};

/// Stream of device-list snapshots from `host:track-devices`.
#[derive(Debug)]
pub struct DeviceListStream {
    conn: AdbConnection,
}

impl DeviceListStream {
    pub async fn open(endpoint: &AdbEndpoint) -> Result<Self> {
        let mut conn = AdbConnection::open(endpoint).await?;
        conn.send_request("host:track-devices").await?;
        info!("Tracking devices via adb daemon at {}", endpoint.addr);
        Ok(Self { conn })
    }

    /// Wait for the next full snapshot.
    pub async fn next_snapshot(&mut self) -> Result<Vec<DeviceListEntry>> {
        let payload = self.conn.read_frame_unbounded().await?;
        Ok(parse_device_list(&String::from_utf8_lossy(&payload)))
    }

    pub async fn close(self) {
        self.conn.close().await;
    }
}

/// Stream of debuggable pid snapshots from `track-jdwp` on one device.
#[derive(Debug)]
pub struct JdwpPidStream {
    conn: AdbConnection,
    serial: String,
}

impl JdwpPidStream {
    pub async fn open(endpoint: &AdbEndpoint, serial: &str) -> Result<Self> {
        let mut conn = AdbConnection::open(endpoint).await?;
        conn.select_device(serial).await?;
        conn.send_request("track-jdwp").await?;
        debug!("Tracking debuggable processes on {}", serial);
        Ok(Self {
            conn,
            serial: serial.to_string(),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Wait for the next full pid snapshot.
    pub async fn next_snapshot(&mut self) -> Result<Vec<u32>> {
        let payload = self.conn.read_frame_unbounded().await?;
        Ok(parse_pid_list(&String::from_utf8_lossy(&payload)))
    }

    pub async fn close(self) {
        self.conn.close().await;
    }
}
