//! adb host wire codec
//!
//! Every request to the daemon is a 4-digit hexadecimal byte length followed
//! by the service string. Every reply starts with a 4-byte status token,
//! `OKAY` or `FAIL`; a `FAIL` carries a length-prefixed message. Streaming
//! services (`host:track-devices`, `track-jdwp`, `host:list-forward`) send
//! length-prefixed text payloads after the status.

use adbridge_core::prelude::*;
use adbridge_core::{DeviceState, ForwardRule};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const OKAY: &[u8; 4] = b"OKAY";
pub const FAIL: &[u8; 4] = b"FAIL";

/// Largest service string a 4-digit hex prefix can describe.
pub const MAX_REQUEST_LEN: usize = 0xFFFF;

/// Status token read at the start of every daemon reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbStatus {
    Okay,
    Fail(String),
}

impl AdbStatus {
    pub fn is_okay(&self) -> bool {
        matches!(self, AdbStatus::Okay)
    }
}

/// One line of the daemon's device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListEntry {
    pub serial: String,
    pub state: DeviceState,
}

impl DeviceListEntry {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
        }
    }
}

/// Encode a service request: 4 uppercase hex digits of the byte length, then the bytes.
pub fn encode_request(service: &str) -> Result<Vec<u8>> {
    let bytes = service.as_bytes();
    if bytes.len() > MAX_REQUEST_LEN {
        return Err(Error::protocol(format!(
            "service request of {} bytes exceeds {} byte limit",
            bytes.len(),
            MAX_REQUEST_LEN
        )));
    }
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(format!("{:04X}", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Parse a 4-digit hexadecimal length prefix.
pub fn parse_hex_length(digits: &[u8]) -> Result<usize> {
    if digits.len() != 4 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::protocol(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    let text = std::str::from_utf8(digits).map_err(|e| Error::protocol(e.to_string()))?;
    usize::from_str_radix(text, 16).map_err(|e| Error::protocol(e.to_string()))
}

/// Read exactly `buf.len()` bytes, reporting a short stream as a protocol error.
pub(crate) async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::protocol(
            format!("stream ended after fewer than {} bytes", buf.len()),
        )),
        Err(err) => Err(err.into()),
    }
}

/// Read a hex length prefix followed by that many payload bytes.
pub async fn read_length_prefixed<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    read_fully(reader, &mut prefix).await?;
    let len = parse_hex_length(&prefix)?;
    let mut payload = vec![0u8; len];
    read_fully(reader, &mut payload).await?;
    Ok(payload)
}

/// Read the 4-byte status token and, on `FAIL`, its message.
pub async fn read_status<R>(reader: &mut R) -> Result<AdbStatus>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut token = [0u8; 4];
    read_fully(reader, &mut token).await?;
    match &token {
        OKAY => Ok(AdbStatus::Okay),
        FAIL => {
            let message = read_length_prefixed(reader).await?;
            Ok(AdbStatus::Fail(
                String::from_utf8_lossy(&message).into_owned(),
            ))
        }
        other => Err(Error::protocol(format!(
            "unexpected status token {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Parse a device-list payload of `serial\tstate` lines.
///
/// Blank lines are ignored and malformed lines are skipped.
pub fn parse_device_list(payload: &str) -> Vec<DeviceListEntry> {
    payload
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split('\t');
            match (parts.next(), parts.next()) {
                (Some(serial), Some(state)) if !serial.is_empty() => Some(DeviceListEntry::new(
                    serial,
                    DeviceState::from_adb_token(state.trim()),
                )),
                _ => {
                    debug!("Skipping malformed device list line: {:?}", line);
                    None
                }
            }
        })
        .collect()
}

/// Parse a `track-jdwp` payload: one pid per line.
pub fn parse_pid_list(payload: &str) -> Vec<u32> {
    payload
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                debug!("Skipping invalid pid {:?}", line);
                None
            }
        })
        .collect()
}

/// Parse a `host:list-forward` payload of `serial local remote` lines.
pub fn parse_forward_list(payload: &str) -> Vec<ForwardRule> {
    payload
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(serial), Some(local), Some(remote)) => Some(ForwardRule {
                    serial: serial.to_string(),
                    local: local.to_string(),
                    remote: remote.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}
