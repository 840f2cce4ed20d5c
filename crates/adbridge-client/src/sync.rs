//! File transfer over the daemon's `sync:` service
//!
//! After `host:transport:<serial>` and `sync:` the connection switches to a
//! binary framing: every packet starts with a 4-byte ASCII id followed by a
//! little-endian `u32` (a length, a mode, or a timestamp depending on the id).
//! File contents move in `DATA` chunks of at most [`SYNC_DATA_MAX`] bytes.

use std::path::Path;

use adbridge_core::prelude::*;
use adbridge_core::SyncResultCode;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::transport::{AdbConnection, AdbEndpoint};

const ID_SEND: &[u8; 4] = b"SEND";
const ID_RECV: &[u8; 4] = b"RECV";
const ID_STAT: &[u8; 4] = b"STAT";
const ID_LIST: &[u8; 4] = b"LIST";
const ID_DENT: &[u8; 4] = b"DENT";
const ID_DATA: &[u8; 4] = b"DATA";
const ID_DONE: &[u8; 4] = b"DONE";
const ID_OKAY: &[u8; 4] = b"OKAY";
const ID_FAIL: &[u8; 4] = b"FAIL";
const ID_QUIT: &[u8; 4] = b"QUIT";

/// Largest payload of a single `DATA` packet.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Longest remote path the daemon accepts.
pub const REMOTE_PATH_MAX_LENGTH: usize = 1024;

/// Permission bits sent with every pushed file (`rw-r--r--`).
pub const DEFAULT_FILE_MODE: u32 = 0o644;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

// ─────────────────────────────────────────────────────────────────
// Results and progress
// ─────────────────────────────────────────────────────────────────

/// Outcome of a push or pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub code: SyncResultCode,
    pub message: Option<String>,
}

impl SyncResult {
    pub fn ok() -> Self {
        Self {
            code: SyncResultCode::Ok,
            message: None,
        }
    }

    pub fn new(code: SyncResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == SyncResultCode::Ok
    }

    /// Convert into a `Result`, mapping failures to [`Error::SyncFailed`].
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            let message = self.message.unwrap_or_else(|| self.code.to_string());
            Err(Error::sync_failed(self.code, message))
        }
    }

    fn from_error(err: Error) -> Self {
        let code = match &err {
            Error::Timeout { .. } => SyncResultCode::Timeout,
            Error::Protocol { .. } => SyncResultCode::ProtocolError,
            _ => SyncResultCode::TransferError,
        };
        Self::new(code, err.to_string())
    }
}

/// Observer of transfer progress. Never influences the transfer.
#[cfg_attr(test, mockall::automock)]
pub trait SyncProgress: Send {
    /// Total bytes expected, reported once before the first chunk.
    fn on_start(&mut self, _total_bytes: u64) {}

    /// Cumulative bytes transferred so far.
    fn on_progress(&mut self, transferred: u64);
}

/// Progress sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSyncProgress;

impl SyncProgress for NullSyncProgress {
    fn on_progress(&mut self, _transferred: u64) {}
}

// ─────────────────────────────────────────────────────────────────
// Remote file metadata
// ─────────────────────────────────────────────────────────────────

/// Metadata for a remote path, as reported by `STAT` or `LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    /// Seconds since the Unix epoch.
    pub mtime: u32,
}

impl FileEntry {
    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Permission bits only.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.mtime), 0)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Reject a wire length above `max` before anything is allocated for it.
fn checked_len(len: u32, max: usize, what: &str) -> Result<usize> {
    let len = len as usize;
    if len > max {
        return Err(Error::protocol(format!(
            "{what} of {len} bytes exceeds the {max} byte limit"
        )));
    }
    Ok(len)
}

fn packet(id: &[u8; 4], arg: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(id);
    out[4..].copy_from_slice(&arg.to_le_bytes());
    out
}

fn path_request(id: &[u8; 4], path: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + path.len());
    out.extend_from_slice(&packet(id, path.len() as u32));
    out.extend_from_slice(path.as_bytes());
    out
}

// ─────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────

/// A connection switched into sync mode for one device.
#[derive(Debug)]
pub struct SyncSession {
    conn: AdbConnection,
    serial: String,
}

impl SyncSession {
    /// Open a sync session on `serial`.
    ///
    /// Any rejection by the daemon while switching modes yields
    /// [`Error::SyncUnavailable`]; transport failures propagate unchanged.
    pub async fn open(endpoint: &AdbEndpoint, serial: &str) -> Result<Self> {
        let mut conn = AdbConnection::open(endpoint).await?;
        match enter_sync_mode(&mut conn, serial).await {
            Ok(()) => {
                debug!("Opened sync session on {}", serial);
                Ok(Self {
                    conn,
                    serial: serial.to_string(),
                })
            }
            Err(err) if err.is_daemon_rejection() => {
                Err(Error::sync_unavailable(serial, err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Push `local` to `remote` with mode 0644.
    pub async fn push_file<P>(&mut self, local: &Path, remote: &str, progress: &mut P) -> SyncResult
    where
        P: SyncProgress + ?Sized,
    {
        if remote.len() > REMOTE_PATH_MAX_LENGTH {
            return SyncResult::new(SyncResultCode::RemotePathLength, remote);
        }
        let metadata = match tokio::fs::metadata(local).await {
            Ok(metadata) => metadata,
            Err(_) => {
                return SyncResult::new(SyncResultCode::NoLocalFile, local.display().to_string())
            }
        };
        if metadata.is_dir() {
            return SyncResult::new(
                SyncResultCode::LocalIsDirectory,
                local.display().to_string(),
            );
        }
        let mut file = match File::open(local).await {
            Ok(file) => file,
            Err(err) => return SyncResult::new(SyncResultCode::FileReadError, err.to_string()),
        };
        let mtime = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp().clamp(0, i64::from(u32::MAX)) as u32)
            .unwrap_or(0);

        progress.on_start(metadata.len());
        debug!(
            "Pushing {} ({} bytes) to {}:{}",
            local.display(),
            metadata.len(),
            self.serial,
            remote
        );
        match self.send_file(&mut file, remote, mtime, progress).await {
            Ok(result) => result,
            Err(err) => SyncResult::from_error(err),
        }
    }

    async fn send_file<P>(
        &mut self,
        file: &mut File,
        remote: &str,
        mtime: u32,
        progress: &mut P,
    ) -> Result<SyncResult>
    where
        P: SyncProgress + ?Sized,
    {
        let limit = self.conn.io_timeout();
        let target = format!("{remote},{DEFAULT_FILE_MODE}");
        self.conn.send(&path_request(ID_SEND, &target), limit).await?;

        let mut chunk = vec![0u8; SYNC_DATA_MAX];
        let mut sent: u64 = 0;
        loop {
            let n = match file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    return Ok(SyncResult::new(
                        SyncResultCode::FileReadError,
                        err.to_string(),
                    ))
                }
            };
            self.conn.send(&packet(ID_DATA, n as u32), limit).await?;
            self.conn.send(&chunk[..n], limit).await?;
            sent += n as u64;
            progress.on_progress(sent);
        }

        self.conn.send(&packet(ID_DONE, mtime), limit).await?;

        let header = self.conn.read_exact(8, limit).await?;
        match &header[..4] {
            id if id == ID_OKAY => Ok(SyncResult::ok()),
            id if id == ID_FAIL => {
                let message = self.read_message(read_u32(&header, 4)).await?;
                Ok(SyncResult::new(SyncResultCode::RemoteError, message))
            }
            other => Ok(SyncResult::new(
                SyncResultCode::ProtocolError,
                format!("unexpected sync reply {:?}", String::from_utf8_lossy(other)),
            )),
        }
    }

    /// Pull `remote` into `local`, replacing any existing file.
    pub async fn pull_file<P>(&mut self, remote: &str, local: &Path, progress: &mut P) -> SyncResult
    where
        P: SyncProgress + ?Sized,
    {
        if remote.len() > REMOTE_PATH_MAX_LENGTH {
            return SyncResult::new(SyncResultCode::RemotePathLength, remote);
        }
        let entry = match self.stat(remote).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return SyncResult::new(SyncResultCode::NoRemoteObject, remote),
            Err(err) => return SyncResult::from_error(err),
        };
        let mut file = match File::create(local).await {
            Ok(file) => file,
            Err(err) => return SyncResult::new(SyncResultCode::FileWriteError, err.to_string()),
        };

        progress.on_start(u64::from(entry.size));
        debug!(
            "Pulling {}:{} ({} bytes) to {}",
            self.serial,
            remote,
            entry.size,
            local.display()
        );
        let result = match self.receive_file(&mut file, remote, progress).await {
            Ok(result) => result,
            Err(err) => SyncResult::from_error(err),
        };
        drop(file);

        if !result.is_ok() {
            if let Err(err) = tokio::fs::remove_file(local).await {
                debug!("Could not remove partial file {}: {}", local.display(), err);
            }
        }
        result
    }

    async fn receive_file<P>(
        &mut self,
        file: &mut File,
        remote: &str,
        progress: &mut P,
    ) -> Result<SyncResult>
    where
        P: SyncProgress + ?Sized,
    {
        let limit = self.conn.io_timeout();
        self.conn.send(&path_request(ID_RECV, remote), limit).await?;

        let mut received: u64 = 0;
        loop {
            let header = self.conn.read_exact(8, limit).await?;
            let arg = read_u32(&header, 4);
            match &header[..4] {
                id if id == ID_DATA => {
                    let len = arg as usize;
                    if len > SYNC_DATA_MAX {
                        return Ok(SyncResult::new(
                            SyncResultCode::BufferOverrun,
                            format!("chunk of {len} bytes"),
                        ));
                    }
                    let data = self.conn.read_exact(len, limit).await?;
                    if let Err(err) = file.write_all(&data).await {
                        return Ok(SyncResult::new(
                            SyncResultCode::FileWriteError,
                            err.to_string(),
                        ));
                    }
                    received += len as u64;
                    progress.on_progress(received);
                }
                id if id == ID_DONE => break,
                id if id == ID_FAIL => {
                    let message = self.read_message(arg).await?;
                    return Ok(SyncResult::new(SyncResultCode::RemoteError, message));
                }
                other => {
                    return Ok(SyncResult::new(
                        SyncResultCode::ProtocolError,
                        format!("unexpected sync packet {:?}", String::from_utf8_lossy(other)),
                    ))
                }
            }
        }

        if let Err(err) = file.flush().await {
            return Ok(SyncResult::new(
                SyncResultCode::FileWriteError,
                err.to_string(),
            ));
        }
        Ok(SyncResult::ok())
    }

    /// Metadata for `remote`, or `None` if it does not exist.
    pub async fn stat(&mut self, remote: &str) -> Result<Option<FileEntry>> {
        let limit = self.conn.io_timeout();
        self.conn.send(&path_request(ID_STAT, remote), limit).await?;
        let reply = self.conn.read_exact(16, limit).await?;
        if &reply[..4] != ID_STAT {
            return Err(Error::protocol(format!(
                "expected STAT reply, got {:?}",
                String::from_utf8_lossy(&reply[..4])
            )));
        }
        let mode = read_u32(&reply, 4);
        if mode == 0 {
            return Ok(None);
        }
        let name = remote
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(remote)
            .to_string();
        Ok(Some(FileEntry {
            name,
            mode,
            size: read_u32(&reply, 8),
            mtime: read_u32(&reply, 12),
        }))
    }

    /// Entries of the remote directory `remote`, without `.` and `..`.
    pub async fn list(&mut self, remote: &str) -> Result<Vec<FileEntry>> {
        let limit = self.conn.io_timeout();
        self.conn.send(&path_request(ID_LIST, remote), limit).await?;

        let mut entries = Vec::new();
        loop {
            let header = self.conn.read_exact(20, limit).await?;
            match &header[..4] {
                id if id == ID_DONE => break,
                id if id == ID_DENT => {
                    let name_len =
                        checked_len(read_u32(&header, 16), REMOTE_PATH_MAX_LENGTH, "LIST entry name")?;
                    let name = self.conn.read_exact(name_len, limit).await?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    if name == "." || name == ".." {
                        continue;
                    }
                    entries.push(FileEntry {
                        name,
                        mode: read_u32(&header, 4),
                        size: read_u32(&header, 8),
                        mtime: read_u32(&header, 12),
                    });
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected LIST packet {:?}",
                        String::from_utf8_lossy(other)
                    )))
                }
            }
        }
        Ok(entries)
    }

    async fn read_message(&mut self, len: u32) -> Result<String> {
        let len = checked_len(len, SYNC_DATA_MAX, "FAIL message")?;
        let limit = self.conn.io_timeout();
        let bytes = self.conn.read_exact(len, limit).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Leave sync mode and release the connection.
    pub async fn close(mut self) {
        let limit = self.conn.io_timeout();
        if let Err(err) = self.conn.send(&packet(ID_QUIT, 0), limit).await {
            trace!("Ignoring error sending QUIT: {}", err);
        }
        self.conn.close().await;
    }
}

async fn enter_sync_mode(conn: &mut AdbConnection, serial: &str) -> Result<()> {
    conn.select_device(serial).await?;
    conn.send_request("sync:").await
}
