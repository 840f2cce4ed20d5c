//! Scripted in-process adb daemon for tests
//!
//! [`MockAdbServer`] listens on an ephemeral loopback port and speaks the
//! real host wire protocol, so transport, shell, sync and tracking code runs
//! unchanged against it. Behavior is scripted from the test:
//!
//! ```ignore
//! let server = MockAdbServer::start().await;
//! server.set_devices(&[("emulator-5554", "device")]);
//! server.on_shell("pm install", ShellReply::output("Success\n"));
//!
//! // ... exercise code against server.endpoint() ...
//!
//! assert_eq!(server.shell_commands(), vec!["pm install ..."]);
//! ```
//!
//! Supported services:
//! - `host:version`, `host:track-devices`, `host:list-forward`
//! - `host:transport:<serial>` followed by `sync:`, `track-jdwp`,
//!   `jdwp:<pid>` or `reboot:<target>`
//! - `shell:<serial>,<command>` with scripted replies
//! - `host-serial:<serial>:forward:<local>;<remote>` and `killforward:<local>`
//!
//! Sync keeps an in-memory file system keyed by absolute remote path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use adbridge_core::ForwardRule;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::sync::SYNC_DATA_MAX;
use crate::transport::AdbEndpoint;

/// How the mock answers a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellReply {
    /// `OKAY`, the given bytes, then close.
    Output(String),
    /// `OKAY`, then never send anything.
    Silent,
    /// `FAIL` with the given message.
    Reject(String),
}

impl ShellReply {
    pub fn output(text: impl Into<String>) -> Self {
        ShellReply::Output(text.into())
    }
}

#[derive(Debug, Clone)]
struct MockFile {
    data: Vec<u8>,
    mode: u32,
    mtime: u32,
}

#[derive(Debug, Default)]
struct MockState {
    shell_replies: Vec<(String, ShellReply)>,
    shell_log: Vec<String>,
    requests: Vec<String>,
    files: HashMap<String, MockFile>,
    push_failure: Option<String>,
    sync_rejected: bool,
    jdwp_rejected: bool,
    forwards: Vec<ForwardRule>,
}

impl MockState {
    /// Most recently registered reply whose pattern equals or prefixes `command`.
    fn reply_for(&self, command: &str) -> ShellReply {
        self.shell_replies
            .iter()
            .rev()
            .find(|(pattern, _)| command == pattern || command.starts_with(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| ShellReply::Output(String::new()))
    }
}

struct Shared {
    state: Mutex<MockState>,
    devices: watch::Sender<Vec<(String, String)>>,
    jdwp_pids: Mutex<HashMap<String, watch::Sender<Vec<u32>>>>,
    drop_tracking: broadcast::Sender<()>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `Err` carries the daemon's rejection message.
    fn check_device(&self, serial: &str) -> std::result::Result<(), String> {
        let devices = self.devices.borrow();
        match devices.iter().find(|(s, _)| s == serial) {
            Some((_, state)) if state == "device" => Ok(()),
            Some(_) => Err("device offline".to_string()),
            None => Err(format!("device '{serial}' not found")),
        }
    }

    fn subscribe_jdwp(&self, serial: &str) -> watch::Receiver<Vec<u32>> {
        let mut map = self.jdwp_pids.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(serial.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .subscribe()
    }
}

/// A fake adb daemon bound to `127.0.0.1:<ephemeral>`.
pub struct MockAdbServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockAdbServer {
    /// Bind and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock adb server");
        let addr = listener.local_addr().expect("mock adb server address");
        let (drop_tracking, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            state: Mutex::new(MockState::default()),
            devices: watch::channel(Vec::new()).0,
            jdwp_pids: Mutex::new(HashMap::new()),
            drop_tracking,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(socket, shared).await {
                        tracing::debug!("mock adb connection ended: {}", err);
                    }
                });
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint with short timeouts suitable for tests.
    pub fn endpoint(&self) -> AdbEndpoint {
        AdbEndpoint::new(self.addr)
            .with_connect_timeout(Duration::from_secs(1))
            .with_io_timeout(Duration::from_secs(2))
    }

    /// Replace the device list; every `track-devices` stream sees the new snapshot.
    pub fn set_devices(&self, devices: &[(&str, &str)]) {
        self.shared.devices.send_replace(
            devices
                .iter()
                .map(|(serial, state)| (serial.to_string(), state.to_string()))
                .collect(),
        );
    }

    /// Replace the debuggable pid list reported by `track-jdwp` on `serial`.
    pub fn set_jdwp_pids(&self, serial: &str, pids: &[u32]) {
        let mut map = self.shared.jdwp_pids.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(serial.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .send_replace(pids.to_vec());
    }

    /// Close every open `track-devices` stream.
    pub fn drop_device_tracking(&self) {
        let _ = self.shared.drop_tracking.send(());
    }

    /// Script the reply for commands equal to or starting with `pattern`.
    ///
    /// Later registrations win. Unscripted commands print nothing and exit.
    pub fn on_shell(&self, pattern: &str, reply: ShellReply) {
        self.shared
            .state()
            .shell_replies
            .push((pattern.to_string(), reply));
    }

    /// Every shell command received, in order.
    pub fn shell_commands(&self) -> Vec<String> {
        self.shared.state().shell_log.clone()
    }

    /// Every service request received, in order.
    pub fn requests(&self) -> Vec<String> {
        self.shared.state().requests.clone()
    }

    /// Place a file in the in-memory device file system.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.shared.state().files.insert(
            path.to_string(),
            MockFile {
                data: data.to_vec(),
                mode: 0o100644,
                mtime: 1_700_000_000,
            },
        );
    }

    /// Contents of a remote file, if present.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.state().files.get(path).map(|f| f.data.clone())
    }

    /// Mode and mtime of a remote file, if present.
    pub fn file_metadata(&self, path: &str) -> Option<(u32, u32)> {
        self.shared
            .state()
            .files
            .get(path)
            .map(|f| (f.mode, f.mtime))
    }

    /// Make every push end with `FAIL <message>` (`None` restores success).
    pub fn fail_pushes(&self, message: Option<&str>) {
        self.shared.state().push_failure = message.map(str::to_string);
    }

    /// Make `sync:` requests fail.
    pub fn reject_sync(&self, rejected: bool) {
        self.shared.state().sync_rejected = rejected;
    }

    /// Make `track-jdwp` requests fail.
    pub fn reject_jdwp_tracking(&self, rejected: bool) {
        self.shared.state().jdwp_rejected = rejected;
    }

    pub fn forwards(&self) -> Vec<ForwardRule> {
        self.shared.state().forwards.clone()
    }
}

impl Drop for MockAdbServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ─────────────────────────────────────────────────────────────────
// Wire helpers
// ─────────────────────────────────────────────────────────────────

type IoResult<T> = std::io::Result<T>;

async fn read_request(socket: &mut TcpStream) -> IoResult<Option<String>> {
    let mut prefix = [0u8; 4];
    match socket.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = std::str::from_utf8(&prefix)
        .ok()
        .and_then(|text| usize::from_str_radix(text, 16).ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad prefix"))?;
    let mut service = vec![0u8; len];
    socket.read_exact(&mut service).await?;
    Ok(Some(String::from_utf8_lossy(&service).into_owned()))
}

async fn okay(socket: &mut TcpStream) -> IoResult<()> {
    socket.write_all(b"OKAY").await
}

async fn fail(socket: &mut TcpStream, message: &str) -> IoResult<()> {
    let mut out = format!("FAIL{:04x}", message.len()).into_bytes();
    out.extend_from_slice(message.as_bytes());
    socket.write_all(&out).await
}

async fn write_frame(socket: &mut TcpStream, payload: &str) -> IoResult<()> {
    let mut out = format!("{:04x}", payload.len()).into_bytes();
    out.extend_from_slice(payload.as_bytes());
    socket.write_all(&out).await
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

fn sync_packet(id: &[u8; 4], arg: u32) -> Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&arg.to_le_bytes());
    out
}

// ─────────────────────────────────────────────────────────────────
// Service handlers
// ─────────────────────────────────────────────────────────────────

async fn handle_connection(mut socket: TcpStream, shared: Arc<Shared>) -> IoResult<()> {
    let mut selected: Option<String> = None;
    loop {
        let Some(service) = read_request(&mut socket).await? else {
            return Ok(());
        };
        let (sync_rejected, jdwp_rejected) = {
            let mut state = shared.state();
            state.requests.push(service.clone());
            (state.sync_rejected, state.jdwp_rejected)
        };

        if let Some(serial) = service.strip_prefix("host:transport:") {
            match shared.check_device(serial) {
                Ok(()) => {
                    okay(&mut socket).await?;
                    selected = Some(serial.to_string());
                    continue;
                }
                Err(message) => return fail(&mut socket, &message).await,
            }
        }

        return match service.as_str() {
            "host:version" => {
                okay(&mut socket).await?;
                write_frame(&mut socket, "0029").await
            }
            "host:track-devices" => track_devices(socket, &shared).await,
            "host:list-forward" => {
                let payload: String = shared
                    .state()
                    .forwards
                    .iter()
                    .map(|rule| format!("{} {} {}\n", rule.serial, rule.local, rule.remote))
                    .collect();
                okay(&mut socket).await?;
                write_frame(&mut socket, &payload).await
            }
            "sync:" => match selected {
                Some(serial) if !sync_rejected => {
                    okay(&mut socket).await?;
                    sync_service(socket, &shared, &serial).await
                }
                _ => fail(&mut socket, "closed").await,
            },
            "track-jdwp" => match selected {
                Some(_) if jdwp_rejected => fail(&mut socket, "closed").await,
                Some(serial) => track_jdwp(socket, &shared, &serial).await,
                None => fail(&mut socket, "no device selected").await,
            },
            other if other.starts_with("shell:") => shell(socket, &shared, other).await,
            other if other.starts_with("jdwp:") && selected.is_some() => {
                jdwp_handshake(socket).await
            }
            other if other.starts_with("reboot:") && selected.is_some() => okay(&mut socket).await,
            other if other.starts_with("host-serial:") => forward(socket, &shared, other).await,
            other => fail(&mut socket, &format!("unknown host service '{other}'")).await,
        };
    }
}

async fn track_devices(mut socket: TcpStream, shared: &Shared) -> IoResult<()> {
    okay(&mut socket).await?;
    let mut devices = shared.devices.subscribe();
    let mut dropped = shared.drop_tracking.subscribe();
    loop {
        let payload: String = devices
            .borrow_and_update()
            .iter()
            .map(|(serial, state)| format!("{serial}\t{state}\n"))
            .collect();
        write_frame(&mut socket, &payload).await?;
        tokio::select! {
            changed = devices.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = dropped.recv() => return Ok(()),
        }
    }
}

async fn track_jdwp(mut socket: TcpStream, shared: &Shared, serial: &str) -> IoResult<()> {
    okay(&mut socket).await?;
    let mut pids = shared.subscribe_jdwp(serial);
    loop {
        let payload: String = pids
            .borrow_and_update()
            .iter()
            .map(|pid| format!("{pid}\n"))
            .collect();
        write_frame(&mut socket, &payload).await?;
        if pids.changed().await.is_err() {
            return Ok(());
        }
    }
}

async fn jdwp_handshake(mut socket: TcpStream) -> IoResult<()> {
    okay(&mut socket).await?;
    let mut handshake = [0u8; 14];
    socket.read_exact(&mut handshake).await?;
    socket.write_all(&handshake).await?;
    let mut buf = [0u8; 64];
    while socket.read(&mut buf).await? > 0 {}
    Ok(())
}

async fn shell(mut socket: TcpStream, shared: &Shared, service: &str) -> IoResult<()> {
    let Some((serial, command)) = service["shell:".len()..].split_once(',') else {
        return fail(&mut socket, "malformed shell request").await;
    };
    if let Err(message) = shared.check_device(serial) {
        return fail(&mut socket, &message).await;
    }
    let reply = {
        let mut state = shared.state();
        state.shell_log.push(command.to_string());
        state.reply_for(command)
    };
    match reply {
        ShellReply::Output(text) => {
            okay(&mut socket).await?;
            socket.write_all(text.as_bytes()).await?;
            socket.shutdown().await
        }
        ShellReply::Silent => {
            okay(&mut socket).await?;
            std::future::pending::<()>().await;
            Ok(())
        }
        ShellReply::Reject(message) => fail(&mut socket, &message).await,
    }
}

async fn forward(mut socket: TcpStream, shared: &Shared, service: &str) -> IoResult<()> {
    let Some((serial, command)) = service["host-serial:".len()..].split_once(':') else {
        return fail(&mut socket, "malformed forward request").await;
    };
    if let Some(spec) = command.strip_prefix("forward:") {
        let Some((local, remote)) = spec.split_once(';') else {
            return fail(&mut socket, "malformed forward spec").await;
        };
        if let Err(message) = shared.check_device(serial) {
            return fail(&mut socket, &message).await;
        }
        {
            let mut state = shared.state();
            state.forwards.retain(|rule| rule.local != local);
            state.forwards.push(ForwardRule {
                serial: serial.to_string(),
                local: local.to_string(),
                remote: remote.to_string(),
            });
        }
        return okay(&mut socket).await;
    }
    if let Some(local) = command.strip_prefix("killforward:") {
        let removed = {
            let mut state = shared.state();
            let before = state.forwards.len();
            state
                .forwards
                .retain(|rule| !(rule.serial == serial && rule.local == local));
            before != state.forwards.len()
        };
        return if removed {
            okay(&mut socket).await
        } else {
            fail(&mut socket, &format!("listener '{local}' not found")).await
        };
    }
    fail(&mut socket, "unknown host-serial service").await
}

async fn sync_service(mut socket: TcpStream, shared: &Shared, serial: &str) -> IoResult<()> {
    tracing::trace!("mock sync session on {}", serial);
    loop {
        let mut header = [0u8; 8];
        match socket.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let arg = le_u32(&header[4..]);
        let mut path = vec![0u8; arg as usize];
        if &header[..4] != b"QUIT" {
            socket.read_exact(&mut path).await?;
        }
        let path = String::from_utf8_lossy(&path).into_owned();

        match &header[..4] {
            b"SEND" => sync_receive_push(&mut socket, shared, &path).await?,
            b"RECV" => {
                let file = shared.state().files.get(&path).cloned();
                match file {
                    Some(file) => {
                        for chunk in file.data.chunks(SYNC_DATA_MAX) {
                            socket
                                .write_all(&sync_packet(b"DATA", chunk.len() as u32))
                                .await?;
                            socket.write_all(chunk).await?;
                        }
                        socket.write_all(&sync_packet(b"DONE", 0)).await?;
                    }
                    None => {
                        let message = "No such file or directory";
                        socket
                            .write_all(&sync_packet(b"FAIL", message.len() as u32))
                            .await?;
                        socket.write_all(message.as_bytes()).await?;
                    }
                }
            }
            b"STAT" => {
                let (mode, size, mtime) = {
                    let state = shared.state();
                    let dir_prefix = format!("{}/", path.trim_end_matches('/'));
                    match state.files.get(&path) {
                        Some(file) => (file.mode, file.data.len() as u32, file.mtime),
                        None if state.files.keys().any(|p| p.starts_with(&dir_prefix)) => {
                            (0o040755, 4096, 0)
                        }
                        None => (0, 0, 0),
                    }
                };
                let mut reply = sync_packet(b"STAT", mode);
                reply.extend_from_slice(&size.to_le_bytes());
                reply.extend_from_slice(&mtime.to_le_bytes());
                socket.write_all(&reply).await?;
            }
            b"LIST" => {
                let dir_prefix = format!("{}/", path.trim_end_matches('/'));
                let mut entries: Vec<(String, MockFile)> = shared
                    .state()
                    .files
                    .iter()
                    .filter_map(|(p, f)| {
                        let name = p.strip_prefix(&dir_prefix)?;
                        (!name.contains('/')).then(|| (name.to_string(), f.clone()))
                    })
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                let mut reply = Vec::new();
                for name in [".", ".."] {
                    reply.extend_from_slice(&sync_packet(b"DENT", 0o040755));
                    reply.extend_from_slice(&4096u32.to_le_bytes());
                    reply.extend_from_slice(&0u32.to_le_bytes());
                    reply.extend_from_slice(&(name.len() as u32).to_le_bytes());
                    reply.extend_from_slice(name.as_bytes());
                }
                for (name, file) in entries {
                    reply.extend_from_slice(&sync_packet(b"DENT", file.mode));
                    reply.extend_from_slice(&(file.data.len() as u32).to_le_bytes());
                    reply.extend_from_slice(&file.mtime.to_le_bytes());
                    reply.extend_from_slice(&(name.len() as u32).to_le_bytes());
                    reply.extend_from_slice(name.as_bytes());
                }
                reply.extend_from_slice(&sync_packet(b"DONE", 0));
                reply.extend_from_slice(&[0u8; 12]);
                socket.write_all(&reply).await?;
            }
            _ => return Ok(()),
        }
    }
}

async fn sync_receive_push(socket: &mut TcpStream, shared: &Shared, target: &str) -> IoResult<()> {
    let (path, mode) = match target.rsplit_once(',') {
        Some((path, mode)) => (path.to_string(), mode.parse::<u32>().unwrap_or(0o644)),
        None => (target.to_string(), 0o644),
    };

    let mut data = Vec::new();
    let mtime = loop {
        let mut header = [0u8; 8];
        socket.read_exact(&mut header).await?;
        let arg = le_u32(&header[4..]);
        match &header[..4] {
            b"DATA" => {
                let mut chunk = vec![0u8; arg as usize];
                socket.read_exact(&mut chunk).await?;
                data.extend_from_slice(&chunk);
            }
            b"DONE" => break arg,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unexpected packet during SEND",
                ))
            }
        }
    };

    let failure = shared.state().push_failure.clone();
    match failure {
        Some(message) => {
            socket
                .write_all(&sync_packet(b"FAIL", message.len() as u32))
                .await?;
            socket.write_all(message.as_bytes()).await
        }
        None => {
            shared.state().files.insert(
                path,
                MockFile {
                    data,
                    mode: 0o100000 | mode,
                    mtime,
                },
            );
            socket.write_all(&sync_packet(b"OKAY", 0)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_for_prefers_latest_match() {
        let mut state = MockState::default();
        state
            .shell_replies
            .push(("pm".to_string(), ShellReply::output("first")));
        state
            .shell_replies
            .push(("pm install".to_string(), ShellReply::output("second")));
        assert_eq!(
            state.reply_for("pm install -r \"/data/local/tmp/a.apk\""),
            ShellReply::output("second")
        );
        assert_eq!(
            state.reply_for("pm uninstall com.example"),
            ShellReply::output("first")
        );
        assert_eq!(state.reply_for("ls"), ShellReply::output(""));
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let server = MockAdbServer::start().await;
        let version = crate::host::query_version(&server.endpoint()).await.unwrap();
        assert_eq!(version, 0x29);
        assert_eq!(server.requests(), vec!["host:version"]);
    }
}
