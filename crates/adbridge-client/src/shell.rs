//! Remote shell command execution
//!
//! [`execute_remote_command`] opens a dedicated connection, asks the daemon
//! for `shell:<serial>,<command>`, and streams completed output lines to a
//! [`ShellOutputReceiver`] until the remote side closes the stream.

use std::time::Duration;

use adbridge_core::prelude::*;

use crate::transport::{classify_device_failure, AdbConnection, AdbEndpoint};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 16 * 1024;

/// Consumer of shell output.
///
/// Lines arrive in batches without their terminators. `is_cancelled` is
/// polled after every batch; returning `true` stops the command early.
pub trait ShellOutputReceiver: Send {
    fn process_new_lines(&mut self, lines: &[String]);

    fn is_cancelled(&self) -> bool {
        false
    }

    /// Called once after the last batch of a command that ran to completion.
    fn flush(&mut self) {}
}

/// Keeps every line it receives.
#[derive(Debug, Default, Clone)]
pub struct CollectingReceiver {
    lines: Vec<String>,
}

impl CollectingReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    /// All lines joined with `\n`.
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }
}

impl ShellOutputReceiver for CollectingReceiver {
    fn process_new_lines(&mut self, lines: &[String]) {
        self.lines.extend_from_slice(lines);
    }
}

/// Discards all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReceiver;

impl ShellOutputReceiver for NullReceiver {
    fn process_new_lines(&mut self, _lines: &[String]) {}
}

/// Splits a byte stream into lines, holding back an unterminated tail.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Append `bytes` and return every line completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        // The held-back tail has no newline, so only the new bytes are scanned.
        let mut search = self.pending.len();
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[search..].iter().position(|&b| b == b'\n') {
            let end = search + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
            search = start;
        }
        self.pending.drain(..start);
        lines
    }

    /// Take the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Run `command` on `serial`, streaming output lines to `receiver`.
///
/// Fails with [`Error::ShellUnresponsive`] when no bytes arrive for
/// `max_inactivity`; a zero duration waits forever. Returns `Ok(())` early
/// if the receiver reports cancellation.
pub async fn execute_remote_command<R>(
    endpoint: &AdbEndpoint,
    serial: &str,
    command: &str,
    receiver: &mut R,
    max_inactivity: Duration,
) -> Result<()>
where
    R: ShellOutputReceiver + ?Sized,
{
    let mut conn = AdbConnection::open(endpoint).await?;
    match conn.send_request(&format!("shell:{serial},{command}")).await {
        Err(Error::AdbRejected { message }) => {
            return Err(classify_device_failure(serial, message))
        }
        other => other?,
    }
    debug!("Running shell command on {}: {}", serial, command);

    let mut splitter = LineSplitter::default();
    loop {
        let chunk = if max_inactivity.is_zero() {
            conn.receive_unbounded(READ_CHUNK).await?
        } else {
            match conn.receive(READ_CHUNK, max_inactivity).await {
                Ok(chunk) => chunk,
                Err(Error::Timeout { .. }) => {
                    warn!(
                        "Shell command on {} produced no output for {:?}: {}",
                        serial, max_inactivity, command
                    );
                    return Err(Error::shell_unresponsive(command, max_inactivity));
                }
                Err(err) => return Err(err),
            }
        };

        if chunk.is_empty() {
            break;
        }

        let lines = splitter.feed(&chunk);
        if !lines.is_empty() {
            receiver.process_new_lines(&lines);
        }
        if receiver.is_cancelled() {
            debug!("Shell command cancelled by receiver: {}", command);
            conn.close().await;
            return Ok(());
        }
    }

    if let Some(last) = splitter.finish() {
        receiver.process_new_lines(&[last]);
    }
    receiver.flush();
    conn.close().await;
    Ok(())
}
