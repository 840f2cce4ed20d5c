//! Emulator console client, used to look up the AVD name
//!
//! Each emulator listens on `127.0.0.1:<console port>`, the port encoded in
//! its `emulator-<port>` serial. The console is a line protocol where every
//! reply ends in `OK` or `KO: <reason>`; newer emulators require an `auth`
//! command with the token stored in `~/.emulator_console_auth_token`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use adbridge_core::prelude::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

const AUTH_TOKEN_FILE: &str = ".emulator_console_auth_token";

type ConsoleLines = Lines<BufReader<OwnedReadHalf>>;

/// AVD name of the emulator whose console listens on `port`.
pub async fn query_avd_name(port: u16, timeout: Duration) -> Result<Option<String>> {
    query_avd_name_at(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), timeout).await
}

/// AVD name of the emulator console at `addr`.
pub async fn query_avd_name_at(addr: SocketAddr, timeout: Duration) -> Result<Option<String>> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return Err(Error::connection_refused(addr.to_string())),
    };
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let banner = read_reply(&mut lines, timeout).await?;
    if banner
        .iter()
        .any(|line| line.contains("Authentication required"))
    {
        let Some(token) = read_auth_token().await else {
            warn!("Emulator console at {} requires a token but none was found", addr);
            return Ok(None);
        };
        write
            .write_all(format!("auth {token}\r\n").as_bytes())
            .await?;
        read_reply(&mut lines, timeout).await?;
    }

    write.write_all(b"avd name\r\n").await?;
    let reply = read_reply(&mut lines, timeout).await?;
    if let Err(err) = write.write_all(b"quit\r\n").await {
        trace!("Ignoring error closing emulator console: {}", err);
    }

    Ok(reply
        .into_iter()
        .map(|line| line.trim().to_string())
        .find(|line| !line.is_empty()))
}

/// Collect lines up to the terminating `OK`.
async fn read_reply(lines: &mut ConsoleLines, timeout: Duration) -> Result<Vec<String>> {
    let mut collected = Vec::new();
    loop {
        let line = match tokio::time::timeout(timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Err(Error::protocol("emulator console closed the connection")),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(Error::timeout("waiting for emulator console")),
        };
        let line = line.trim_end();
        if line == "OK" {
            return Ok(collected);
        }
        if let Some(reason) = line.strip_prefix("KO") {
            return Err(Error::protocol(format!(
                "emulator console refused: {}",
                reason.trim_start_matches(':').trim()
            )));
        }
        collected.push(line.to_string());
    }
}

fn auth_token_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(AUTH_TOKEN_FILE))
}

async fn read_auth_token() -> Option<String> {
    let path = auth_token_path()?;
    let token = tokio::fs::read_to_string(&path).await.ok()?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
