//! Single-use TCP connections to the adb daemon
//!
//! An [`AdbConnection`] serves exactly one logical operation and is never
//! shared. Dropping it closes the socket, so every exit path releases it.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use adbridge_core::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{self, AdbStatus};

/// Port the daemon listens on unless told otherwise.
pub const DEFAULT_ADB_PORT: u16 = 5037;

/// Default bound for connecting and for each individual read or write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Where the daemon lives and how long to wait for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdbEndpoint {
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl AdbEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: DEFAULT_TIMEOUT,
            io_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

impl Default for AdbEndpoint {
    fn default() -> Self {
        Self::new(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            DEFAULT_ADB_PORT,
        )))
    }
}

/// Run an I/O future under an optional deadline, mapping expiry to [`Error::Timeout`].
async fn bounded<T, F>(timeout: Option<Duration>, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::timeout(operation)),
        },
        None => Ok(fut.await?),
    }
}

/// One open socket to the daemon.
#[derive(Debug)]
pub struct AdbConnection {
    stream: TcpStream,
    endpoint: AdbEndpoint,
}

impl AdbConnection {
    /// Connect to the daemon within `endpoint.connect_timeout`.
    pub async fn open(endpoint: &AdbEndpoint) -> Result<Self> {
        let addr = endpoint.addr;
        let stream =
            match tokio::time::timeout(endpoint.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!("Connecting to adb daemon at {} failed: {}", addr, err);
                    return Err(Error::connection_refused(addr.to_string()));
                }
                Err(_) => {
                    debug!(
                        "Connecting to adb daemon at {} timed out after {:?}",
                        addr, endpoint.connect_timeout
                    );
                    return Err(Error::connection_refused(addr.to_string()));
                }
            };
        stream.set_nodelay(true)?;
        trace!("Opened adb connection to {}", addr);
        Ok(Self {
            stream,
            endpoint: *endpoint,
        })
    }

    pub fn endpoint(&self) -> &AdbEndpoint {
        &self.endpoint
    }

    /// Default per-operation bound for this connection.
    pub fn io_timeout(&self) -> Duration {
        self.endpoint.io_timeout
    }

    /// Write all of `bytes`, failing if the daemon stops accepting data for `timeout`.
    pub async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        bounded(
            Some(timeout),
            "writing to adb daemon",
            self.stream.write_all(bytes),
        )
        .await
    }

    /// Read up to `max_bytes`. An empty result means the daemon closed the stream.
    pub async fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.receive_inner(max_bytes, Some(timeout)).await
    }

    /// Read up to `max_bytes` with no deadline; for streams that idle legitimately.
    pub async fn receive_unbounded(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        self.receive_inner(max_bytes, None).await
    }

    async fn receive_inner(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let n = bounded(timeout, "reading from adb daemon", self.stream.read(&mut buf)).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read exactly `len` bytes within `timeout`.
    pub async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_into(&mut buf, timeout).await?;
        Ok(buf)
    }

    /// Fill `buf` completely within `timeout`.
    pub async fn read_exact_into(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, protocol::read_fully(&mut self.stream, buf)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("reading from adb daemon")),
        }
    }

    /// Read the next status token.
    pub async fn read_status(&mut self) -> Result<AdbStatus> {
        let limit = self.io_timeout();
        match tokio::time::timeout(limit, protocol::read_status(&mut self.stream)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("waiting for adb status")),
        }
    }

    /// Read one length-prefixed payload within the connection's I/O timeout.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let limit = self.io_timeout();
        match tokio::time::timeout(limit, protocol::read_length_prefixed(&mut self.stream)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("reading adb payload")),
        }
    }

    /// Read one length-prefixed payload with no deadline (tracking streams).
    pub async fn read_frame_unbounded(&mut self) -> Result<Vec<u8>> {
        protocol::read_length_prefixed(&mut self.stream).await
    }

    /// Send a service request and require `OKAY`.
    ///
    /// A `FAIL` reply becomes [`Error::AdbRejected`] carrying the daemon's message.
    pub async fn send_request(&mut self, service: &str) -> Result<()> {
        let request = protocol::encode_request(service)?;
        let limit = self.io_timeout();
        self.send(&request, limit).await?;
        match self.read_status().await? {
            AdbStatus::Okay => {
                trace!("adb accepted '{}'", service);
                Ok(())
            }
            AdbStatus::Fail(message) => {
                debug!("adb rejected '{}': {}", service, message);
                Err(Error::rejected(message))
            }
        }
    }

    /// Route the rest of this connection to `serial`.
    pub async fn select_device(&mut self, serial: &str) -> Result<()> {
        match self.send_request(&format!("host:transport:{serial}")).await {
            Err(Error::AdbRejected { message }) => Err(classify_device_failure(serial, message)),
            other => other,
        }
    }

    /// Shut the socket down. Dropping the connection has the same effect.
    pub async fn close(mut self) {
        if let Err(err) = self.stream.shutdown().await {
            trace!("Ignoring error while closing adb connection: {}", err);
        }
    }
}

/// Map the daemon's device-selection failures onto device errors.
pub(crate) fn classify_device_failure(serial: &str, message: String) -> Error {
    if message.contains("not found") {
        Error::device_not_found(serial)
    } else if message.contains("offline") {
        Error::device_offline(serial)
    } else {
        Error::rejected(message)
    }
}
