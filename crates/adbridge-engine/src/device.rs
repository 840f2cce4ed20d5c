//! Device handle
//!
//! A [`Device`] is a cheap, clonable handle naming one serial. Readers return
//! copies of the registry's current record. Operations re-resolve the serial
//! through the registry before opening a connection, so a handle kept past
//! a disconnect fails with [`Error::DeviceNotFound`] instead of talking to
//! the wrong device.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adbridge_client::{
    forward, host, AdbEndpoint, NullSyncProgress, ShellOutputReceiver, SyncProgress, SyncSession,
};
use adbridge_core::prelude::*;
use adbridge_core::{ClientInfo, DeviceSnapshot, DeviceState, ForwardRule};

use crate::install::{self, PackageTarget};
use crate::registry::DeviceRegistry;

/// Shared by every handle a [`Bridge`](crate::Bridge) gives out.
#[derive(Debug)]
pub(crate) struct DeviceContext {
    pub(crate) endpoint: AdbEndpoint,
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) shell_inactivity: Duration,
    pub(crate) install_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Device {
    serial: String,
    ctx: Arc<DeviceContext>,
}

impl Device {
    pub(crate) fn new(serial: impl Into<String>, ctx: Arc<DeviceContext>) -> Self {
        Self {
            serial: serial.into(),
            ctx,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Readers
    // ─────────────────────────────────────────────────────────

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Current registry record, `None` once the device is gone.
    pub fn snapshot(&self) -> Option<DeviceSnapshot> {
        self.ctx.registry.device(&self.serial)
    }

    /// [`DeviceState::Disconnected`] once the device is gone.
    pub fn state(&self) -> DeviceState {
        self.ctx
            .registry
            .state(&self.serial)
            .unwrap_or(DeviceState::Disconnected)
    }

    pub fn is_online(&self) -> bool {
        self.state() == DeviceState::Online
    }

    pub fn is_offline(&self) -> bool {
        self.state() == DeviceState::Offline
    }

    pub fn is_bootloader(&self) -> bool {
        self.state() == DeviceState::Bootloader
    }

    pub fn is_emulator(&self) -> bool {
        adbridge_core::emulator_console_port(&self.serial).is_some()
    }

    pub fn avd_name(&self) -> Option<String> {
        self.snapshot().and_then(|d| d.avd_name)
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.snapshot().map(|d| d.properties).unwrap_or_default()
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.snapshot()
            .and_then(|d| d.properties.get(name).cloned())
    }

    pub fn mount_point(&self, name: &str) -> Option<String> {
        self.snapshot()
            .and_then(|d| d.mount_points.get(name).cloned())
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.ctx.registry.clients(&self.serial)
    }

    pub fn has_clients(&self) -> bool {
        !self.clients().is_empty()
    }

    /// Description of the client with `pid`, if known.
    pub fn client_name(&self, pid: u32) -> Option<String> {
        self.clients()
            .into_iter()
            .find(|c| c.pid == pid)
            .and_then(|c| c.description)
    }

    /// The client whose description is exactly `application_name`.
    pub fn client_by_name(&self, application_name: &str) -> Option<ClientInfo> {
        self.clients()
            .into_iter()
            .find(|c| c.description.as_deref() == Some(application_name))
    }

    fn ensure_online(&self) -> Result<()> {
        match self.ctx.registry.state(&self.serial) {
            None => Err(Error::device_not_found(&self.serial)),
            Some(DeviceState::Online) => Ok(()),
            Some(_) => Err(Error::device_offline(&self.serial)),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Shell
    // ─────────────────────────────────────────────────────────

    /// Run `command`, streaming output lines to `receiver`.
    ///
    /// Fails with [`Error::ShellUnresponsive`] if no output arrives for
    /// `max_inactivity` (zero waits forever).
    pub async fn execute_shell_command<R>(
        &self,
        command: &str,
        receiver: &mut R,
        max_inactivity: Duration,
    ) -> Result<()>
    where
        R: ShellOutputReceiver + ?Sized,
    {
        self.ensure_online()?;
        adbridge_client::execute_remote_command(
            &self.ctx.endpoint,
            &self.serial,
            command,
            receiver,
            max_inactivity,
        )
        .await
    }

    // ─────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────

    /// Open a sync session, or `None` if the device refuses one.
    pub async fn sync_session(&self) -> Result<Option<SyncSession>> {
        self.ensure_online()?;
        match SyncSession::open(&self.ctx.endpoint, &self.serial).await {
            Ok(session) => Ok(Some(session)),
            Err(e @ Error::SyncUnavailable { .. }) => {
                warn!("{}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn require_sync_session(&self) -> Result<SyncSession> {
        self.sync_session().await?.ok_or_else(|| {
            Error::sync_unavailable(&self.serial, "device refused the sync service")
        })
    }

    /// Push one local file to `remote`.
    pub async fn push_file<P>(&self, local: &Path, remote: &str, progress: &mut P) -> Result<()>
    where
        P: SyncProgress + ?Sized,
    {
        let mut session = self.require_sync_session().await?;
        let result = session.push_file(local, remote, progress).await;
        session.close().await;
        result.into_result()
    }

    /// Pull one remote file to `local`.
    pub async fn pull_file<P>(&self, remote: &str, local: &Path, progress: &mut P) -> Result<()>
    where
        P: SyncProgress + ?Sized,
    {
        let mut session = self.require_sync_session().await?;
        let result = session.pull_file(remote, local, progress).await;
        session.close().await;
        result.into_result()
    }

    // ─────────────────────────────────────────────────────────
    // Packages
    // ─────────────────────────────────────────────────────────

    /// Push `local`, install it, then delete the pushed copy.
    pub async fn install_package(&self, local: &Path, reinstall: bool) -> Result<()> {
        install::install_package(self, local, reinstall, self.ctx.install_timeout).await
    }

    pub async fn uninstall_package(&self, package: &str) -> Result<()> {
        install::uninstall_package(self, package, self.ctx.install_timeout).await
    }

    /// Push `local` to the staging directory and return its remote path.
    pub async fn sync_package_to_device(&self, local: &Path) -> Result<String> {
        install::sync_package_to_device(self, local).await
    }

    pub async fn install_remote_package(&self, remote: &str, reinstall: bool) -> Result<()> {
        install::install_remote_package(self, remote, reinstall, self.ctx.install_timeout).await
    }

    pub async fn remove_remote_package(&self, remote: &str) -> Result<()> {
        install::remove_remote_package(self, remote, self.ctx.install_timeout).await
    }

    // ─────────────────────────────────────────────────────────
    // Forwarding and reboot
    // ─────────────────────────────────────────────────────────

    pub async fn create_forward(&self, local_port: u16, remote_port: u16) -> Result<()> {
        self.ensure_online()?;
        forward::create_forward(&self.ctx.endpoint, &self.serial, local_port, remote_port).await
    }

    /// Remove the forward on `local_port`. The daemon keys forwards by local
    /// port only; `remote_port` is informational.
    pub async fn remove_forward(&self, local_port: u16, remote_port: u16) -> Result<()> {
        self.ensure_online()?;
        debug!(
            "Removing forward tcp:{} -> tcp:{} on {}",
            local_port, remote_port, self.serial
        );
        forward::remove_forward(&self.ctx.endpoint, &self.serial, local_port).await
    }

    /// Forwards the daemon holds for this device.
    pub async fn list_forwards(&self) -> Result<Vec<ForwardRule>> {
        let rules = forward::list_forwards(&self.ctx.endpoint).await?;
        Ok(rules
            .into_iter()
            .filter(|rule| rule.serial == self.serial)
            .collect())
    }

    /// Reboot normally, or into `bootloader` / `recovery`.
    pub async fn reboot(&self, into: Option<&str>) -> Result<()> {
        self.ensure_online()?;
        host::reboot(&self.ctx.endpoint, &self.serial, into).await
    }
}

impl PackageTarget for Device {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn push_package(&self, local: &Path, remote: &str) -> Result<()> {
        self.push_file(local, remote, &mut NullSyncProgress).await
    }

    async fn run_shell(
        &self,
        command: &str,
        receiver: &mut dyn ShellOutputReceiver,
        max_inactivity: Duration,
    ) -> Result<()> {
        self.execute_shell_command(command, receiver, max_inactivity)
            .await
    }
}
