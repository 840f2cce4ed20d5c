//! Package install and uninstall orchestration
//!
//! Install is push, `pm install`, then an unconditional `rm` of the pushed
//! file. The policy is written against [`PackageTarget`] so it runs the same
//! against a real [`Device`](crate::Device) and against test doubles.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use adbridge_client::{NullReceiver, ShellOutputReceiver};
use adbridge_core::prelude::*;
use regex::Regex;

/// Where packages are staged before `pm install`.
pub const REMOTE_STAGING_DIR: &str = "/data/local/tmp";

static FAILURE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Failure\s+\[(.*)\]$").expect("Invalid pm failure regex"));

const SUCCESS_OUTPUT: &str = "Success";

/// What the orchestrator needs from a device.
#[trait_variant::make(PackageTarget: Send)]
pub trait LocalPackageTarget {
    fn serial(&self) -> &str;

    /// Copy `local` to `remote`; any failure is returned as an error.
    async fn push_package(&self, local: &Path, remote: &str) -> Result<()>;

    /// Run `command`, streaming output to `receiver`.
    async fn run_shell(
        &self,
        command: &str,
        receiver: &mut dyn ShellOutputReceiver,
        max_inactivity: Duration,
    ) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────
// pm output parsing
// ─────────────────────────────────────────────────────────────────

/// Reads `pm install` / `pm uninstall` output.
///
/// `Success` clears a previously seen failure; `Failure [reason]` records
/// one. Output with neither counts as success.
#[derive(Debug, Default)]
pub struct InstallReceiver {
    error_message: Option<String>,
    saw_marker: bool,
}

impl InstallReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Whether a `Success` or `Failure` line was seen at all.
    pub fn saw_marker(&self) -> bool {
        self.saw_marker
    }
}

impl ShellOutputReceiver for InstallReceiver {
    fn process_new_lines(&mut self, lines: &[String]) {
        for line in lines.iter().filter(|line| !line.is_empty()) {
            if line.starts_with(SUCCESS_OUTPUT) {
                self.error_message = None;
                self.saw_marker = true;
            } else if let Some(caps) = FAILURE_PATTERN.captures(line) {
                self.error_message = Some(caps[1].to_string());
                self.saw_marker = true;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Orchestration
// ─────────────────────────────────────────────────────────────────

/// `/data/local/tmp/<file name of local>`.
pub fn remote_package_path(local: &Path) -> Result<String> {
    let name = local
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::install_failed(format!("Invalid package path: {}", local.display())))?;
    Ok(format!("{REMOTE_STAGING_DIR}/{name}"))
}

/// Push `local` to the staging directory and return the remote path.
pub async fn sync_package_to_device<T>(target: &T, local: &Path) -> Result<String>
where
    T: PackageTarget,
{
    let remote = remote_package_path(local)?;
    info!("Uploading {} onto device '{}'", local.display(), target.serial());
    target
        .push_package(local, &remote)
        .await
        .map_err(|e| Error::install_failed(format!("Unable to upload file: {e}")))?;
    Ok(remote)
}

/// Run `pm install [-r] "<remote>"` and interpret its output.
pub async fn install_remote_package<T>(
    target: &T,
    remote: &str,
    reinstall: bool,
    timeout: Duration,
) -> Result<()>
where
    T: PackageTarget,
{
    let command = if reinstall {
        format!("pm install -r \"{remote}\"")
    } else {
        format!("pm install \"{remote}\"")
    };
    run_pm(target, &command, timeout).await
}

/// Run `pm uninstall <package>` and interpret its output.
pub async fn uninstall_package<T>(target: &T, package: &str, timeout: Duration) -> Result<()>
where
    T: PackageTarget,
{
    run_pm(target, &format!("pm uninstall {package}"), timeout).await
}

/// Delete a staged package.
pub async fn remove_remote_package<T>(target: &T, remote: &str, timeout: Duration) -> Result<()>
where
    T: PackageTarget,
{
    target
        .run_shell(&format!("rm {remote}"), &mut NullReceiver, timeout)
        .await
        .map_err(|e| {
            error!("Failed to delete temporary package {}: {}", remote, e);
            Error::install_failed(format!("Failed to delete {remote}: {e}"))
        })
}

/// Push, install, then always clean up the staged file.
///
/// A push failure returns before anything runs on the device. A cleanup
/// failure is logged and never replaces the install result.
pub async fn install_package<T>(
    target: &T,
    local: &Path,
    reinstall: bool,
    timeout: Duration,
) -> Result<()>
where
    T: PackageTarget,
{
    let remote = sync_package_to_device(target, local).await?;
    let result = install_remote_package(target, &remote, reinstall, timeout).await;
    if let Err(e) = remove_remote_package(target, &remote, timeout).await {
        warn!("Ignoring cleanup failure on {}: {}", target.serial(), e);
    }
    match &result {
        Ok(()) => info!("Installed {} on {}", local.display(), target.serial()),
        Err(e) => warn!("Install of {} on {} failed: {}", local.display(), target.serial(), e),
    }
    result
}

async fn run_pm<T>(target: &T, command: &str, timeout: Duration) -> Result<()>
where
    T: PackageTarget,
{
    let mut receiver = InstallReceiver::new();
    target
        .run_shell(command, &mut receiver, timeout)
        .await
        .map_err(|e| Error::install_failed(e.to_string()))?;

    if let Some(reason) = receiver.error_message() {
        return Err(Error::install_failed(reason));
    }
    if !receiver.saw_marker() {
        warn!(
            "'{}' on {} printed neither Success nor Failure; assuming success",
            command,
            target.serial()
        );
    }
    Ok(())
}
