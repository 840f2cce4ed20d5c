//! Device property and mount-point queries

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use adbridge_core::prelude::*;
use regex::Regex;

use crate::shell::{execute_remote_command, CollectingReceiver, ShellOutputReceiver};
use crate::transport::AdbEndpoint;

/// `getprop` prints one `[name]: [value]` pair per line.
static GETPROP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]$").expect("Invalid getprop regex"));

/// Collects `getprop` output into a map; unparseable lines are skipped.
#[derive(Debug, Default)]
pub struct GetPropReceiver {
    properties: BTreeMap<String, String>,
}

impl GetPropReceiver {
    pub fn into_properties(self) -> BTreeMap<String, String> {
        self.properties
    }
}

impl ShellOutputReceiver for GetPropReceiver {
    fn process_new_lines(&mut self, lines: &[String]) {
        for line in lines {
            if let Some(caps) = GETPROP_LINE.captures(line.trim()) {
                self.properties
                    .insert(caps[1].to_string(), caps[2].to_string());
            }
        }
    }
}

/// Run `getprop` on `serial`.
pub async fn query_properties(
    endpoint: &AdbEndpoint,
    serial: &str,
    max_inactivity: Duration,
) -> Result<BTreeMap<String, String>> {
    let mut receiver = GetPropReceiver::default();
    execute_remote_command(endpoint, serial, "getprop", &mut receiver, max_inactivity).await?;
    let properties = receiver.into_properties();
    debug!("Read {} properties from {}", properties.len(), serial);
    Ok(properties)
}

/// Resolve the path behind a mount-point environment variable such as `ANDROID_DATA`.
pub async fn query_mount_point(
    endpoint: &AdbEndpoint,
    serial: &str,
    name: &str,
    max_inactivity: Duration,
) -> Result<Option<String>> {
    let mut receiver = CollectingReceiver::new();
    execute_remote_command(
        endpoint,
        serial,
        &format!("echo ${name}"),
        &mut receiver,
        max_inactivity,
    )
    .await?;
    Ok(receiver
        .lines()
        .iter()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(str::to_string))
}
