//! Background device monitor
//!
//! Owns the `host:track-devices` stream and keeps the [`DeviceRegistry`] in
//! step with it. Devices that come online get a one-shot setup task
//! (properties, mount points, AVD name) and a long-lived client tracker on
//! `track-jdwp`. When the tracking stream is lost the registry is cleared and
//! the monitor reconnects with exponential backoff. Failures never reach
//! callers; they are logged and retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use adbridge_client::{
    jdwp, query_avd_name, query_mount_point, query_properties, AdbEndpoint, DeviceListStream,
    JdwpPidStream,
};
use adbridge_core::prelude::*;
use adbridge_core::{
    emulator_console_port, ClientInfo, DeviceChange, DeviceEvent, DeviceState, MOUNT_POINT_NAMES,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{MonitorSettings, Settings};
use crate::debug_ports::DebugPortAllocator;
use crate::registry::DeviceRegistry;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Connection state of the device-tracking stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// First connection attempt in progress.
    Connecting,
    /// Tracking stream open; the registry mirrors the daemon.
    Connected,
    /// Stream lost or refused; waiting to retry.
    Reconnecting {
        /// Consecutive failed attempts so far (1-indexed).
        attempt: u32,
    },
    /// Shut down, or gave up after the configured number of attempts.
    Stopped,
}

/// Handle to the background monitor task.
#[derive(Debug)]
pub struct DeviceMonitor {
    state: Arc<RwLock<MonitorState>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    /// Spawn the monitor. Returns immediately; connection happens in the background.
    pub fn start(
        endpoint: AdbEndpoint,
        settings: &Settings,
        registry: Arc<DeviceRegistry>,
        ports: Arc<DebugPortAllocator>,
    ) -> Self {
        let state = Arc::new(RwLock::new(MonitorState::Connecting));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(MonitorContext {
            endpoint,
            settings: settings.monitor.clone(),
            shell_inactivity: settings.shell_inactivity(),
            registry,
            ports,
            state: Arc::clone(&state),
        });
        let task = tokio::spawn(run_monitor(ctx, shutdown_rx));

        Self {
            state,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal the monitor and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Device monitor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// `initial * 2^(attempt-1)`, capped at `max`.
pub fn compute_backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    initial.saturating_mul(multiplier).min(max)
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MonitorContext {
    endpoint: AdbEndpoint,
    settings: MonitorSettings,
    shell_inactivity: Duration,
    registry: Arc<DeviceRegistry>,
    ports: Arc<DebugPortAllocator>,
    state: Arc<RwLock<MonitorState>>,
}

impl MonitorContext {
    fn set_state(&self, state: MonitorState) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        *guard = state;
    }

    fn backoff(&self, attempt: u32) -> Duration {
        compute_backoff(
            attempt,
            self.settings.initial_backoff(),
            self.settings.max_backoff(),
        )
    }

    fn release_ports(&self, clients: &[ClientInfo]) {
        for port in clients.iter().filter_map(|c| c.debugger_port) {
            self.ports.release(port);
        }
    }

    fn is_online(&self, serial: &str) -> bool {
        self.registry.state(serial) == Some(DeviceState::Online)
    }
}

/// Per-device background work, aborted when the device leaves `Online`.
#[derive(Debug, Default)]
struct DeviceTasks {
    setup: Option<JoinHandle<()>>,
    clients: Option<JoinHandle<()>>,
}

impl DeviceTasks {
    fn abort(self) {
        if let Some(task) = self.setup {
            task.abort();
        }
        if let Some(task) = self.clients {
            task.abort();
        }
    }
}

/// Resolves once shutdown is requested or the monitor handle is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_monitor(ctx: Arc<MonitorContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tasks: HashMap<String, DeviceTasks> = HashMap::new();
    let mut attempt: u32 = 0;

    'outer: loop {
        let opened = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => None,
            opened = DeviceListStream::open(&ctx.endpoint) => Some(opened),
        };
        let Some(opened) = opened else {
            break;
        };

        match opened {
            Ok(mut stream) => {
                if attempt > 0 {
                    info!("Device tracking reconnected after {} attempt(s)", attempt);
                }
                ctx.set_state(MonitorState::Connected);
                attempt = 0;

                loop {
                    let snapshot = tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown_rx) => None,
                        snapshot = stream.next_snapshot() => Some(snapshot),
                    };
                    let Some(snapshot) = snapshot else {
                        stream.close().await;
                        break 'outer;
                    };
                    match snapshot {
                        Ok(entries) => {
                            let events = ctx.registry.apply_device_list(&entries);
                            handle_events(&ctx, &events, &mut tasks);
                        }
                        Err(e) => {
                            warn!("Device tracking stream lost: {}", e);
                            break;
                        }
                    }
                }

                let events = ctx.registry.clear();
                handle_events(&ctx, &events, &mut tasks);
            }
            Err(e) => {
                warn!(
                    "Failed to start device tracking at {}: {}",
                    ctx.endpoint.addr, e
                );
            }
        }

        attempt += 1;
        if let Some(max) = ctx.settings.max_reconnect_attempts {
            if attempt > max {
                error!(
                    "Device tracking: exceeded {} reconnection attempts, giving up",
                    max
                );
                break;
            }
        }
        ctx.set_state(MonitorState::Reconnecting { attempt });

        let backoff = ctx.backoff(attempt);
        warn!(
            "Device tracking: retrying in {:?} (attempt {})",
            backoff, attempt
        );
        let slept = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => false,
            _ = tokio::time::sleep(backoff) => true,
        };
        if !slept {
            break;
        }
    }

    for (_, device_tasks) in tasks.drain() {
        device_tasks.abort();
    }
    let events = ctx.registry.clear();
    for event in &events {
        if let DeviceEvent::Disconnected(device) = event {
            ctx.release_ports(&device.clients);
        }
    }
    ctx.set_state(MonitorState::Stopped);
    debug!("Device monitor exiting");
}

fn handle_events(
    ctx: &Arc<MonitorContext>,
    events: &[DeviceEvent],
    tasks: &mut HashMap<String, DeviceTasks>,
) {
    for event in events {
        match event {
            DeviceEvent::Connected(device) if device.is_online() => {
                bring_online(ctx, &device.serial, tasks);
            }
            DeviceEvent::Changed {
                device,
                change: DeviceChange::State,
            } => {
                if device.is_online() {
                    bring_online(ctx, &device.serial, tasks);
                } else {
                    take_offline(ctx, &device.serial, tasks);
                }
            }
            DeviceEvent::Disconnected(device) => {
                take_offline(ctx, &device.serial, tasks);
                ctx.release_ports(&device.clients);
            }
            _ => {}
        }
    }
}

fn bring_online(ctx: &Arc<MonitorContext>, serial: &str, tasks: &mut HashMap<String, DeviceTasks>) {
    if tasks.contains_key(serial) {
        return;
    }
    let mut device_tasks = DeviceTasks::default();
    if ctx.settings.query_device_info || ctx.settings.query_avd_name {
        device_tasks.setup = Some(tokio::spawn(setup_device(
            Arc::clone(ctx),
            serial.to_string(),
        )));
    }
    if ctx.settings.track_clients {
        device_tasks.clients = Some(tokio::spawn(track_clients(
            Arc::clone(ctx),
            serial.to_string(),
        )));
    }
    tasks.insert(serial.to_string(), device_tasks);
}

fn take_offline(ctx: &Arc<MonitorContext>, serial: &str, tasks: &mut HashMap<String, DeviceTasks>) {
    if let Some(device_tasks) = tasks.remove(serial) {
        debug!("Stopping background work for {}", serial);
        device_tasks.abort();
    }
    let removed = ctx.registry.clear_client_list(serial);
    ctx.release_ports(&removed);
}

// ---------------------------------------------------------------------------
// Device setup
// ---------------------------------------------------------------------------

async fn setup_device(ctx: Arc<MonitorContext>, serial: String) {
    if ctx.settings.query_device_info {
        match query_properties(&ctx.endpoint, &serial, ctx.shell_inactivity).await {
            Ok(properties) => {
                ctx.registry.set_properties(&serial, properties);
            }
            Err(e) => warn!("Failed to read properties of {}: {}", serial, e),
        }

        for name in MOUNT_POINT_NAMES {
            match query_mount_point(&ctx.endpoint, &serial, name, ctx.shell_inactivity).await {
                Ok(Some(path)) => {
                    ctx.registry.set_mount_point(&serial, name, path);
                }
                Ok(None) => debug!("{} has no {} mount point", serial, name),
                Err(e) => debug!("Failed to read {} on {}: {}", name, serial, e),
            }
        }
    }

    if ctx.settings.query_avd_name {
        if let Some(port) = emulator_console_port(&serial) {
            match query_avd_name(port, ctx.endpoint.connect_timeout).await {
                Ok(Some(avd_name)) => {
                    ctx.registry.set_avd_name(&serial, avd_name);
                }
                Ok(None) => debug!("Emulator console of {} reported no AVD name", serial),
                Err(e) => debug!("Emulator console of {} unavailable: {}", serial, e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client tracking
// ---------------------------------------------------------------------------

async fn track_clients(ctx: Arc<MonitorContext>, serial: String) {
    let mut attempt: u32 = 0;
    loop {
        match JdwpPidStream::open(&ctx.endpoint, &serial).await {
            Ok(mut stream) => {
                attempt = 0;
                loop {
                    match stream.next_snapshot().await {
                        Ok(pids) => {
                            sync_clients(&ctx, stream.serial(), &pids).await;
                            if !ctx.is_online(stream.serial()) {
                                debug!("{} left Online, closing client tracking", serial);
                                stream.close().await;
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("Client tracking on {} ended: {}", serial, e);
                            break;
                        }
                    }
                }
            }
            // The device is gone or cannot serve `track-jdwp`; retrying the
            // same request gets the same answer.
            Err(e) if e.is_daemon_rejection() && !e.is_retryable() => {
                debug!("Not tracking clients on {}: {}", serial, e);
                let removed = ctx.registry.clear_client_list(&serial);
                ctx.release_ports(&removed);
                return;
            }
            Err(e) => warn!("Failed to track clients on {}: {}", serial, e),
        }

        let removed = ctx.registry.clear_client_list(&serial);
        ctx.release_ports(&removed);

        if !ctx.is_online(&serial) {
            return;
        }
        attempt += 1;
        let backoff = ctx.backoff(attempt);
        debug!(
            "Retrying client tracking on {} in {:?} (attempt {})",
            serial, backoff, attempt
        );
        tokio::time::sleep(backoff).await;
        if !ctx.is_online(&serial) {
            return;
        }
    }
}

/// Reconcile the registry's clients for `serial` with a full pid snapshot.
async fn sync_clients(ctx: &MonitorContext, serial: &str, pids: &[u32]) {
    let removed = ctx.registry.retain_clients(serial, pids);
    ctx.release_ports(&removed);

    let known: Vec<u32> = ctx
        .registry
        .clients(serial)
        .iter()
        .map(|c| c.pid)
        .collect();

    for &pid in pids.iter().filter(|pid| !known.contains(*pid)) {
        if ctx.settings.jdwp_handshake {
            match jdwp::handshake(&ctx.endpoint, serial, pid).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("pid {} on {} is not a JDWP process", pid, serial);
                    continue;
                }
                Err(e) => {
                    debug!("JDWP handshake with pid {} on {} failed: {}", pid, serial, e);
                    continue;
                }
            }
        }

        let description =
            match jdwp::process_description(&ctx.endpoint, serial, pid, ctx.shell_inactivity)
                .await
            {
                Ok(description) => description,
                Err(e) => {
                    debug!("No description for pid {} on {}: {}", pid, serial, e);
                    None
                }
            };

        let mut client = ClientInfo::new(serial, pid);
        if let Some(description) = description {
            client = client.with_description(description);
        }
        let port = ctx.ports.allocate();
        match port {
            Some(port) => client = client.with_debugger_port(port),
            None => warn!("No debugger port left for pid {} on {}", pid, serial),
        }

        if !ctx.registry.add_client(client) {
            if let Some(port) = port {
                ctx.ports.release(port);
            }
        }
    }
}
