//! Bridge context
//!
//! [`Bridge`] wires everything together: one registry, one background
//! monitor, one event dispatcher, and the device handles built on top. There
//! is no global instance; create as many bridges as there are daemons.

use std::sync::{Arc, Mutex};

use adbridge_client::AdbEndpoint;
use adbridge_core::prelude::*;
use adbridge_core::DeviceEvent;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::debug_ports::DebugPortAllocator;
use crate::device::{Device, DeviceContext};
use crate::events::{
    spawn_dispatcher, DeviceChangeListener, ListenerId, ListenerSet, EVENT_BROADCAST_CAPACITY,
};
use crate::monitor::{DeviceMonitor, MonitorState};
use crate::registry::DeviceRegistry;

pub struct Bridge {
    settings: Settings,
    ctx: Arc<DeviceContext>,
    registry: Arc<DeviceRegistry>,
    ports: Arc<DebugPortAllocator>,
    listeners: Arc<ListenerSet>,
    event_tx: broadcast::Sender<DeviceEvent>,
    monitor: DeviceMonitor,
    dispatcher_shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("endpoint", &self.ctx.endpoint)
            .field("devices", &self.registry.len())
            .field("monitor", &self.monitor.state())
            .finish()
    }
}

impl Bridge {
    /// Start tracking devices on the daemon described by `settings`.
    ///
    /// Must be called from within a Tokio runtime. Returns as soon as the
    /// background tasks are spawned; the daemon does not need to be running.
    pub fn start(settings: Settings) -> Result<Self> {
        let endpoint = settings
            .endpoint()
            .context("Invalid adb daemon settings")?;
        info!("Starting adb bridge for daemon at {}", endpoint.addr);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (dispatcher_shutdown, shutdown_rx) = watch::channel(false);
        let listeners = Arc::new(ListenerSet::new());
        let dispatcher = spawn_dispatcher(
            queue_rx,
            Arc::clone(&listeners),
            event_tx.clone(),
            shutdown_rx,
        );

        let registry = Arc::new(DeviceRegistry::new(queue_tx));
        let ports = Arc::new(DebugPortAllocator::new(settings.monitor.debug_port_base));
        let monitor = DeviceMonitor::start(
            endpoint,
            &settings,
            Arc::clone(&registry),
            Arc::clone(&ports),
        );
        let ctx = Arc::new(DeviceContext {
            endpoint,
            registry: Arc::clone(&registry),
            shell_inactivity: settings.shell_inactivity(),
            install_timeout: settings.install_timeout(),
        });

        Ok(Self {
            settings,
            ctx,
            registry,
            ports,
            listeners,
            event_tx,
            monitor,
            dispatcher_shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn endpoint(&self) -> AdbEndpoint {
        self.ctx.endpoint
    }

    /// Handles for every known device, in serial order.
    pub fn devices(&self) -> Vec<Device> {
        self.registry
            .devices()
            .into_iter()
            .map(|snapshot| Device::new(snapshot.serial, Arc::clone(&self.ctx)))
            .collect()
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.registry
            .state(serial)
            .map(|_| Device::new(serial, Arc::clone(&self.ctx)))
    }

    /// Debugger ports currently assigned to clients.
    pub fn debugger_ports(&self) -> Vec<u16> {
        self.ports.in_use()
    }

    /// Register a callback listener. It runs on the dispatcher task.
    pub fn add_device_change_listener(
        &self,
        listener: Arc<dyn DeviceChangeListener>,
    ) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_device_change_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Async stream of every device event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    /// Protocol version reported by the daemon.
    pub async fn daemon_version(&self) -> Result<u32> {
        adbridge_client::query_version(&self.ctx.endpoint).await
    }

    /// Stop the monitor, deliver the final events, and stop the dispatcher.
    ///
    /// Device handles outlive the bridge but every operation on them fails
    /// with [`Error::DeviceNotFound`] afterwards. Idempotent.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;

        let _ = self.dispatcher_shutdown.send(true);
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!("Event dispatcher ended abnormally: {}", e);
            }
            info!("adb bridge stopped");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let _ = self.dispatcher_shutdown.send(true);
    }
}
