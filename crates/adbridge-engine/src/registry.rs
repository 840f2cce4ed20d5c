//! Device registry
//!
//! The authoritative set of known devices and their debuggable clients,
//! keyed by serial. Every mutation sends its events to the dispatcher
//! channel before releasing its lock, so the channel order is the commit
//! order. Listener callbacks run on the dispatcher, never under these locks.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, RwLock};

use adbridge_client::DeviceListEntry;
use adbridge_core::prelude::*;
use adbridge_core::{ClientInfo, DeviceChange, DeviceEvent, DeviceSnapshot, DeviceState};

use crate::events::EventSender;

#[derive(Debug)]
struct DeviceRecord {
    state: DeviceState,
    properties: BTreeMap<String, String>,
    mount_points: BTreeMap<String, String>,
    avd_name: Option<String>,
    /// Client mutations for one device are serialized here.
    clients: Mutex<Vec<ClientInfo>>,
}

impl DeviceRecord {
    fn new(state: DeviceState) -> Self {
        Self {
            state,
            properties: BTreeMap::new(),
            mount_points: BTreeMap::new(),
            avd_name: None,
            clients: Mutex::new(Vec::new()),
        }
    }

    fn clients(&self) -> Vec<ClientInfo> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn snapshot(&self, serial: &str) -> DeviceSnapshot {
        self.snapshot_with(serial, self.clients())
    }

    /// Snapshot using a client list the caller already holds locked.
    fn snapshot_with(&self, serial: &str, clients: Vec<ClientInfo>) -> DeviceSnapshot {
        DeviceSnapshot {
            serial: serial.to_string(),
            state: self.state,
            properties: self.properties.clone(),
            mount_points: self.mount_points.clone(),
            clients,
            avd_name: self.avd_name.clone(),
        }
    }

    fn into_disconnected(self, serial: String) -> DeviceSnapshot {
        DeviceSnapshot {
            serial,
            state: DeviceState::Disconnected,
            properties: self.properties,
            mount_points: self.mount_points,
            clients: self.clients.into_inner().unwrap_or_else(|e| e.into_inner()),
            avd_name: self.avd_name,
        }
    }
}

/// Known devices keyed by serial.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, DeviceRecord>>,
    events: EventSender,
}

impl DeviceRegistry {
    pub fn new(events: EventSender) -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Queue `events` for the dispatcher. Callers hold the lock that
    /// covered the mutation; the send itself never blocks.
    fn publish(&self, events: &[DeviceEvent]) {
        for event in events {
            if self.events.send(event.clone()).is_err() {
                trace!("Event dispatcher gone, dropping event for {}", event.serial());
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Device list
    // ─────────────────────────────────────────────────────────

    /// Reconcile against a full device-list snapshot from the daemon.
    ///
    /// Emits `Disconnected` for vanished serials, then `Connected` for new
    /// ones, then `Changed(State)` for devices whose state differs.
    pub fn apply_device_list(&self, entries: &[DeviceListEntry]) -> Vec<DeviceEvent> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let mut events = Vec::new();

        let listed: HashSet<&str> = entries.iter().map(|e| e.serial.as_str()).collect();
        let gone: Vec<String> = devices
            .keys()
            .filter(|serial| !listed.contains(serial.as_str()))
            .cloned()
            .collect();
        for serial in gone {
            if let Some(record) = devices.remove(&serial) {
                info!("Device disconnected: {}", serial);
                events.push(DeviceEvent::Disconnected(record.into_disconnected(serial)));
            }
        }

        let mut changed = Vec::new();
        for entry in entries {
            match devices.get_mut(&entry.serial) {
                None => {
                    info!("Device connected: {} ({})", entry.serial, entry.state);
                    let record = DeviceRecord::new(entry.state);
                    events.push(DeviceEvent::Connected(record.snapshot(&entry.serial)));
                    devices.insert(entry.serial.clone(), record);
                }
                Some(record) if record.state != entry.state => {
                    info!(
                        "Device {} changed state: {} -> {}",
                        entry.serial, record.state, entry.state
                    );
                    record.state = entry.state;
                    changed.push(DeviceEvent::Changed {
                        device: record.snapshot(&entry.serial),
                        change: DeviceChange::State,
                    });
                }
                Some(_) => {}
            }
        }
        events.extend(changed);
        self.publish(&events);
        events
    }

    /// Drop every device, emitting `Disconnected` for each.
    pub fn clear(&self) -> Vec<DeviceEvent> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let events: Vec<DeviceEvent> = std::mem::take(&mut *devices)
            .into_iter()
            .map(|(serial, record)| DeviceEvent::Disconnected(record.into_disconnected(serial)))
            .collect();
        if !events.is_empty() {
            info!("Cleared {} device(s) from the registry", events.len());
        }
        self.publish(&events);
        events
    }

    // ─────────────────────────────────────────────────────────
    // Clients
    // ─────────────────────────────────────────────────────────

    /// Apply `mutate` to one device's client list; emits `Changed(ClientList)`
    /// when it reports a change.
    fn mutate_clients<T>(
        &self,
        serial: &str,
        mutate: impl FnOnce(&mut Vec<ClientInfo>) -> (T, bool),
    ) -> Option<T> {
        // The read guard excludes state changes; the client lock orders
        // concurrent client mutations of the same device.
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let record = devices.get(serial)?;
        let mut clients = record.clients.lock().unwrap_or_else(|e| e.into_inner());
        let (value, changed) = mutate(&mut clients);
        if changed {
            self.publish(&[DeviceEvent::Changed {
                device: record.snapshot_with(serial, clients.clone()),
                change: DeviceChange::ClientList,
            }]);
        }
        Some(value)
    }

    /// Add or replace a client; `false` if its device is unknown.
    pub fn add_client(&self, client: ClientInfo) -> bool {
        let serial = client.device_serial.clone();
        self.mutate_clients(&serial, |clients| {
            match clients.iter_mut().find(|c| c.pid == client.pid) {
                Some(existing) if *existing == client => ((), false),
                Some(existing) => {
                    *existing = client;
                    ((), true)
                }
                None => {
                    debug!("Client {} added on {}", client.pid, client.device_serial);
                    clients.push(client);
                    ((), true)
                }
            }
        })
        .is_some()
    }

    pub fn remove_client(&self, serial: &str, pid: u32) -> Option<ClientInfo> {
        self.mutate_clients(serial, |clients| {
            match clients.iter().position(|c| c.pid == pid) {
                Some(index) => (Some(clients.remove(index)), true),
                None => (None, false),
            }
        })
        .flatten()
    }

    /// Keep only clients whose pid is in `pids`; returns the removed ones.
    pub fn retain_clients(&self, serial: &str, pids: &[u32]) -> Vec<ClientInfo> {
        self.mutate_clients(serial, |clients| {
            let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(clients)
                .into_iter()
                .partition(|c| pids.contains(&c.pid));
            *clients = kept;
            let changed = !removed.is_empty();
            (removed, changed)
        })
        .unwrap_or_default()
    }

    /// Remove every client of `serial`; returns the removed ones.
    pub fn clear_client_list(&self, serial: &str) -> Vec<ClientInfo> {
        self.mutate_clients(serial, |clients| {
            let removed = std::mem::take(clients);
            let changed = !removed.is_empty();
            (removed, changed)
        })
        .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────
    // Device information
    // ─────────────────────────────────────────────────────────

    fn mutate_info(&self, serial: &str, mutate: impl FnOnce(&mut DeviceRecord) -> bool) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let Some(record) = devices.get_mut(serial) else {
            return false;
        };
        if mutate(record) {
            self.publish(&[DeviceEvent::Changed {
                device: record.snapshot(serial),
                change: DeviceChange::BuildInfo,
            }]);
        }
        true
    }

    /// Replace the property map; `false` if the device is unknown.
    pub fn set_properties(&self, serial: &str, properties: BTreeMap<String, String>) -> bool {
        self.mutate_info(serial, |record| {
            if record.properties == properties {
                return false;
            }
            record.properties = properties;
            true
        })
    }

    pub fn set_mount_point(&self, serial: &str, name: &str, path: impl Into<String>) -> bool {
        let path = path.into();
        self.mutate_info(serial, |record| {
            if record.mount_points.get(name) == Some(&path) {
                return false;
            }
            record.mount_points.insert(name.to_string(), path);
            true
        })
    }

    pub fn set_avd_name(&self, serial: &str, avd_name: impl Into<String>) -> bool {
        let avd_name = avd_name.into();
        self.mutate_info(serial, |record| {
            if record.avd_name.as_deref() == Some(avd_name.as_str()) {
                return false;
            }
            record.avd_name = Some(avd_name);
            true
        })
    }

    // ─────────────────────────────────────────────────────────
    // Readers
    // ─────────────────────────────────────────────────────────

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(serial, record)| record.snapshot(serial))
            .collect()
    }

    pub fn device(&self, serial: &str) -> Option<DeviceSnapshot> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(serial)
            .map(|record| record.snapshot(serial))
    }

    pub fn state(&self, serial: &str) -> Option<DeviceState> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(serial)
            .map(|record| record.state)
    }

    pub fn clients(&self, serial: &str) -> Vec<ClientInfo> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(serial)
            .map(DeviceRecord::clients)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> (DeviceRegistry, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeviceRegistry::new(tx), rx)
    }

    fn entry(serial: &str, state: DeviceState) -> DeviceListEntry {
        DeviceListEntry::new(serial, state)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_new_device_connects() {
        let (registry, mut rx) = registry();
        let events = registry.apply_device_list(&[entry("emulator-5554", DeviceState::Online)]);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], DeviceEvent::Connected(d) if d.serial == "emulator-5554" && d.is_online()));
        assert_eq!(drain(&mut rx), events);
        assert_eq!(registry.state("emulator-5554"), Some(DeviceState::Online));
    }

    #[test]
    fn test_replaying_snapshot_emits_nothing() {
        let (registry, mut rx) = registry();
        let list = [
            entry("emulator-5554", DeviceState::Online),
            entry("R58M123", DeviceState::Offline),
        ];
        assert_eq!(registry.apply_device_list(&list).len(), 2);
        assert!(registry.apply_device_list(&list).is_empty());
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_state_change_only_when_different() {
        let (registry, _rx) = registry();
        registry.apply_device_list(&[entry("R58M123", DeviceState::Offline)]);

        let events = registry.apply_device_list(&[entry("R58M123", DeviceState::Online)]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::Changed { device, change } => {
                assert_eq!(*change, DeviceChange::State);
                assert_eq!(device.state, DeviceState::Online);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_empty_snapshot_disconnects_everything() {
        let (registry, _rx) = registry();
        registry.apply_device_list(&[entry("emulator-5554", DeviceState::Online)]);

        let events = registry.apply_device_list(&[]);
        assert!(registry.is_empty());
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::Disconnected(device) => {
                assert_eq!(device.serial, "emulator-5554");
                assert_eq!(device.state, DeviceState::Disconnected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_order_disconnect_connect_change() {
        let (registry, _rx) = registry();
        registry.apply_device_list(&[
            entry("a", DeviceState::Online),
            entry("b", DeviceState::Offline),
        ]);

        let events = registry.apply_device_list(&[
            entry("b", DeviceState::Online),
            entry("c", DeviceState::Online),
        ]);
        let kinds: Vec<(String, &str)> = events
            .iter()
            .map(|e| {
                let kind = match e {
                    DeviceEvent::Connected(_) => "connected",
                    DeviceEvent::Changed { .. } => "changed",
                    DeviceEvent::Disconnected(_) => "disconnected",
                };
                (e.serial().to_string(), kind)
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("a".to_string(), "disconnected"),
                ("c".to_string(), "connected"),
                ("b".to_string(), "changed"),
            ]
        );
        let serials: Vec<String> = registry.devices().into_iter().map(|d| d.serial).collect();
        assert_eq!(serials, vec!["b", "c"]);
    }

    #[test]
    fn test_clear_disconnects_all() {
        let (registry, _rx) = registry();
        registry.apply_device_list(&[
            entry("a", DeviceState::Online),
            entry("b", DeviceState::Online),
        ]);
        let events = registry.clear();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, DeviceEvent::Disconnected(d) if d.state == DeviceState::Disconnected)));
        assert!(registry.clear().is_empty());
    }

    #[test]
    fn test_client_mutations() {
        let (registry, mut rx) = registry();
        registry.apply_device_list(&[entry("a", DeviceState::Online)]);
        drain(&mut rx);

        assert!(registry.add_client(ClientInfo::new("a", 100).with_debugger_port(8600)));
        assert!(registry.add_client(ClientInfo::new("a", 200)));
        // Same client again is not a change
        assert!(registry.add_client(ClientInfo::new("a", 200)));
        assert_eq!(drain(&mut rx).len(), 2);

        let removed = registry.retain_clients("a", &[200]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].debugger_port, Some(8600));
        assert!(registry.retain_clients("a", &[200]).is_empty());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            DeviceEvent::Changed { change: DeviceChange::ClientList, device } if device.clients.len() == 1
        ));

        assert_eq!(registry.remove_client("a", 200).map(|c| c.pid), Some(200));
        assert!(registry.remove_client("a", 200).is_none());
        assert!(registry.clear_client_list("a").is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_client_on_unknown_device() {
        let (registry, mut rx) = registry();
        assert!(!registry.add_client(ClientInfo::new("ghost", 1)));
        assert!(registry.clients("ghost").is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_last_event_matches_registry_under_concurrent_mutation() {
        use std::sync::{Arc, Barrier};

        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DeviceRegistry::new(tx));
        registry.apply_device_list(&[entry("emulator-5554", DeviceState::Online)]);

        let mut stale = 0;
        for round in 0..2000 {
            drain(&mut rx);
            let barrier = Arc::new(Barrier::new(2));
            let state = if round % 2 == 0 {
                DeviceState::Offline
            } else {
                DeviceState::Online
            };

            let monitor = {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.apply_device_list(&[entry("emulator-5554", state)]);
                })
            };
            let tracker = {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    if round % 2 == 0 {
                        registry.add_client(ClientInfo::new("emulator-5554", 1));
                    } else {
                        registry.remove_client("emulator-5554", 1);
                    }
                })
            };
            monitor.join().unwrap();
            tracker.join().unwrap();

            let last = drain(&mut rx).pop().expect("both mutations emit an event");
            if Some(last.device()) != registry.device("emulator-5554").as_ref() {
                stale += 1;
            }
        }
        assert_eq!(stale, 0, "last event disagreed with the registry");
    }

    #[test]
    fn test_disconnect_snapshot_keeps_clients() {
        let (registry, _rx) = registry();
        registry.apply_device_list(&[entry("a", DeviceState::Online)]);
        registry.add_client(ClientInfo::new("a", 100).with_debugger_port(8600));
        let events = registry.apply_device_list(&[]);
        match &events[0] {
            DeviceEvent::Disconnected(device) => assert_eq!(device.clients.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_build_info_changes() {
        let (registry, mut rx) = registry();
        registry.apply_device_list(&[entry("emulator-5554", DeviceState::Online)]);
        drain(&mut rx);

        let props = BTreeMap::from([("ro.product.model".to_string(), "Pixel".to_string())]);
        assert!(registry.set_properties("emulator-5554", props.clone()));
        assert!(registry.set_properties("emulator-5554", props));
        assert!(registry.set_mount_point("emulator-5554", "ANDROID_DATA", "/data"));
        assert!(registry.set_avd_name("emulator-5554", "Pixel_7_API_34"));
        assert!(!registry.set_avd_name("unknown", "x"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(
            |e| matches!(e, DeviceEvent::Changed { change: DeviceChange::BuildInfo, .. })
        ));

        let device = registry.device("emulator-5554").unwrap();
        assert_eq!(device.property("ro.product.model"), Some("Pixel"));
        assert_eq!(device.mount_point("ANDROID_DATA"), Some("/data"));
        assert_eq!(device.display_name(), "Pixel_7_API_34");
    }

    #[test]
    fn test_publish_after_dispatcher_gone() {
        let (registry, rx) = registry();
        drop(rx);
        let events = registry.apply_device_list(&[entry("a", DeviceState::Online)]);
        assert_eq!(events.len(), 1);
    }
}
