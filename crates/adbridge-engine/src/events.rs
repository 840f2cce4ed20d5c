//! Device change fan-out
//!
//! Registry mutations push [`DeviceEvent`]s into an unbounded channel. A
//! single dispatcher task drains it, calls every registered
//! [`DeviceChangeListener`] in registration order, then rebroadcasts the
//! event for async subscribers. Listeners run on the dispatcher task with no
//! registry lock held, so they may freely read the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use adbridge_core::prelude::*;
use adbridge_core::{DeviceChange, DeviceEvent, DeviceSnapshot};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the async subscriber channel; slow subscribers observe `Lagged`.
pub const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Callback interface for device changes. Every method defaults to a no-op.
pub trait DeviceChangeListener: Send + Sync {
    fn device_connected(&self, _device: &DeviceSnapshot) {}

    fn device_changed(&self, _device: &DeviceSnapshot, _change: DeviceChange) {}

    fn device_disconnected(&self, _device: &DeviceSnapshot) {}
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Registered listeners, cloned out before each delivery.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn DeviceChangeListener>)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("count", &self.len())
            .finish()
    }
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DeviceChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn DeviceChangeListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Deliver one event to every listener.
    pub fn notify(&self, event: &DeviceEvent) {
        for listener in self.snapshot() {
            match event {
                DeviceEvent::Connected(device) => listener.device_connected(device),
                DeviceEvent::Changed { device, change } => listener.device_changed(device, *change),
                DeviceEvent::Disconnected(device) => listener.device_disconnected(device),
            }
        }
    }
}

/// Sending half used by the registry.
pub type EventSender = mpsc::UnboundedSender<DeviceEvent>;

/// Spawn the dispatcher.
///
/// It exits once every [`EventSender`] is dropped, or when `shutdown_rx`
/// flips to `true`, after delivering whatever is already queued.
pub fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
    listeners: Arc<ListenerSet>,
    broadcast_tx: broadcast::Sender<DeviceEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deliver = |event: DeviceEvent| {
            trace!("Dispatching {} for {}", event_kind(&event), event.serial());
            listeners.notify(&event);
            // No subscribers is fine
            let _ = broadcast_tx.send(event);
        };

        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(event) => deliver(event),
                    None => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        while let Ok(event) = rx.try_recv() {
                            deliver(event);
                        }
                        break;
                    }
                }
            }
        }
        debug!("Device event dispatcher exiting");
    })
}

fn event_kind(event: &DeviceEvent) -> &'static str {
    match event {
        DeviceEvent::Connected(_) => "connected",
        DeviceEvent::Changed { change, .. } => match change {
            DeviceChange::State => "state change",
            DeviceChange::ClientList => "client list change",
            DeviceChange::BuildInfo => "build info change",
        },
        DeviceEvent::Disconnected(_) => "disconnected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbridge_core::DeviceState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl DeviceChangeListener for RecordingListener {
        fn device_connected(&self, device: &DeviceSnapshot) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("connected {}", device.serial));
        }

        fn device_changed(&self, device: &DeviceSnapshot, change: DeviceChange) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("changed {} {:?}", device.serial, change));
        }

        fn device_disconnected(&self, device: &DeviceSnapshot) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("disconnected {}", device.serial));
        }
    }

    /// Only cares about disconnects.
    struct DisconnectCounter(AtomicU64);

    impl DeviceChangeListener for DisconnectCounter {
        fn device_disconnected(&self, _device: &DeviceSnapshot) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(serial: &str) -> DeviceSnapshot {
        DeviceSnapshot::new(serial, DeviceState::Online)
    }

    #[test]
    fn test_add_remove_listener() {
        let set = ListenerSet::new();
        let a = set.add(Arc::new(RecordingListener::default()));
        let b = set.add(Arc::new(RecordingListener::default()));
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);
        assert!(set.remove(a));
        assert!(!set.remove(a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_notify_routes_by_event_kind() {
        let set = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::default());
        let counter = Arc::new(DisconnectCounter(AtomicU64::new(0)));
        set.add(recorder.clone());
        set.add(counter.clone());

        set.notify(&DeviceEvent::Connected(snapshot("a")));
        set.notify(&DeviceEvent::Changed {
            device: snapshot("a"),
            change: DeviceChange::ClientList,
        });
        set.notify(&DeviceEvent::Disconnected(snapshot("a")));

        assert_eq!(
            recorder.seen(),
            vec!["connected a", "changed a ClientList", "disconnected a"]
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_preserves_order_and_rebroadcasts() {
        let listeners = Arc::new(ListenerSet::new());
        let recorder = Arc::new(RecordingListener::default());
        listeners.add(recorder.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast_tx, mut sub) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_dispatcher(rx, listeners, broadcast_tx, shutdown_rx);

        tx.send(DeviceEvent::Connected(snapshot("a"))).unwrap();
        tx.send(DeviceEvent::Connected(snapshot("b"))).unwrap();
        tx.send(DeviceEvent::Disconnected(snapshot("a"))).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            recorder.seen(),
            vec!["connected a", "connected b", "disconnected a"]
        );
        assert!(matches!(sub.recv().await.unwrap(), DeviceEvent::Connected(d) if d.serial == "a"));
        assert!(matches!(sub.recv().await.unwrap(), DeviceEvent::Connected(d) if d.serial == "b"));
        assert!(matches!(sub.recv().await.unwrap(), DeviceEvent::Disconnected(d) if d.serial == "a"));
    }

    #[tokio::test]
    async fn test_dispatcher_drains_queue_on_shutdown() {
        let listeners = Arc::new(ListenerSet::new());
        let recorder = Arc::new(RecordingListener::default());
        listeners.add(recorder.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _sub) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(DeviceEvent::Disconnected(snapshot("a"))).unwrap();
        shutdown_tx.send(true).unwrap();
        let handle = spawn_dispatcher(rx, listeners, broadcast_tx, shutdown_rx);
        handle.await.unwrap();

        assert_eq!(recorder.seen(), vec!["disconnected a"]);
        // The sender outlived the dispatcher
        drop(tx);
    }
}
