//! Device and client tracking through a running bridge

use std::time::Duration;

use adbridge::client::test_utils::{MockAdbServer, ShellReply};
use adbridge::core::{DeviceChange, DeviceState};
use adbridge::engine::MonitorState;
use adbridge::{Bridge, DeviceEvent};

use crate::{next_event, test_settings, wait_for_device, wait_for_event, RecordingListener};

// ─────────────────────────────────────────────────────────
// Device List
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_then_disconnect() {
    let server = MockAdbServer::start().await;
    let bridge = Bridge::start(test_settings(&server)).unwrap();
    let listener = RecordingListener::new();
    bridge.add_device_change_listener(listener.clone());
    let mut events = bridge.subscribe();

    server.set_devices(&[("emulator-5554", "device")]);
    let event = next_event(&mut events).await;
    assert!(matches!(event, DeviceEvent::Connected(ref d) if d.serial == "emulator-5554"));

    server.set_devices(&[]);
    let event = next_event(&mut events).await;
    match event {
        DeviceEvent::Disconnected(device) => {
            assert_eq!(device.serial, "emulator-5554");
            assert_eq!(device.state, DeviceState::Disconnected);
        }
        other => panic!("expected a disconnect, got {other:?}"),
    }
    assert!(bridge.devices().is_empty());
    assert_eq!(
        listener.seen(),
        vec!["connected emulator-5554", "disconnected emulator-5554"]
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_state_change_reported_once() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("R58M123", "offline")]);
    let bridge = Bridge::start(test_settings(&server)).unwrap();
    let mut events = bridge.subscribe();
    wait_for_event(&mut events, |e| matches!(e, DeviceEvent::Connected(_))).await;
    assert!(bridge.device("R58M123").unwrap().is_offline());

    server.set_devices(&[("R58M123", "device")]);
    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        DeviceEvent::Changed { change: DeviceChange::State, ref device } if device.is_online()
    ));

    // Same snapshot again: nothing new
    server.set_devices(&[("R58M123", "device")]);
    let quiet = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(quiet.is_err());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_removed_listener_is_not_called() {
    let server = MockAdbServer::start().await;
    let bridge = Bridge::start(test_settings(&server)).unwrap();
    let kept = RecordingListener::new();
    let removed = RecordingListener::new();
    bridge.add_device_change_listener(kept.clone());
    let id = bridge.add_device_change_listener(removed.clone());
    assert!(bridge.remove_device_change_listener(id));

    let mut events = bridge.subscribe();
    server.set_devices(&[("emulator-5554", "device")]);
    next_event(&mut events).await;

    assert_eq!(kept.seen(), vec!["connected emulator-5554"]);
    assert!(removed.seen().is_empty());
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_tracking_loss_clears_and_reconnects() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    let bridge = Bridge::start(test_settings(&server)).unwrap();
    let mut events = bridge.subscribe();
    wait_for_event(&mut events, |e| matches!(e, DeviceEvent::Connected(_))).await;

    server.drop_device_tracking();
    let gone = next_event(&mut events).await;
    assert!(matches!(gone, DeviceEvent::Disconnected(ref d) if d.serial == "emulator-5554"));

    let back = next_event(&mut events).await;
    assert!(matches!(back, DeviceEvent::Connected(ref d) if d.serial == "emulator-5554"));
    assert_eq!(bridge.monitor_state(), MonitorState::Connected);

    bridge.shutdown().await;
    assert_eq!(bridge.monitor_state(), MonitorState::Stopped);
}

// ─────────────────────────────────────────────────────────
// Clients
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_clients_get_descriptions_and_ports() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.set_jdwp_pids("emulator-5554", &[4242]);
    server.on_shell(
        "cat /proc/4242/cmdline",
        ShellReply::output("com.example.notes\0"),
    );
    let mut settings = test_settings(&server);
    settings.monitor.track_clients = true;
    settings.monitor.debug_port_base = 8700;

    let bridge = Bridge::start(settings).unwrap();
    let mut events = bridge.subscribe();
    let device = wait_for_device(&bridge, "emulator-5554").await;
    wait_for_event(&mut events, |e| {
        matches!(e, DeviceEvent::Changed { change: DeviceChange::ClientList, device } if !device.clients.is_empty())
    })
    .await;

    assert!(device.has_clients());
    assert_eq!(device.client_name(4242).as_deref(), Some("com.example.notes"));
    assert_eq!(device.clients()[0].debugger_port, Some(8700));
    assert_eq!(bridge.debugger_ports(), vec![8700]);

    server.set_jdwp_pids("emulator-5554", &[]);
    wait_for_event(&mut events, |e| {
        matches!(e, DeviceEvent::Changed { change: DeviceChange::ClientList, device } if device.clients.is_empty())
    })
    .await;
    assert!(bridge.debugger_ports().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_device_info_collected_on_connect() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("R58M123", "device")]);
    server.on_shell(
        "getprop",
        ShellReply::output("[ro.build.version.sdk]: [34]\r\n[ro.product.model]: [Pixel 8]\r\n"),
    );
    server.on_shell("echo $EXTERNAL_STORAGE", ShellReply::output("/sdcard\r\n"));
    let mut settings = test_settings(&server);
    settings.monitor.query_device_info = true;

    let bridge = Bridge::start(settings).unwrap();
    let mut events = bridge.subscribe();
    let device = wait_for_device(&bridge, "R58M123").await;
    wait_for_event(&mut events, |e| {
        matches!(e, DeviceEvent::Changed { change: DeviceChange::BuildInfo, device } if device.mount_point("EXTERNAL_STORAGE").is_some())
    })
    .await;

    assert_eq!(device.property("ro.build.version.sdk").as_deref(), Some("34"));
    assert_eq!(device.mount_point("EXTERNAL_STORAGE").as_deref(), Some("/sdcard"));
    assert_eq!(device.snapshot().unwrap().display_name(), "Pixel 8");
    bridge.shutdown().await;
}
