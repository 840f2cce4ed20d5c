//! Remote shell execution through device handles

use std::time::Duration;

use adbridge::client::test_utils::{MockAdbServer, ShellReply};
use adbridge::client::{CollectingReceiver, ShellOutputReceiver};
use adbridge::Error;

use crate::bridge_with_device;

/// Stops after the first batch.
#[derive(Default)]
struct FirstBatchOnly {
    lines: Vec<String>,
    flushed: bool,
}

impl ShellOutputReceiver for FirstBatchOnly {
    fn process_new_lines(&mut self, lines: &[String]) {
        self.lines.extend_from_slice(lines);
    }

    fn is_cancelled(&self) -> bool {
        !self.lines.is_empty()
    }

    fn flush(&mut self) {
        self.flushed = true;
    }
}

#[tokio::test]
async fn test_output_lines_and_partial_tail() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell("ls /sdcard", ShellReply::output("Alarms\r\nDCIM\r\nDownload"));
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;

    let mut receiver = CollectingReceiver::new();
    device
        .execute_shell_command("ls /sdcard", &mut receiver, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(receiver.lines(), ["Alarms", "DCIM", "Download"]);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_silent_command_is_unresponsive() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell("logcat", ShellReply::Silent);
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;

    let started = std::time::Instant::now();
    let err = device
        .execute_shell_command("logcat", &mut CollectingReceiver::new(), Duration::from_millis(200))
        .await
        .unwrap_err();
    match err {
        Error::ShellUnresponsive { command, timeout } => {
            assert_eq!(command, "logcat");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("expected ShellUnresponsive, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_receiver_cancellation() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell("dumpsys", ShellReply::output("line one\n"));
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;

    let mut receiver = FirstBatchOnly::default();
    device
        .execute_shell_command("dumpsys", &mut receiver, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(receiver.lines, vec!["line one"]);
    assert!(!receiver.flushed);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_rejected_command_keeps_daemon_message() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell("su", ShellReply::Reject("closed".to_string()));
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;

    let err = device
        .execute_shell_command("su", &mut CollectingReceiver::new(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_daemon_rejection());
    assert!(err.to_string().contains("closed"));
    bridge.shutdown().await;
}
