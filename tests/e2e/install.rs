//! Package install and uninstall against the mock daemon

use adbridge::client::test_utils::{MockAdbServer, ShellReply};
use adbridge::Error;

use crate::bridge_with_device;

fn write_apk(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, [0x50, 0x4b, 0x03, 0x04, 0x14, 0x00]).unwrap();
    path
}

#[tokio::test]
async fn test_install_success_removes_staged_file() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell("pm install", ShellReply::output("Success\n"));
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;
    let temp = tempfile::tempdir().unwrap();
    let apk = write_apk(&temp, "app.apk");

    device.install_package(&apk, false).await.unwrap();

    assert_eq!(
        server.file("/data/local/tmp/app.apk").as_deref(),
        Some(&[0x50, 0x4b, 0x03, 0x04, 0x14, 0x00][..])
    );
    assert_eq!(
        server.shell_commands(),
        vec![
            "pm install \"/data/local/tmp/app.apk\"",
            "rm /data/local/tmp/app.apk",
        ]
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_push_failure_runs_nothing_on_device() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.fail_pushes(Some("Read-only file system"));
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;
    let temp = tempfile::tempdir().unwrap();
    let apk = write_apk(&temp, "app.apk");

    let err = device.install_package(&apk, true).await.unwrap_err();
    match err {
        Error::InstallFailed { reason } => assert!(reason.contains("Read-only file system")),
        other => panic!("expected InstallFailed, got {other:?}"),
    }
    assert!(server.shell_commands().is_empty());
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_install_failure_reports_reason_and_cleans_up() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell(
        "pm install -r",
        ShellReply::output("\tpkg: /data/local/tmp/app.apk\nFailure [INSTALL_FAILED_UPDATE_INCOMPATIBLE]\n"),
    );
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;
    let temp = tempfile::tempdir().unwrap();
    let apk = write_apk(&temp, "app.apk");

    let err = device.install_package(&apk, true).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InstallFailed { ref reason } if reason == "INSTALL_FAILED_UPDATE_INCOMPATIBLE"
    ));
    let removals: Vec<String> = server
        .shell_commands()
        .into_iter()
        .filter(|c| c.starts_with("rm "))
        .collect();
    assert_eq!(removals, vec!["rm /data/local/tmp/app.apk"]);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_uninstall_package() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell("pm uninstall com.example.app", ShellReply::output("Success\n"));
    server.on_shell(
        "pm uninstall com.example.missing",
        ShellReply::output("Failure [DELETE_FAILED_INTERNAL_ERROR]\n"),
    );
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;

    device.uninstall_package("com.example.app").await.unwrap();
    let err = device
        .uninstall_package("com.example.missing")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstallFailed { .. }));
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_staged_install_steps() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.on_shell("pm install", ShellReply::output("Success\n"));
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;
    let temp = tempfile::tempdir().unwrap();
    let apk = write_apk(&temp, "notes-debug.apk");

    let remote = device.sync_package_to_device(&apk).await.unwrap();
    assert_eq!(remote, "/data/local/tmp/notes-debug.apk");
    device.install_remote_package(&remote, false).await.unwrap();
    device.remove_remote_package(&remote).await.unwrap();

    assert_eq!(
        server.shell_commands(),
        vec![
            "pm install \"/data/local/tmp/notes-debug.apk\"",
            "rm /data/local/tmp/notes-debug.apk",
        ]
    );
    bridge.shutdown().await;
}
