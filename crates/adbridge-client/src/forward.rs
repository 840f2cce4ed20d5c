//! Port forwarding through the daemon

use adbridge_core::prelude::*;
use adbridge_core::ForwardRule;

use crate::protocol::parse_forward_list;
use crate::transport::{AdbConnection, AdbEndpoint};

/// Forward local TCP `local_port` to `remote_port` on `serial`.
pub async fn create_forward(
    endpoint: &AdbEndpoint,
    serial: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<()> {
    create_forward_spec(
        endpoint,
        serial,
        &format!("tcp:{local_port}"),
        &format!("tcp:{remote_port}"),
    )
    .await
}

/// Forward with explicit specs such as `tcp:8600` and `jdwp:1234`.
pub async fn create_forward_spec(
    endpoint: &AdbEndpoint,
    serial: &str,
    local: &str,
    remote: &str,
) -> Result<()> {
    let mut conn = AdbConnection::open(endpoint).await?;
    conn.send_request(&format!("host-serial:{serial}:forward:{local};{remote}"))
        .await?;
    info!("Forwarding {} -> {} on {}", local, remote, serial);
    conn.close().await;
    Ok(())
}

/// Remove the forward listening on local TCP `local_port`.
pub async fn remove_forward(endpoint: &AdbEndpoint, serial: &str, local_port: u16) -> Result<()> {
    let mut conn = AdbConnection::open(endpoint).await?;
    conn.send_request(&format!("host-serial:{serial}:killforward:tcp:{local_port}"))
        .await?;
    info!("Removed forward tcp:{} on {}", local_port, serial);
    conn.close().await;
    Ok(())
}

/// Every forward the daemon currently holds, across all devices.
pub async fn list_forwards(endpoint: &AdbEndpoint) -> Result<Vec<ForwardRule>> {
    let mut conn = AdbConnection::open(endpoint).await?;
    conn.send_request("host:list-forward").await?;
    let payload = conn.read_frame().await?;
    conn.close().await;
    Ok(parse_forward_list(&String::from_utf8_lossy(&payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockAdbServer;

    #[tokio::test]
    async fn test_create_list_remove_forward() {
        let server = MockAdbServer::start().await;
        server.set_devices(&[("emulator-5554", "device")]);
        let endpoint = server.endpoint();

        create_forward(&endpoint, "emulator-5554", 8600, 5005)
            .await
            .unwrap();
        assert!(server
            .requests()
            .contains(&"host-serial:emulator-5554:forward:tcp:8600;tcp:5005".to_string()));

        let rules = list_forwards(&endpoint).await.unwrap();
        assert_eq!(
            rules,
            vec![ForwardRule {
                serial: "emulator-5554".to_string(),
                local: "tcp:8600".to_string(),
                remote: "tcp:5005".to_string(),
            }]
        );

        remove_forward(&endpoint, "emulator-5554", 8600).await.unwrap();
        assert!(list_forwards(&endpoint).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_forward_is_rejected() {
        let server = MockAdbServer::start().await;
        server.set_devices(&[("emulator-5554", "device")]);
        let err = remove_forward(&server.endpoint(), "emulator-5554", 9999)
            .await
            .unwrap_err();
        match err {
            Error::AdbRejected { message } => assert!(message.contains("tcp:9999")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
