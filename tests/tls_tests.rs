//! TLS-terminated daemon tests.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use wirecraft::config::DaemonConfig;
use wirecraft::logbuf::LogKind;

mod common;

#[tokio::test]
async fn test_tls_serves_specs_and_logs_cipher() {
    let mut config = DaemonConfig::default();
    config.listener.tls = Some(common::test_tls(true, false));
    let d = common::start_daemon(config).await;

    let tcp = TcpStream::connect(d.addr).await.unwrap();
    let connector = common::insecure_connector();
    let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();

    let r = common::request(&mut tls, "/p/202").await;
    assert_eq!(r.status, 202);

    let entry = d.last_log().await;
    assert_eq!(entry.kind, LogKind::Response);
    let cipher = entry.field("cipher").expect("cipher logged");
    let bits = cipher.get(1).and_then(|v| v.as_u64()).unwrap();
    assert!(bits > 0, "cipher strength should be positive: {:?}", cipher);
    // the configured CN rides along on TLS log entries
    assert_eq!(
        entry.field("cn").and_then(|v| v.as_str()),
        Some("test.wirecraft.local")
    );
}

#[tokio::test]
async fn test_garbage_instead_of_client_hello() {
    let mut config = DaemonConfig::default();
    config.listener.tls = Some(common::test_tls(true, false));
    let d = common::start_daemon(config).await;

    let mut stream = TcpStream::connect(d.addr).await.unwrap();
    stream.write_all(b"\0\0\0\0").await.unwrap();
    stream.flush().await.unwrap();
    drop(stream);

    let entries = d
        .wait_for_log(|e| e.iter().any(|entry| entry.kind == LogKind::Error))
        .await;
    let entry = entries.last().unwrap();
    assert!(entry.msg().unwrap_or_default().contains("TLS"));
}

#[tokio::test]
async fn test_sni_selects_certificate() {
    let mut config = DaemonConfig::default();
    config.listener.tls = Some(common::test_tls(true, false));
    let d = common::start_daemon(config).await;

    // wildcard entry serves any SNI, including the configured test name
    let tcp = TcpStream::connect(d.addr).await.unwrap();
    let connector = common::insecure_connector();
    let name = rustls::pki_types::ServerName::try_from("test.wirecraft.local").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();

    let r = common::request(&mut tls, "/p/200").await;
    assert_eq!(r.status, 200);

    let entry = d.last_log().await;
    assert_eq!(
        entry.field("sni").and_then(|v| v.as_str()),
        Some("test.wirecraft.local")
    );
}
