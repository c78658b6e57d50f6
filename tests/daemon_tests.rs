//! End-to-end tests driving the daemon over real sockets.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use wirecraft::config::DaemonConfig;
use wirecraft::logbuf::LogKind;
use wirecraft::Daemon;

mod common;

fn entry_response_msg(entry: &wirecraft::LogEntry) -> String {
    entry
        .field("response")
        .and_then(|r| r.get("msg"))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_binarydata() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let r = d.get(r"200:b'\xf0'").await;
    assert_eq!(r.status, 200);
    assert_eq!(r.body, vec![0xf0]);

    let entry = d.last_log().await;
    assert_eq!(entry.kind, LogKind::Response);
}

#[tokio::test]
async fn test_sizelimit() {
    let mut config = DaemonConfig::default();
    config.craft.size_limit = 1024 * 1024;
    let d = common::start_daemon(config).await;

    let r = d.get("200:b@1g").await;
    assert_eq!(r.status, 800);
    assert!(r.body_text().contains("too large"));

    let entry = d.last_log().await;
    assert_eq!(entry.kind, LogKind::Error);
    assert!(entry_response_msg(&entry).contains("too large"));
}

#[tokio::test]
async fn test_disconnect() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let r = d.get("202:b@100k:d200").await;
    assert_eq!(r.status, 202);
    // disconnected at byte 200 of a 100k body: eof, not completion
    assert!(r.eof_early);
    assert!(r.body.len() < 100 * 1024);
}

#[tokio::test]
async fn test_nohang() {
    let mut config = DaemonConfig::default();
    config.craft.nohang = true;
    let d = common::start_daemon(config).await;

    let r = d.get("200:p0,0").await;
    assert_eq!(r.status, 800);

    let entry = d.last_log().await;
    assert!(entry_response_msg(&entry).contains("Pauses have been disabled"));
}

#[tokio::test]
async fn test_nocraft() {
    let mut config = DaemonConfig::default();
    config.craft.nocraft = true;
    let d = common::start_daemon(config).await;

    let r = d.get(r"200:b'\xf0'").await;
    assert_eq!(r.status, 800);
    assert!(r.body_text().contains("Crafting disabled"));
}

#[tokio::test]
async fn test_parserr() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let r = d.get("400:msg,b:").await;
    assert_eq!(r.status, 800);
}

#[tokio::test]
async fn test_static() {
    let sandbox = tempfile::tempdir().unwrap();
    std::fs::write(sandbox.path().join("file"), "testfile\n").unwrap();

    let mut config = DaemonConfig::default();
    config.craft.sandbox_root = Some(sandbox.path().to_path_buf());
    let d = common::start_daemon(config).await;

    let r = d.get("200:b<file").await;
    assert_eq!(r.status, 200);
    assert_eq!(r.body_text().trim(), "testfile");
}

#[tokio::test]
async fn test_source_access_denied() {
    let sandbox = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::default();
    config.craft.sandbox_root = Some(sandbox.path().to_path_buf());
    let d = common::start_daemon(config).await;

    for spec in ["200:b</foo", "200:b<../../etc/passwd"] {
        let r = d.get(spec).await;
        assert_eq!(r.status, 800);
        assert!(r.body_text().contains("File access denied"));
    }
}

#[tokio::test]
async fn test_access_denied() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let r = d.get("=nonexistent").await;
    assert_eq!(r.status, 800);
}

#[tokio::test]
async fn test_anchor() {
    let mut config = DaemonConfig::default();
    config.anchors.push(wirecraft::config::AnchorConfig {
        pattern: "/anchor".into(),
        spec: "202".into(),
    });
    let d = common::start_daemon(config).await;

    let r = d.get_path("/anchor/foo").await;
    assert_eq!(r.status, 202);

    let r = d.get_path("/nothing/here").await;
    assert_eq!(r.status, 800);
    assert!(r.body_text().contains("Not found"));
}

#[tokio::test]
async fn test_logs() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    d.log.clear();

    let r = d.get("202:da").await;
    assert_eq!(r.status, 202);
    let entries = d.wait_for_log(|e| !e.is_empty()).await;
    assert_eq!(entries.len(), 1);

    d.log.clear();
    assert!(d.log.get_log().is_empty());
}

#[tokio::test]
async fn test_preline() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let r = d.get(r"200:i0,'\r\n'").await;
    // injected CRLF before the status line; lenient clients skip it
    assert_eq!(r.status, 200);
}

#[tokio::test]
async fn test_pause_after_body_still_completes() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let r = d.get("200:b'xx':pa,1").await;
    assert_eq!(r.status, 200);
    assert_eq!(r.body, b"xx");
    assert!(!r.eof_early);
}

#[tokio::test]
async fn test_hexdump_does_not_disturb_traffic() {
    let mut config = DaemonConfig::default();
    config.craft.hexdump = true;
    let d = common::start_daemon(config).await;
    let r = d.get(r"200:b'\xf0'").await;
    assert_eq!(r.status, 200);
    assert_eq!(r.body, vec![0xf0]);
}

#[tokio::test]
async fn test_invalid_first_line() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let out = d.raw(b"foo\n\n\n").await;
    assert!(out.is_empty(), "no response expected, got {:?}", out);

    let entries = d
        .wait_for_log(|e| e.iter().any(|entry| entry.kind == LogKind::Error))
        .await;
    let entry = entries.last().unwrap();
    assert!(entry.msg().unwrap_or_default().contains("foo"));
}

#[tokio::test]
async fn test_invalid_content_length() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let out = d
        .raw(b"GET /p/200 HTTP/1.1\r\nContent-Length: foo\r\n\r\n")
        .await;
    assert!(out.is_empty());

    let entries = d
        .wait_for_log(|e| e.iter().any(|entry| entry.kind == LogKind::Error))
        .await;
    let entry = entries.last().unwrap();
    assert!(entry
        .msg()
        .unwrap_or_default()
        .contains("Unparseable Content Length"));
}

#[tokio::test]
async fn test_invalid_headers() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let out = d.raw(b"GET /p/200 HTTP/1.1\r\n\t: foo\r\n\r\n").await;
    assert!(out.is_empty());

    let entries = d
        .wait_for_log(|e| e.iter().any(|entry| entry.kind == LogKind::Error))
        .await;
    let entry = entries.last().unwrap();
    assert!(entry.msg().unwrap_or_default().contains("Invalid headers"));
}

#[tokio::test]
async fn test_http2_rejected() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let out = d.raw(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await;
    let text = String::from_utf8_lossy(&out);
    assert!(text.starts_with("HTTP/1.1 800"));
}

#[tokio::test]
async fn test_proxy_self_loop() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let r = d.get_path("http://foo.com/p/202").await;
    assert_eq!(r.status, 202);
}

#[tokio::test]
async fn test_connect_not_after_connect_stays_plain() {
    let mut config = DaemonConfig::default();
    config.listener.tls = Some(common::test_tls(false, true));
    let d = common::start_daemon(config).await;

    let mut stream = TcpStream::connect(d.addr).await.unwrap();
    stream
        .write_all(b"CONNECT foo.com:80 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let established = common::read_response(&mut stream).await;
    assert_eq!(established.status, 200);

    // tunnel stays plaintext: the inner request goes straight through
    let r = common::request(&mut stream, "/p/202").await;
    assert_eq!(r.status, 202);
}

#[tokio::test]
async fn test_connect_upgrades_tunnel_to_tls() {
    let mut config = DaemonConfig::default();
    config.listener.tls = Some(common::test_tls(false, false));
    let d = common::start_daemon(config).await;

    let mut stream = TcpStream::connect(d.addr).await.unwrap();
    stream
        .write_all(b"CONNECT foo.com:80 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let established = common::read_response(&mut stream).await;
    assert_eq!(established.status, 200);

    let connector = common::insecure_connector();
    let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, stream).await.unwrap();
    let r = common::request(&mut tls, "/p/202").await;
    assert_eq!(r.status, 202);
}

#[tokio::test]
async fn test_timeout() {
    let mut config = DaemonConfig::default();
    config.timeouts.request_ms = 100;
    let d = common::start_daemon(config).await;

    let mut stream = TcpStream::connect(d.addr).await.unwrap();
    stream.write_all(b"GET /p/202 HTT").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let entries = d
        .wait_for_log(|e| e.iter().any(|entry| entry.kind == LogKind::Timeout))
        .await;
    assert!(entries.iter().any(|e| e.kind == LogKind::Timeout));
}

#[tokio::test]
async fn test_keep_alive_serves_multiple_specs() {
    let d = common::start_daemon(DaemonConfig::default()).await;
    let mut stream = TcpStream::connect(d.addr).await.unwrap();
    let first = common::request(&mut stream, "/p/200:b'one'").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"one");
    let second = common::request(&mut stream, "/p/201:b'two'").await;
    assert_eq!(second.status, 201);
    assert_eq!(second.body, b"two");
}

#[tokio::test]
async fn test_rejection_keeps_connection_usable() {
    let mut config = DaemonConfig::default();
    config.craft.nohang = true;
    let d = common::start_daemon(config).await;

    let mut stream = TcpStream::connect(d.addr).await.unwrap();
    let rejected = common::request(&mut stream, "/p/200:p0,5").await;
    assert_eq!(rejected.status, 800);
    let served = common::request(&mut stream, "/p/200:b'ok'").await;
    assert_eq!(served.status, 200);
}

#[tokio::test]
async fn test_embedding_log_surface() {
    let daemon = Daemon::new(DaemonConfig::default()).unwrap();
    assert!(daemon.get_log().is_empty());

    let mut fields = serde_json::Map::new();
    fields.insert("s".into(), serde_json::json!("foo"));
    let id = daemon.add_log(fields);
    assert!(daemon.log_by_id(id).is_some());
    assert_eq!(daemon.get_log().len(), 1);

    daemon.clear_log();
    assert!(daemon.get_log().is_empty());
}
