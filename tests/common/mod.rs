//! Shared utilities for integration tests: daemon spawning and a raw
//! TCP/TLS client that tolerates the pathological responses the daemon
//! emits on purpose.

// each test binary uses a different subset of these helpers
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use wirecraft::config::DaemonConfig;
use wirecraft::logbuf::{LogBuffer, LogEntry};
use wirecraft::net::Listener;
use wirecraft::{Daemon, Shutdown};

/// A daemon running on an ephemeral port for the duration of a test.
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub log: LogBuffer,
    _shutdown: Shutdown,
}

pub async fn start_daemon(mut config: DaemonConfig) -> TestDaemon {
    config.listener.bind_address = "127.0.0.1:0".to_string();
    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let daemon = Daemon::new(config).unwrap();
    let log = daemon.log();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = daemon.run(listener, rx).await;
    });

    TestDaemon {
        addr,
        log,
        _shutdown: shutdown,
    }
}

impl TestDaemon {
    /// GET an inline spec under the craft prefix.
    pub async fn get(&self, spec: &str) -> RawResponse {
        self.get_path(&format!("/p/{}", spec)).await
    }

    /// GET an arbitrary path.
    pub async fn get_path(&self, path: &str) -> RawResponse {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        request(&mut stream, path).await
    }

    /// Write raw bytes and collect whatever comes back until EOF.
    pub async fn raw(&self, bytes: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
        let mut out = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out)).await;
        out
    }

    /// Poll the log until `pred` holds or two seconds pass.
    pub async fn wait_for_log(&self, pred: impl Fn(&[LogEntry]) -> bool) -> Vec<LogEntry> {
        for _ in 0..200 {
            let entries = self.log.get_log();
            if pred(&entries) {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log never matched; entries: {:?}", self.log.get_log());
    }

    pub async fn last_log(&self) -> LogEntry {
        self.wait_for_log(|entries| !entries.is_empty())
            .await
            .pop()
            .unwrap()
    }
}

/// Send one GET and read one response off any async stream.
pub async fn request<S>(stream: &mut S, path: &str) -> RawResponse
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = format!("GET {} HTTP/1.1\r\nHost: wirecraft-test\r\n\r\n", path);
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    read_response(stream).await
}

/// A response read raw off the wire.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Peer closed before the declared Content-Length arrived.
    pub eof_early: bool,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Parse a response, tolerating injected bytes before the status line
/// (leading blank lines) the way lenient HTTP clients do.
pub async fn read_response<S>(stream: &mut S) -> RawResponse
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Duration::from_secs(10);
    let mut buf = Vec::new();

    // head: everything up to the first blank line after the status line
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(deadline, stream.read(&mut chunk))
            .await
            .expect("response head timed out")
            .expect("read failed");
        if n == 0 {
            panic!(
                "peer closed before a full head: {:?}",
                String::from_utf8_lossy(&buf)
            );
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_text = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head_text.lines().skip_while(|l| l.is_empty());
    let status_line = lines.next().expect("status line");
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next().unwrap_or_default();
    let status: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .unwrap_or_else(|_| panic!("bad status line: {:?}", status_line));
    let reason = parts.next().unwrap_or_default().to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut body = buf[head_end..].to_vec();
    let content_length: Option<usize> = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok());

    let mut eof_early = false;
    if let Some(want) = content_length {
        while body.len() < want {
            let mut chunk = [0u8; 16 * 1024];
            let n = tokio::time::timeout(deadline, stream.read(&mut chunk))
                .await
                .expect("response body timed out")
                .unwrap_or(0);
            if n == 0 {
                eof_early = true;
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(want);
    }

    RawResponse {
        status,
        reason,
        headers,
        body,
        eof_early,
    }
}

/// Offset one past the head terminator, skipping injected leading CRLFs.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut start = 0;
    while buf[start..].starts_with(b"\r\n") {
        start += 2;
    }
    buf[start..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| start + pos + 4)
}

/// TLS settings pointing at the checked-in test certificate.
pub fn test_tls(immediate: bool, not_after_connect: bool) -> wirecraft::config::TlsSettings {
    let data = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data");
    wirecraft::config::TlsSettings {
        certs: vec![wirecraft::config::CertEntry {
            sni: "*".to_string(),
            cert_path: data.join("cert.pem"),
            key_path: data.join("key.pem"),
        }],
        cn: Some("test.wirecraft.local".to_string()),
        immediate,
        not_after_connect,
    }
}

/// Client-side TLS connector that accepts any server certificate; the
/// tests pin behavior, not trust.
pub fn insecure_connector() -> tokio_rustls::TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAll { provider }))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAll {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAll {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
