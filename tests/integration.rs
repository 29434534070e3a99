//! End-to-end tests: a real `tokio::net::TcpListener`-backed server driven
//! by the crate's own blocking test client (plus raw sockets for the PROXY
//! scenarios, which the client intentionally doesn't speak).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use smtp_server::client::SmtpClient;
use smtp_server::handler::{AcceptAllHandler, MessageEnvelope, MessageHandler};
use smtp_server::proxy::ProxyMode;
use smtp_server::wire::Reply;
use smtp_server::{Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Records every delivered envelope so tests can assert on what the
/// handler actually saw.
#[derive(Default)]
struct RecordingHandler {
    count: AtomicUsize,
    last: std::sync::Mutex<Option<MessageEnvelope>>,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle_message(&self, envelope: MessageEnvelope) -> Reply {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(envelope);
        Reply::new(250, "OK")
    }
}

/// Accepts any server certificate. Test-only: the self-signed cert `rcgen`
/// mints for this test has no trust root a normal client verifier could
/// chain to.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

async fn spawn_server(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> (smtp_server::ServerHandle, SocketAddr) {
    let handle = Server::new(config, handler)
        .spawn()
        .await
        .expect("server should bind to an ephemeral port");
    let addr = handle.local_addr();
    (handle, addr)
}

#[tokio::test]
async fn s1_minimal_delivery() {
    let recorder = Arc::new(RecordingHandler::default());
    let config = ServerConfig::builder().bind_address("127.0.0.1".into()).port(0).build();
    let (handle, addr) = spawn_server(config, recorder.clone()).await;

    let client_task = tokio::task::spawn_blocking(move || {
        let mut client = SmtpClient::connect(addr).expect("connect");
        client.command("EHLO a").expect("ehlo");
        client.command("MAIL FROM:<s@x>").expect("mail");
        client.command("RCPT TO:<r@y>").expect("rcpt");
        let reply = client.send_data(b"hi\r\n").expect("data");
        assert!(reply.is_success());
        client.quit().expect("quit");
    });
    client_task.await.expect("client task");

    assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
    let envelope = recorder.last.lock().unwrap().clone().expect("an envelope was recorded");
    assert_eq!(envelope.from, "s@x");
    assert_eq!(envelope.recipients, vec!["r@y".to_string()]);
    assert_eq!(envelope.data, b"hi\r\n");

    handle.shutdown().await;
}

#[tokio::test]
async fn s2_dot_stuffing_round_trips() {
    let recorder = Arc::new(RecordingHandler::default());
    let config = ServerConfig::builder().bind_address("127.0.0.1".into()).port(0).build();
    let (handle, addr) = spawn_server(config, recorder.clone()).await;

    let client_task = tokio::task::spawn_blocking(move || {
        let mut client = SmtpClient::connect(addr).expect("connect");
        client.command("EHLO a").expect("ehlo");
        client.command("MAIL FROM:<s@x>").expect("mail");
        client.command("RCPT TO:<r@y>").expect("rcpt");
        client.send_data(b".stuffed\r\n").expect("data");
        client.quit().expect("quit");
    });
    client_task.await.expect("client task");

    let envelope = recorder.last.lock().unwrap().clone().expect("an envelope was recorded");
    assert_eq!(envelope.data, b".stuffed\r\n");

    handle.shutdown().await;
}

#[tokio::test]
async fn bdat_accumulates_chunks_until_last() {
    let recorder = Arc::new(RecordingHandler::default());
    let config = ServerConfig::builder().bind_address("127.0.0.1".into()).port(0).build();
    let (handle, addr) = spawn_server(config, recorder.clone()).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut greeting = [0u8; 256];
    let _ = stream.read(&mut greeting).await.unwrap();

    async fn expect_reply(stream: &mut TcpStream, needle: &str) {
        let mut buf = [0u8; 512];
        let n = stream.read(buf.as_mut()).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains(needle), "expected {:?} in {:?}", needle, text);
    }

    stream.write_all(b"EHLO a\r\n").await.unwrap();
    expect_reply(&mut stream, "250").await;
    stream.write_all(b"MAIL FROM:<s@x>\r\n").await.unwrap();
    expect_reply(&mut stream, "250").await;
    stream.write_all(b"RCPT TO:<r@y>\r\n").await.unwrap();
    expect_reply(&mut stream, "250").await;

    stream.write_all(b"BDAT 5\r\nhello").await.unwrap();
    expect_reply(&mut stream, "250").await;
    stream.write_all(b"BDAT 6 LAST\r\n world").await.unwrap();
    expect_reply(&mut stream, "250").await;

    let envelope = recorder.last.lock().unwrap().clone().expect("an envelope was recorded");
    assert_eq!(envelope.data, b"hello world");

    handle.shutdown().await;
}

/// A DATA payload that would exceed `max_message_size` gets a `552` and the
/// connection closes rather than falling back to command mode — otherwise
/// the remaining body lines the client is still sending would be misread as
/// SMTP commands (see DESIGN.md).
#[tokio::test]
async fn oversized_data_payload_gets_552_and_closes_session() {
    let config = ServerConfig::builder()
        .bind_address("127.0.0.1".into())
        .port(0)
        .max_message_size(8)
        .build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = [0u8; 512];
    let _ = stream.read(&mut buf).await.unwrap();

    stream.write_all(b"EHLO a\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"MAIL FROM:<s@x>\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"RCPT TO:<r@y>\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"DATA\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("354"));

    stream
        .write_all(b"this line alone is already longer than the limit\r\n")
        .await
        .unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("552"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "expected the socket to close, got: {:?}", rest);

    handle.shutdown().await;
}

/// Same as above for BDAT: an oversized chunk is rejected before it's read
/// off the wire at all, so the connection must close rather than return to
/// command mode with the client's declared bytes still unread.
#[tokio::test]
async fn oversized_bdat_chunk_gets_552_and_closes_session() {
    let config = ServerConfig::builder()
        .bind_address("127.0.0.1".into())
        .port(0)
        .max_message_size(4)
        .build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = [0u8; 512];
    let _ = stream.read(&mut buf).await.unwrap();

    stream.write_all(b"EHLO a\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"MAIL FROM:<s@x>\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"RCPT TO:<r@y>\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();

    stream.write_all(b"BDAT 10 LAST\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("552"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "expected the socket to close, got: {:?}", rest);

    handle.shutdown().await;
}

/// An over-long command line is recoverable: the session replies `500` and
/// keeps running, rather than silently closing (spec.md §4.3: "Command
/// lines exceeding an implementation-defined maximum emit 500 Line too
/// long").
#[tokio::test]
async fn over_long_command_line_gets_500_and_session_continues() {
    let config = ServerConfig::builder()
        .bind_address("127.0.0.1".into())
        .port(0)
        .max_line_length(16)
        .build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220"));

    stream
        .write_all(b"HELO this-line-is-much-longer-than-the-configured-limit\r\n")
        .await
        .unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("500"));

    // The session is still alive: a well-formed command afterward succeeds.
    stream.write_all(b"QUIT\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("221"));

    handle.shutdown().await;
}

/// A protocol-syntax violation inside the DATA payload (here, a bare LF with
/// no preceding CR) is unrecoverable: spec.md §4.3/§7 require the session to
/// close rather than reply and wait for the next command, since the client
/// still believes it's mid-transfer.
#[tokio::test]
async fn malformed_line_during_data_payload_closes_session() {
    let config = ServerConfig::builder().bind_address("127.0.0.1".into()).port(0).build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220"));

    stream.write_all(b"EHLO a\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"MAIL FROM:<s@x>\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"RCPT TO:<r@y>\r\n").await.unwrap();
    let _ = stream.read(&mut buf).await.unwrap();
    stream.write_all(b"DATA\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("354"));

    // Bare LF mid-payload: a 500 is sent, and the connection then closes
    // rather than returning to command mode.
    stream.write_all(b"broken line\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("500"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "expected the socket to close, got: {:?}", rest);

    handle.shutdown().await;
}

#[tokio::test]
async fn s3_rcpt_before_mail_is_rejected() {
    let config = ServerConfig::builder().bind_address("127.0.0.1".into()).port(0).build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let client_task = tokio::task::spawn_blocking(move || {
        let mut client = SmtpClient::connect(addr).expect("connect");
        client.command("EHLO a").expect("ehlo");
        let reply = client.command_allow_failure("RCPT TO:<r@y>").expect("rcpt");
        assert_eq!(reply.code, 503);
        assert_eq!(reply.message, "Error: need MAIL command");
    });
    client_task.await.expect("client task");

    handle.shutdown().await;
}

#[tokio::test]
async fn s4_proxy_v1_rewrites_declared_address() {
    let config = ServerConfig::builder()
        .bind_address("127.0.0.1".into())
        .port(0)
        .proxy_mode(ProxyMode::Permissive)
        .build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"PROXY TCP4 192.168.0.1 10.0.0.1 56324 25\r\n")
        .await
        .unwrap();
    stream.write_all(b"EHLO a\r\n").await.unwrap();
    stream.write_all(b"QUIT\r\n").await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8(buf).unwrap();
    assert!(response.starts_with("220 "), "expected a greeting, got: {:?}", response);
    assert!(response.contains("221"));

    handle.shutdown().await;
}

#[tokio::test]
async fn s5_proxy_v2_local_is_a_noop() {
    let config = ServerConfig::builder()
        .bind_address("127.0.0.1".into())
        .port(0)
        .proxy_mode(ProxyMode::Permissive)
        .build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut header = Vec::new();
    header.extend_from_slice(&[0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A]);
    header.push(0x20); // version 2, command LOCAL
    header.push(0x00); // family/proto unspecified
    header.extend_from_slice(&0u16.to_be_bytes()); // zero-length address block

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&header).await.unwrap();
    stream.write_all(b"EHLO a\r\n").await.unwrap();
    stream.write_all(b"QUIT\r\n").await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8(buf).unwrap();
    assert!(response.starts_with("220 "));
    assert!(response.contains("221"));

    handle.shutdown().await;
}

#[tokio::test]
async fn s6_proxy_v1_malformed_closes_without_greeting() {
    let config = ServerConfig::builder()
        .bind_address("127.0.0.1".into())
        .port(0)
        .proxy_mode(ProxyMode::Required)
        .build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"PROXY TCP4 999.0.0.1 10.0.0.1 1 1\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty(), "expected the socket to close without any greeting, got: {:?}", buf);

    handle.shutdown().await;
}

#[tokio::test]
async fn s7_shutdown_drains_sessions_with_421() {
    let config = ServerConfig::builder().bind_address("127.0.0.1".into()).port(0).build();
    let (handle, addr) = spawn_server(config, Arc::new(AcceptAllHandler)).await;

    let mut session_a = TcpStream::connect(addr).await.unwrap();
    let mut session_b = TcpStream::connect(addr).await.unwrap();

    let mut greeting = [0u8; 256];
    let _ = session_a.read(&mut greeting).await.unwrap();
    let _ = session_b.read(&mut greeting).await.unwrap();

    handle.shutdown().await;

    let mut response_a = Vec::new();
    session_a.read_to_end(&mut response_a).await.unwrap();
    let mut response_b = Vec::new();
    session_b.read_to_end(&mut response_b).await.unwrap();

    for response in [&response_a, &response_b] {
        let text = String::from_utf8_lossy(response);
        assert!(
            text.contains("421") || text.is_empty(),
            "expected a 421 reply or a bare close, got: {:?}",
            text
        );
    }
}

/// STARTTLS end-to-end: a real client-side rustls handshake upgrades the
/// connection, after which the prior `MAIL FROM` must have been cleared
/// (RFC 3207) and a subsequent transaction still delivers correctly.
#[tokio::test]
async fn starttls_resets_session_state_and_delivers_over_tls() {
    let recorder = Arc::new(RecordingHandler::default());
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])
        .expect("generate self-signed cert");
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let server_tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .expect("build server TLS config");
    let tls_factory = Arc::new(smtp_server::RustlsSocketFactory::new(Arc::new(server_tls_config)));

    let config = ServerConfig::builder()
        .bind_address("127.0.0.1".into())
        .port(0)
        .enable_tls(true)
        .build();
    let handle = Server::new(config, recorder.clone() as Arc<dyn MessageHandler>)
        .with_tls_factory(tls_factory)
        .spawn()
        .await
        .expect("server should bind");
    let addr = handle.local_addr();

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = [0u8; 512];

    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220"));

    stream.write_all(b"EHLO a\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).contains("STARTTLS"));

    stream.write_all(b"MAIL FROM:<s@x>\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("250"));

    stream.write_all(b"STARTTLS\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220"));

    let client_tls_config = {
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config.dangerous().set_certificate_verifier(Arc::new(NoCertVerifier));
        config
    };
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_tls_config));
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1").unwrap();
    let mut tls_stream = connector.connect(server_name, stream).await.expect("tls handshake");

    // The prior MAIL FROM must be gone: RCPT with no fresh MAIL is rejected.
    tls_stream.write_all(b"RCPT TO:<r@y>\r\n").await.unwrap();
    let n = tls_stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("503"));

    tls_stream.write_all(b"MAIL FROM:<s@x>\r\n").await.unwrap();
    let n = tls_stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("250"));

    tls_stream.write_all(b"RCPT TO:<r@y>\r\n").await.unwrap();
    let n = tls_stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("250"));

    tls_stream.write_all(b"DATA\r\n").await.unwrap();
    let n = tls_stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("354"));

    tls_stream.write_all(b"secure body\r\n.\r\n").await.unwrap();
    let n = tls_stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("250"));

    tls_stream.write_all(b"QUIT\r\n").await.unwrap();
    let n = tls_stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("221"));

    assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
    let envelope = recorder.last.lock().unwrap().clone().expect("an envelope was recorded");
    assert_eq!(envelope.data, b"secure body\r\n");

    handle.shutdown().await;
}
