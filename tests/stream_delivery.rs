use std::sync::Arc;
use std::time::Duration;

use logstash_shipper::coordinator::Headers;
use logstash_shipper::stream::StreamTransport;
use logstash_shipper::tls::TrustPolicy;
use logstash_shipper::transport::{EventHandler, Transport, TransportEvent};
use logstash_shipper::{Config, DeliveryCoordinator, DeliveryError, LogRecord};
use rcgen::CertifiedKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// A collector presenting a self-signed certificate.
///
/// Every line received on any connection is forwarded to the returned
/// channel.
async fn start_collector() -> (u16, mpsc::UnboundedReceiver<String>) {
    let CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.der().clone()], key)
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(socket).await else {
                    return;
                };
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(line);
                }
            });
        }
    });

    (port, rx)
}

async fn next_line(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let line = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("line should arrive")
        .expect("collector running");
    serde_json::from_str(&line).unwrap()
}

fn recording_handler() -> (EventHandler, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: EventHandler = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event should arrive")
        .expect("channel open")
}

#[tokio::test]
async fn test_untrusted_collector_is_secured_when_allowed() {
    let (port, _lines) = start_collector().await;
    let (handler, mut events) = recording_handler();
    let transport = StreamTransport::new(
        "127.0.0.1",
        port,
        Duration::from_secs(5),
        TrustPolicy::AllowUntrusted,
        handler,
    )
    .unwrap();

    transport.connect().unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert!(!transport.is_secure());

    transport.secure();
    assert_eq!(next_event(&mut events).await, TransportEvent::Secured);
    assert!(transport.is_secure());

    transport.disconnect_after_pending_writes();
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Disconnected(None)
    );
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_untrusted_collector_rejected_by_strict_policy() {
    let (port, _lines) = start_collector().await;
    let (handler, mut events) = recording_handler();
    let transport = StreamTransport::new(
        "localhost",
        port,
        Duration::from_secs(5),
        TrustPolicy::Strict,
        handler,
    )
    .unwrap();

    transport.connect().unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    transport.secure();

    match next_event(&mut events).await {
        TransportEvent::Disconnected(Some(err @ DeliveryError::Handshake { .. })) => {
            assert!(err.is_connection_error());
        }
        other => panic!("Expected handshake failure, got {:?}", other),
    }
    assert!(!transport.is_secure());
}

#[tokio::test]
async fn test_stream_flush_delivers_in_order_with_token() {
    let (port, mut lines) = start_collector().await;
    let config = Config::new("127.0.0.1", port)
        .with_allow_untrusted_server(true)
        .with_auth_token("secret")
        .with_timeout(Duration::from_secs(5));
    let coordinator = DeliveryCoordinator::configure(config).unwrap();

    for message in ["one", "two", "three"] {
        coordinator.append(LogRecord::new().with("message", message));
    }
    coordinator.flush(Headers::new()).await.unwrap();

    let stats = coordinator.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.delivered, 3);

    for expected in ["one", "two", "three"] {
        let line = next_line(&mut lines).await;
        assert_eq!(line["message"], expected);
        assert_eq!(line["token"], "secret");
        assert!(line["@timestamp"].is_string());
    }
}

#[tokio::test]
async fn test_stream_flush_reconnects_for_next_batch() {
    let (port, mut lines) = start_collector().await;
    let config = Config::new("127.0.0.1", port)
        .with_allow_untrusted_server(true)
        .with_timeout(Duration::from_secs(5));
    let coordinator = DeliveryCoordinator::configure(config).unwrap();

    coordinator.append(LogRecord::new().with("message", "first"));
    coordinator.flush(Headers::new()).await.unwrap();
    assert_eq!(next_line(&mut lines).await["message"], "first");

    coordinator.append(LogRecord::new().with("message", "second"));
    // A flush issued while the previous session is still closing completes
    // at once; keep asking until the record has gone out.
    for _ in 0..50 {
        coordinator.flush(Headers::new()).await.unwrap();
        if coordinator.stats().await.unwrap().pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(coordinator.stats().await.unwrap().pending, 0);
    let line = next_line(&mut lines).await;
    assert_eq!(line["message"], "second");
    assert!(line.get("token").is_none());
}

#[tokio::test]
async fn test_strict_policy_flush_fails_and_keeps_records() {
    let (port, mut lines) = start_collector().await;
    let config = Config::new("localhost", port).with_timeout(Duration::from_secs(5));
    let coordinator = DeliveryCoordinator::configure(config).unwrap();

    coordinator.append(LogRecord::new().with("message", "kept"));
    coordinator.append(LogRecord::new().with("message", "also kept"));

    let err = coordinator.flush(Headers::new()).await.unwrap_err();
    assert!(err.is_connection_error(), "unexpected error {:?}", err);

    let stats = coordinator.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.delivered, 0);
    assert!(timeout(Duration::from_millis(100), lines.recv()).await.is_err());
}
