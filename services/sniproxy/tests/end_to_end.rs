
use std::time::Duration;

use harness::{client_hello_record, send_and_collect, tls_client_connect, Backend, ProxyHandle};
use sniproxy::{RelayConfig, WILDCARD_HOSTNAME};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

#[tokio::test]
async fn tls_passthrough_routes_by_sni() {
    let (alpha, alpha_cert) = Backend::tls("alpha.test", "from-alpha").await.unwrap();
    let (beta, beta_cert) = Backend::tls("beta.test", "from-beta").await.unwrap();

    let proxy = ProxyHandle::spawn(&[
        (r"^alpha\.test$", alpha.addr.to_string()),
        (r"^beta\.test$", beta.addr.to_string()),
    ])
    .await
    .unwrap();

    for (name, cert, marker) in [
        ("alpha.test", &alpha_cert, "from-alpha"),
        ("beta.test", &beta_cert, "from-beta"),
    ] {
        let mut tls = timeout(
            Duration::from_secs(5),
            tls_client_connect(proxy.listen_addr, name, cert),
        )
        .await
        .expect("handshake timed out")
        .expect("handshake through proxy failed");

        tls.write_all(b"ping").await.unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), tls.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, marker.as_bytes());
    }

    assert_eq!(alpha.connection_count(), 1);
    assert_eq!(beta.connection_count(), 1);
    assert_eq!(proxy.wait_for_stat(|s| &s.sni_found, 2).await, 2);
}

#[tokio::test]
async fn relayed_bytes_match_in_both_directions() {
    let backend = Backend::echo().await.unwrap();
    let proxy = ProxyHandle::spawn(&[(r"^svc\.test$", backend.addr.to_string())])
        .await
        .unwrap();

    let mut payload = client_hello_record("svc.test");
    payload.extend((0..16 * 1024).map(|i| (i % 251) as u8));

    let received = send_and_collect(proxy.listen_addr, &payload).await.unwrap();

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
    assert_eq!(
        proxy
            .wait_for_stat(|s| &s.bytes_to_backend, payload.len() as u64)
            .await,
        payload.len() as u64
    );
}

#[tokio::test]
async fn client_hello_split_across_writes() {
    let backend = Backend::echo().await.unwrap();
    let proxy = ProxyHandle::spawn(&[(r"^slow\.test$", backend.addr.to_string())])
        .await
        .unwrap();

    let hello = client_hello_record("slow.test");
    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    for chunk in hello.chunks(7) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    stream.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, hello);
}

#[tokio::test]
async fn plaintext_routes_to_wildcard_endpoint() {
    let backend = Backend::echo().await.unwrap();
    let proxy = ProxyHandle::spawn(&[
        (r"^svc\.test$", "127.0.0.1:1".to_string()),
        (r"^\*$", backend.addr.to_string()),
    ])
    .await
    .unwrap();

    let received = send_and_collect(proxy.listen_addr, b"HELLO").await.unwrap();
    assert_eq!(received, b"HELLO");
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(proxy.wait_for_stat(|s| &s.not_tls, 1).await, 1);
    assert!(proxy.endpoints.get(WILDCARD_HOSTNAME).is_ok());
}

#[tokio::test]
async fn plaintext_without_wildcard_is_closed() {
    let backend = Backend::echo().await.unwrap();
    let proxy = ProxyHandle::spawn(&[(r"^svc\.test$", backend.addr.to_string())])
        .await
        .unwrap();

    let received = send_and_collect(proxy.listen_addr, b"HELLO").await.unwrap();
    assert!(received.is_empty());
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(proxy.wait_for_stat(|s| &s.routes_failed, 1).await, 1);
}

#[tokio::test]
async fn missing_sni_routes_by_empty_hostname() {
    let backend = Backend::echo().await.unwrap();
    let proxy = ProxyHandle::spawn(&[
        (r"^svc\.test$", "127.0.0.1:1".to_string()),
        ("^$", backend.addr.to_string()),
    ])
    .await
    .unwrap();

    // A ClientHello record whose body is too short to carry extensions.
    let hello = [0x16, 0x03, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00];
    let received = send_and_collect(proxy.listen_addr, &hello).await.unwrap();
    assert_eq!(received, hello);
    assert_eq!(proxy.wait_for_stat(|s| &s.sni_absent, 1).await, 1);
}

#[tokio::test]
async fn unknown_hostname_is_closed() {
    let backend = Backend::echo().await.unwrap();
    let proxy = ProxyHandle::spawn(&[(r"^svc\.test$", backend.addr.to_string())])
        .await
        .unwrap();

    let received = send_and_collect(proxy.listen_addr, &client_hello_record("other.test"))
        .await
        .unwrap();
    assert!(received.is_empty());
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn unreachable_backend_is_closed() {
    let temp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = temp_listener.local_addr().unwrap();
    drop(temp_listener);

    let proxy = ProxyHandle::spawn(&[(".*", dead_addr.to_string())])
        .await
        .unwrap();

    let received = send_and_collect(proxy.listen_addr, &client_hello_record("svc.test"))
        .await
        .unwrap();
    assert!(received.is_empty());
    assert_eq!(proxy.wait_for_stat(|s| &s.backend_failed, 1).await, 1);
}

#[tokio::test]
async fn silent_client_is_closed_after_peek_deadline() {
    let backend = Backend::echo().await.unwrap();
    let proxy = ProxyHandle::spawn_with(
        &[(".*", backend.addr.to_string())],
        RelayConfig {
            peek_timeout: Duration::from_millis(200),
            ..RelayConfig::default()
        },
    )
    .await
    .unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("proxy kept the silent connection open")
        .unwrap_or(0);

    assert_eq!(n, 0);
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(proxy.wait_for_stat(|s| &s.peek_failed, 1).await, 1);
}

#[tokio::test]
async fn backend_close_closes_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut hello = vec![0u8; client_hello_record("svc.test").len()];
        stream.read_exact(&mut hello).await.unwrap();
        stream.write_all(b"goodbye").await.unwrap();
    });

    let proxy = ProxyHandle::spawn(&[(".*", backend_addr.to_string())])
        .await
        .unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream
        .write_all(&client_hello_record("svc.test"))
        .await
        .unwrap();

    // The client keeps its side open; the backend's close must still reach it.
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("backend close was not propagated")
        .unwrap();
    assert_eq!(received, b"goodbye");
}

#[tokio::test]
async fn backend_close_releases_connection_while_client_stays_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut hello = vec![0u8; client_hello_record("svc.test").len()];
        stream.read_exact(&mut hello).await.unwrap();
        stream.write_all(b"goodbye").await.unwrap();
    });

    let proxy = ProxyHandle::spawn(&[(".*", backend_addr.to_string())])
        .await
        .unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream
        .write_all(&client_hello_record("svc.test"))
        .await
        .unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"goodbye");

    // `stream` is still open here; the proxy must release its side anyway.
    assert_eq!(proxy.wait_for_stat(|s| &s.connections_closed, 1).await, 1);
    assert_eq!(proxy.stat(|s| &s.connections_active), 0);
    assert_eq!(proxy.stat(|s| &s.relayed), 1);
    drop(stream);
}
