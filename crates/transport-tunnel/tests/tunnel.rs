use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use transport_tunnel::label::Label;
use transport_tunnel::rtc::LoopbackNetwork;
use transport_tunnel::signaling::{MemoryRelay, Signaling};
use transport_tunnel::{ChannelKind, Listener, PeerConfig, SignalingConnector, TunnelClient};

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Tunnel {
    client: TunnelClient,
    listener: Listener,
}

fn tunnel(service: &str) -> Tunnel {
    init_tracing();
    let network = LoopbackNetwork::new();
    let relay = MemoryRelay::new();
    let config = PeerConfig::default();
    let listener = Listener::bind(
        Arc::new(network.clone()),
        relay.responder(service),
        &config,
    )
    .expect("bind");
    let connector: SignalingConnector = Arc::new(move |service: &str| {
        let signaling: Arc<dyn Signaling> = relay.initiator(service);
        Ok(signaling)
    });
    let client = TunnelClient::with_connector(Arc::new(network), connector, &config);
    Tunnel { client, listener }
}

#[test_timeout::tokio_timeout_test(10)]
async fn file_transfer_spans_many_reads() {
    let t = tunnel("files");
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let mut conn = t.client.dial("files", ChannelKind::File).await.expect("dial");
    conn.write_all(b"?").await.expect("hello");
    let mut accepted = t.listener.accept(ChannelKind::File).await.expect("accept");
    let mut hello = [0u8; 1];
    accepted.read_exact(&mut hello).await.expect("hello");
    accepted.write_all(b"ready").await.expect("ready");

    let mut ready = [0u8; 5];
    conn.read_exact(&mut ready).await.expect("ready");
    assert_eq!(&ready, b"ready");
    conn.write_all(&payload).await.expect("payload");
    conn.shutdown().await.expect("shutdown");

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let mut reads = 0;
    loop {
        let n = accepted.read(&mut buf).await.expect("read");
        if n == 0 {
            break;
        }
        reads += 1;
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);
    assert!(reads >= 3);

    t.client.close().await;
    t.listener.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn proxy_channels_run_side_by_side() {
    let t = tunnel("proxy");
    let mut first = t.client.dial("proxy", ChannelKind::Proxy).await.expect("first");
    let mut second = t.client.dial("proxy", ChannelKind::Proxy).await.expect("second");
    assert_ne!(first.label(), second.label());
    assert_eq!(first.label().kind(), ChannelKind::Proxy);

    first.write_all(b"one").await.expect("write one");
    second.write_all(b"two").await.expect("write two");

    let mut seen = Vec::new();
    for _ in 0..2 {
        let mut accepted = t.listener.accept(ChannelKind::Proxy).await.expect("accept");
        let mut buf = [0u8; 3];
        accepted.read_exact(&mut buf).await.expect("read");
        seen.push((accepted.label(), buf.to_vec()));
        accepted.release();
    }
    seen.sort_by_key(|(label, _)| label.index());
    let labels: Vec<Label> = seen.iter().map(|(label, _)| *label).collect();
    assert_eq!(labels, vec![first.label(), second.label()]);
    assert_eq!(seen[0].1, b"one");
    assert_eq!(seen[1].1, b"two");

    t.client.close().await;
    t.listener.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn client_close_removes_listener_peer() {
    let t = tunnel("web");
    let mut conn = t.client.dial("web", ChannelKind::Web).await.expect("dial");
    conn.write_all(b"GET /").await.expect("write");
    let mut accepted = t.listener.accept(ChannelKind::Web).await.expect("accept");
    let mut buf = [0u8; 5];
    accepted.read_exact(&mut buf).await.expect("read");
    assert_eq!(t.listener.peer_count(), 1);
    assert_eq!(t.client.services().await, vec!["web".to_string()]);

    t.client.close().await;
    assert!(t.client.services().await.is_empty());
    let mut rest = Vec::new();
    let n = accepted.read_to_end(&mut rest).await.expect("eof");
    assert_eq!(n, 0);
    while t.listener.peer_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    t.listener.close().await;
}
