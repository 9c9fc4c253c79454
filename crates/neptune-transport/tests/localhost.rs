//! Two UDP transports on loopback, driven through managers.

use std::sync::Arc;
use std::time::Duration;

use neptune_transport::{
    DefaultRoutingStrategy, EndpointInfo, RelayMessage, Transport, TransportEvent,
    TransportManager, UdpTransport, UdpTransportConfig,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn free_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn loopback(id: &str, port: u16, peer_port: u16) -> UdpTransportConfig {
    UdpTransportConfig::new(id)
        .bind_ip("127.0.0.1".parse().unwrap())
        .port(port)
        .broadcast(false)
        .target(format!("127.0.0.1:{peer_port}").parse().unwrap())
}

async fn next_message(
    rx: &mut mpsc::Receiver<TransportEvent>,
) -> (String, neptune_transport::Envelope) {
    loop {
        match rx.recv().await.expect("event stream open") {
            TransportEvent::MessageReceived { transport_id, envelope } => {
                return (transport_id, envelope)
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn relay_message_crosses_loopback() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let (pa, pb) = (free_port(), free_port());
    let (mgr_a, _events_a) = TransportManager::new(DefaultRoutingStrategy);
    let (mgr_b, mut events_b) = TransportManager::new(DefaultRoutingStrategy);

    let a = Arc::new(UdpTransport::new(loopback("udp-a", pa, pb)));
    let b = Arc::new(UdpTransport::new(loopback("udp-b", pb, pa)));
    mgr_a.add(a.clone()).await;
    mgr_b.add(b.clone()).await;
    assert_eq!(mgr_a.start_all().await, 1);
    assert_eq!(mgr_b.start_all().await, 1);

    let mut msg = RelayMessage::new("m-42", "alice@node-a", "bob@node-b", "opaque");
    msg.hops = 1;
    msg.history = vec!["node-a:1700000000".into()];
    assert!(mgr_a.send(&msg.to_envelope()).await);

    let (transport_id, envelope) = timeout(Duration::from_secs(5), next_message(&mut events_b))
        .await
        .expect("message within 5s");
    assert_eq!(transport_id, "udp-b");
    let received = RelayMessage::from_envelope(&envelope).unwrap();
    assert_eq!(received.id, "m-42");
    assert_eq!(received.payload, "opaque");
    assert_eq!(received.hops, 1);
    assert_eq!(received.history, msg.history);

    assert_eq!(a.metrics().messages_sent, 1);
    assert_eq!(b.metrics().messages_received, 1);
    assert!(b.metrics().bytes_received > 0);

    // B learned A from the history entry.
    let peers = mgr_b.discover_peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].node_id, "node-a");
    assert!(matches!(peers[0].endpoint, EndpointInfo::Ip(addr) if addr.port() == pa));

    mgr_a.stop_all().await;
    mgr_b.stop_all().await;
    assert!(!a.is_active());
    assert!(!b.is_active());
}

#[tokio::test]
async fn stopped_transport_refuses_sends_and_restarts() {
    let (pa, pb) = (free_port(), free_port());
    let a = UdpTransport::new(loopback("udp-a", pa, pb));
    let env = RelayMessage::new("m-1", "alice@n1", "bob@n2", "x").to_envelope();

    a.start().await.unwrap();
    assert!(a.send(&env).await);
    a.stop().await.unwrap();
    assert!(a.local_addr().is_none());
    assert!(!a.send(&env).await);

    a.start().await.unwrap();
    assert!(a.send(&env).await);
    assert_eq!(a.metrics().messages_sent, 2);
    a.stop().await.unwrap();
}

#[tokio::test]
async fn oversize_envelope_is_rejected_not_truncated() {
    let (pa, pb) = (free_port(), free_port());
    let a = UdpTransport::new(loopback("udp-a", pa, pb).max_packet_size(256));
    a.start().await.unwrap();

    let big = RelayMessage::new("m-big", "alice@n1", "bob@n2", "z".repeat(1024)).to_envelope();
    assert!(!a.send(&big).await);
    assert_eq!(a.metrics().errors, 1);
    assert_eq!(a.metrics().messages_sent, 0);
    a.stop().await.unwrap();
}
