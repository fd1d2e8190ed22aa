//! S5: broadcast fan-out across a three-peer party, with dedupe and
//! back-to-source suppression. Observer UDP sockets stand in for the other
//! peers' transport sockets.

use std::net::Ipv4Addr;
use std::time::Duration;

use lanrage::broadcast::{BroadcastManager, BroadcastPacket};
use tokio::net::UdpSocket;

async fn manager(dir: &tempfile::TempDir, name: &str) -> std::sync::Arc<BroadcastManager> {
    BroadcastManager::start(
        name.to_string(),
        0,
        &dir.path().join(format!("{name}-ports.json")),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn broadcast_fans_out_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let a = manager(&dir, "peer-a").await;

    // B and C observe what A forwards into the mesh.
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let c = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.register_peer_addr("peer-b", b.local_addr().unwrap()).await;
    a.register_peer_addr("peer-c", c.local_addr().unwrap()).await;

    // A's local game announces on port 27015. Drive A's capture path with
    // a real datagram: open the listener and send to it on loopback.
    a.set_game_ports([27015].into()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    game.send_to(b"FIND SERVERS X", "127.0.0.1:27015")
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    for observer in [&b, &c] {
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), observer.recv_from(&mut buf))
            .await
            .expect("observer should receive the forwarded packet")
            .unwrap();
        let packet: BroadcastPacket = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(packet.payload, b"FIND SERVERS X");
        assert_eq!(packet.dst_port, 27015);
        assert_eq!(packet.origin_peer.as_deref(), Some("peer-a"));
    }

    // The same payload again inside the dedupe window: suppressed.
    game.send_to(b"FIND SERVERS X", "127.0.0.1:27015")
        .await
        .unwrap();
    for observer in [&b, &c] {
        let second =
            tokio::time::timeout(Duration::from_millis(400), observer.recv_from(&mut buf)).await;
        assert!(second.is_err(), "duplicate broadcast must be suppressed");
    }
}

#[tokio::test]
async fn remote_packet_is_not_sent_back_to_origin() {
    let dir = tempfile::tempdir().unwrap();
    let a = manager(&dir, "peer-a").await;

    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.register_peer_addr("peer-b", b.local_addr().unwrap()).await;

    // A packet from peer B arrives on A's transport socket.
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = BroadcastPacket {
        src_ip: Ipv4Addr::new(10, 66, 0, 2),
        dst_port: 47123,
        payload: b"hello from b".to_vec(),
        origin_peer: Some("peer-b".to_string()),
    };
    sender
        .send_to(
            &serde_json::to_vec(&packet).unwrap(),
            format!("127.0.0.1:{}", a.transport_port()),
        )
        .await
        .unwrap();

    // B never sees its own packet come back.
    let mut buf = [0u8; 2048];
    let echo = tokio::time::timeout(Duration::from_millis(400), b.recv_from(&mut buf)).await;
    assert!(echo.is_err());

    // And the dedupe counters saw the packet once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = a.metrics().await;
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.forwarded, 1);
}

#[tokio::test]
async fn listener_close_stops_capture() {
    let dir = tempfile::tempdir().unwrap();
    let a = manager(&dir, "peer-a").await;

    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.register_peer_addr("peer-b", b.local_addr().unwrap()).await;

    a.set_game_ports([27031].into()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.set_game_ports([].into()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let _ = game.send_to(b"late announce", "127.0.0.1:27031").await;

    let mut buf = [0u8; 2048];
    let got = tokio::time::timeout(Duration::from_millis(400), b.recv_from(&mut buf)).await;
    assert!(got.is_err(), "closed port must not forward");
}
