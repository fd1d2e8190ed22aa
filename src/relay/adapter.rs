//! Local adapter between the WireGuard interface and a relay.
//!
//! Kernel WireGuard emits plain datagrams; the relay expects each one to
//! carry the sender/destination header. The adapter bridges the two: the
//! tunnel's peer endpoint points at a loopback socket, and the adapter
//! rewrites traffic in both directions, adding the header on the way out
//! and stripping it on the way in.
//!
//! Relay client IDs are derived from LANrage peer IDs (first 16 bytes of
//! their SHA-256), so both sides can address each other without any extra
//! exchange.

use std::net::SocketAddr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::{RelayError, Result};

use super::{decode_frame, encode_frame, ClientId, CLIENT_ID_LEN};

/// Derive the stable relay client ID for a LANrage peer
pub fn client_id_for_peer(peer_id: &str) -> ClientId {
    let digest = Sha256::digest(peer_id.as_bytes());
    let mut id = [0u8; CLIENT_ID_LEN];
    id.copy_from_slice(&digest[..CLIENT_ID_LEN]);
    id
}

/// One peer's relay bridge. Dropping the adapter (or flipping its shutdown
/// sender) stops the pump task.
pub struct RelayAdapter {
    local_addr: SocketAddr,
    relay_addr: SocketAddr,
    /// Retarget channel: a relay switch updates the destination without
    /// disturbing the WireGuard side.
    relay_tx: watch::Sender<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayAdapter {
    /// Bind the loopback socket and start pumping between WireGuard and
    /// `relay_addr`.
    pub async fn start(
        local_peer_id: &str,
        remote_peer_id: &str,
        relay_addr: SocketAddr,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(RelayError::Io)?;
        let local_addr = socket.local_addr().map_err(RelayError::Io)?;

        let my_id = client_id_for_peer(local_peer_id);
        let peer_id = client_id_for_peer(remote_peer_id);

        let (relay_tx, relay_rx) = watch::channel(relay_addr);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(pump(
            Arc::new(socket),
            my_id,
            peer_id,
            relay_rx,
            shutdown_rx,
        ));

        tracing::debug!(
            local = %local_addr,
            relay = %relay_addr,
            peer = %hex::encode(peer_id),
            "relay adapter started"
        );

        Ok(Self {
            local_addr,
            relay_addr,
            relay_tx,
            shutdown_tx,
        })
    }

    /// The loopback endpoint WireGuard should use for this peer
    pub fn wireguard_endpoint(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Point the adapter at a different relay (relay switch on degradation).
    pub fn retarget(&mut self, relay_addr: SocketAddr) {
        self.relay_addr = relay_addr;
        let _ = self.relay_tx.send(relay_addr);
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for RelayAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(
    socket: Arc<UdpSocket>,
    my_id: ClientId,
    peer_id: ClientId,
    relay_rx: watch::Receiver<SocketAddr>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // WireGuard's source port is learned from its first outbound datagram;
    // until then inbound relay traffic has nowhere to go.
    let mut wg_addr: Option<SocketAddr> = None;
    let mut buf = vec![0u8; 65536];

    // Register with the relay immediately so the peer can reach us before
    // we have sent any data.
    let register = encode_frame(&my_id, &peer_id, b"");
    let initial_relay_addr = *relay_rx.borrow();
    let _ = socket.send_to(&register, initial_relay_addr).await;

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = recv else { return };
                let relay_addr = *relay_rx.borrow();

                if from == relay_addr {
                    // Inbound: strip the header, hand the payload to WireGuard.
                    let Some((sender, _dest, payload)) = decode_frame(&buf[..len]) else {
                        continue;
                    };
                    if sender != peer_id || payload.is_empty() {
                        continue;
                    }
                    if let Some(wg) = wg_addr {
                        let _ = socket.send_to(payload, wg).await;
                    }
                } else if from.ip().is_loopback() {
                    // Outbound from WireGuard: wrap and forward.
                    wg_addr = Some(from);
                    let frame = encode_frame(&my_id, &peer_id, &buf[..len]);
                    let _ = socket.send_to(&frame, relay_addr).await;
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_id_is_stable_and_distinct() {
        let a1 = client_id_for_peer("peer-a");
        let a2 = client_id_for_peer("peer-a");
        let b = client_id_for_peer("peer-b");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[tokio::test]
    async fn test_adapter_bridges_wireguard_traffic_through_relay() {
        // Real relay, two adapters, two fake "WireGuard" sockets.
        let mut relay = crate::relay::RelayServer::bind_ephemeral(Duration::from_secs(300)).await;
        let relay_addr = relay.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = relay.run(shutdown_rx).await;
        });

        let alice = RelayAdapter::start("alice", "bob", relay_addr).await.unwrap();
        let bob = RelayAdapter::start("bob", "alice", relay_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let wg_alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let wg_bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Prime both adapters so they learn their WireGuard ports before
        // the payloads under test cross the relay.
        wg_alice
            .send_to(b"prime", alice.wireguard_endpoint())
            .await
            .unwrap();
        wg_bob
            .send_to(b"prime", bob.wireguard_endpoint())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        wg_alice
            .send_to(b"handshake-initiation", alice.wireguard_endpoint())
            .await
            .unwrap();
        wg_bob
            .send_to(b"handshake-response", bob.wireguard_endpoint())
            .await
            .unwrap();

        let expect = |sock: UdpSocket, want: &'static [u8], from_ep: SocketAddr| async move {
            let mut buf = [0u8; 256];
            loop {
                let (len, from) =
                    tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
                        .await
                        .unwrap()
                        .unwrap();
                if &buf[..len] == b"prime" {
                    continue;
                }
                assert_eq!(&buf[..len], want);
                assert_eq!(from, from_ep);
                return;
            }
        };

        expect(wg_bob, b"handshake-initiation", bob.wireguard_endpoint()).await;
        expect(wg_alice, b"handshake-response", alice.wireguard_endpoint()).await;
    }
}
