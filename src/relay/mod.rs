//! Stateless UDP relay.
//!
//! Each datagram starts with a 32-byte header: the sender's 16-byte client
//! ID followed by the destination's. The relay learns `client_id -> source
//! address` from every packet it sees, forwards datagrams whose destination
//! it knows, and forgets clients that go quiet. Payloads (WireGuard
//! handshakes and transport data) pass through opaquely; the relay holds no
//! cryptographic state.
//!
//! A datagram addressed to its own sender is forwarded back, which gives
//! clients a zero-cost latency probe.

pub mod adapter;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{RelayError, Result};

/// Client ID length; the full relay header is two of these
pub const CLIENT_ID_LEN: usize = 16;
pub const HEADER_LEN: usize = CLIENT_ID_LEN * 2;

/// Clients unseen for this long are evicted
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);
/// Eviction sweep cadence
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Throughput/table-size log cadence
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// A client's random self-chosen identifier
pub type ClientId = [u8; CLIENT_ID_LEN];

/// Generate a fresh random client ID
pub fn new_client_id() -> ClientId {
    let mut id = [0u8; CLIENT_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Prefix `payload` with the relay header
pub fn encode_frame(sender: &ClientId, dest: &ClientId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(sender);
    frame.extend_from_slice(dest);
    frame.extend_from_slice(payload);
    frame
}

/// Split a datagram into (sender, dest, payload); `None` if too short
pub fn decode_frame(datagram: &[u8]) -> Option<(ClientId, ClientId, &[u8])> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let sender: ClientId = datagram[..CLIENT_ID_LEN].try_into().ok()?;
    let dest: ClientId = datagram[CLIENT_ID_LEN..HEADER_LEN].try_into().ok()?;
    Some((sender, dest, &datagram[HEADER_LEN..]))
}

struct ClientEntry {
    addr: SocketAddr,
    last_seen: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct RelayStats {
    received: u64,
    forwarded: u64,
    dropped: u64,
    bytes: u64,
}

/// The relay service. One UDP socket, one forwarding table.
pub struct RelayServer {
    socket: UdpSocket,
    clients: HashMap<ClientId, ClientEntry>,
    stats: RelayStats,
    client_timeout: Duration,
}

impl RelayServer {
    /// Bind the relay on `port` (all interfaces).
    pub async fn bind(port: u16) -> Result<Self> {
        let addr = format!("0.0.0.0:{port}");
        let socket = UdpSocket::bind(&addr).await.map_err(|e| RelayError::BindFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        tracing::info!(addr = %addr, "relay listening");
        Ok(Self {
            socket,
            clients: HashMap::new(),
            stats: RelayStats::default(),
            client_timeout: CLIENT_TIMEOUT,
        })
    }

    #[cfg(test)]
    async fn bind_ephemeral(client_timeout: Duration) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            socket,
            clients: HashMap::new(),
            stats: RelayStats::default(),
            client_timeout,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        let mut stats = tokio::time::interval(STATS_INTERVAL);

        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => tracing::warn!(error = %e, "relay recv failed"),
                    }
                }
                _ = cleanup.tick() => self.evict_stale(),
                _ = stats.tick() => self.log_stats(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("relay shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        self.stats.received += 1;
        self.stats.bytes += datagram.len() as u64;

        let Some((sender, dest, _payload)) = decode_frame(datagram) else {
            self.stats.dropped += 1;
            return;
        };

        // Every well-formed packet refreshes the sender's mapping, even when
        // the destination is unknown.
        self.clients.insert(
            sender,
            ClientEntry {
                addr: from,
                last_seen: Instant::now(),
            },
        );

        let Some(entry) = self.clients.get(&dest) else {
            tracing::debug!(dest = %hex::encode(dest), "destination unknown, dropping");
            self.stats.dropped += 1;
            return;
        };

        // Forward the datagram unchanged; the receiver strips the header.
        if let Err(e) = self.socket.send_to(datagram, entry.addr).await {
            tracing::debug!(error = %e, "relay forward failed");
            self.stats.dropped += 1;
        } else {
            self.stats.forwarded += 1;
        }
    }

    fn evict_stale(&mut self) {
        let timeout = self.client_timeout;
        let before = self.clients.len();
        self.clients
            .retain(|_, entry| entry.last_seen.elapsed() < timeout);
        let evicted = before - self.clients.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = self.clients.len(), "evicted stale clients");
        }
    }

    fn log_stats(&self) {
        tracing::info!(
            clients = self.clients.len(),
            received = self.stats.received,
            forwarded = self.stats.forwarded,
            dropped = self.stats.dropped,
            bytes = self.stats.bytes,
            "relay stats"
        );
    }
}

/// Measure round-trip time to a relay by sending a self-addressed frame and
/// waiting for it to come back. Used by the coordinator to rank relays.
pub async fn probe_latency(relay: SocketAddr, timeout: Duration) -> Result<Duration> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(RelayError::Io)?;
    let id = new_client_id();
    let frame = encode_frame(&id, &id, b"probe");

    let started = Instant::now();
    socket
        .send_to(&frame, relay)
        .await
        .map_err(RelayError::Io)?;

    let mut buf = [0u8; 128];
    loop {
        let remaining = timeout
            .checked_sub(started.elapsed())
            .ok_or_else(|| RelayError::ProbeFailed {
                endpoint: relay.to_string(),
            })?;
        let (len, from) = tokio::time::timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| RelayError::ProbeFailed {
                endpoint: relay.to_string(),
            })?
            .map_err(RelayError::Io)?;
        if from != relay {
            continue;
        }
        match decode_frame(&buf[..len]) {
            Some((sender, _, _)) if sender == id => return Ok(started.elapsed()),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_relay(timeout: Duration) -> (SocketAddr, watch::Sender<bool>) {
        let mut relay = RelayServer::bind_ephemeral(timeout).await;
        let addr = relay.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = relay.run(rx).await;
        });
        (addr, tx)
    }

    #[tokio::test]
    async fn test_forwarding_preserves_payload() {
        let (relay, _shutdown) = spawn_relay(CLIENT_TIMEOUT).await;

        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let id_a = new_client_id();
        let id_b = new_client_id();

        // Bob registers (header-only datagram to an unknown destination).
        bob.send_to(&encode_frame(&id_b, &[0u8; 16], b""), relay)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Alice sends to Bob through the relay.
        let payload = b"wireguard handshake initiation \x01\x02\x03";
        alice
            .send_to(&encode_frame(&id_a, &id_b, payload), relay)
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), bob.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, relay);
        let (sender, dest, got) = decode_frame(&buf[..len]).unwrap();
        assert_eq!(sender, id_a);
        assert_eq!(dest, id_b);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_unknown_destination_dropped_but_sender_registered() {
        let (relay, _shutdown) = spawn_relay(CLIENT_TIMEOUT).await;

        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let id_a = new_client_id();
        let id_b = new_client_id();

        // Alice sends to B before B registered: dropped, but A is now known.
        alice
            .send_to(&encode_frame(&id_a, &id_b, b"early"), relay)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Bob can now reach Alice because her first packet registered her.
        bob.send_to(&encode_frame(&id_b, &id_a, b"hello alice"), relay)
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), alice.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (_, _, payload) = decode_frame(&buf[..len]).unwrap();
        assert_eq!(payload, b"hello alice");
    }

    #[tokio::test]
    async fn test_self_addressed_frame_loops_back() {
        let (relay, _shutdown) = spawn_relay(CLIENT_TIMEOUT).await;
        let rtt = probe_latency(relay, Duration::from_secs(2)).await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_short_datagrams_ignored() {
        let (relay, _shutdown) = spawn_relay(CLIENT_TIMEOUT).await;
        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        alice.send_to(b"short", relay).await.unwrap();
        // Still alive afterwards.
        let rtt = probe_latency(relay, Duration::from_secs(2)).await;
        assert!(rtt.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_clients_evicted() {
        let mut relay = RelayServer::bind_ephemeral(Duration::from_secs(300)).await;
        let id = new_client_id();
        relay
            .handle_datagram(
                &encode_frame(&id, &[0u8; 16], b""),
                "127.0.0.1:9999".parse().unwrap(),
            )
            .await;
        assert_eq!(relay.clients.len(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        relay.evict_stale();
        assert!(relay.clients.is_empty());
    }

    #[test]
    fn test_frame_roundtrip() {
        let a = new_client_id();
        let b = new_client_id();
        let frame = encode_frame(&a, &b, b"payload");
        let (sa, sb, p) = decode_frame(&frame).unwrap();
        assert_eq!((sa, sb, p), (a, b, &b"payload"[..]));
        assert!(decode_frame(&frame[..HEADER_LEN - 1]).is_none());
    }
}
