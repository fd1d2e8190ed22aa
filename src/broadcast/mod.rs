//! LAN discovery emulation across the mesh.
//!
//! Locally captured broadcast/multicast datagrams are deduplicated, then
//! fanned out to every registered mesh peer over the transport socket (a
//! plain UDP port on the virtual LAN). Packets arriving from peers are
//! re-injected on the local LAN so discovery-based games find each other.
//!
//! Re-injection would be captured by our own listeners again; a
//! payload-keyed guard window suppresses that echo, and the transport never
//! forwards a remote packet onward (the mesh is fully connected, so one hop
//! reaches everyone).

pub mod dedup;
pub mod emulator;

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::Result;

pub use dedup::Deduplicator;
pub use emulator::{BroadcastPacket, Injector, ListenerKind, PortListener};
pub use emulator::{MDNS_PORT, SSDP_PORT};

use dedup::{DEDUPE_WINDOW, PRUNE_INTERVAL};
use emulator::{MDNS_GROUP, SSDP_GROUP};

/// Snapshot of the emulator's counters for status output
#[derive(Debug, Clone, serde::Serialize)]
pub struct BroadcastMetrics {
    pub total: u64,
    pub forwarded: u64,
    pub deduplicated: u64,
    pub dedupe_rate: f64,
    pub active_ports: Vec<u16>,
}

pub struct BroadcastManager {
    local_peer_id: String,
    transport_port: u16,
    transport: Arc<UdpSocket>,
    dedup: Arc<Deduplicator>,
    /// Payload-keyed guard that stops our own injections echoing back
    injected_guard: Arc<Deduplicator>,
    injector: Injector,
    listeners: Mutex<HashMap<u16, PortListener>>,
    /// peer_id -> transport address on the virtual LAN
    peers: Mutex<HashMap<String, SocketAddr>>,
    /// Ports the user always wants monitored
    whitelist: HashSet<u16>,
    /// Ports requested by the game-detection collaborator
    game_ports: Mutex<HashSet<u16>>,
    capture_tx: mpsc::Sender<BroadcastPacket>,
    shutdown_tx: watch::Sender<bool>,
}

impl BroadcastManager {
    /// Bind the transport socket, load the whitelist, and start the
    /// capture/transport/prune tasks. Whitelisted ports and the multicast
    /// groups begin listening immediately.
    pub async fn start(
        local_peer_id: String,
        transport_port: u16,
        whitelist_path: &Path,
    ) -> Result<Arc<Self>> {
        let transport = UdpSocket::bind(("0.0.0.0", transport_port))
            .await
            .map_err(crate::error::LanRageError::System)?;
        // Port 0 means "ephemeral"; record what the OS actually picked.
        let transport_port = transport
            .local_addr()
            .map_err(crate::error::LanRageError::System)?
            .port();

        let (capture_tx, capture_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let whitelist = load_whitelist(whitelist_path);

        let manager = Arc::new(Self {
            local_peer_id,
            transport_port,
            transport: Arc::new(transport),
            dedup: Arc::new(Deduplicator::new(DEDUPE_WINDOW)),
            injected_guard: Arc::new(Deduplicator::new(DEDUPE_WINDOW)),
            injector: Injector::new().await?,
            listeners: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            whitelist,
            game_ports: Mutex::new(HashSet::new()),
            capture_tx,
            shutdown_tx,
        });

        // Multicast groups are always on; whitelisted ports too.
        manager
            .open_listener(MDNS_PORT, ListenerKind::Multicast(MDNS_GROUP))
            .await;
        manager
            .open_listener(SSDP_PORT, ListenerKind::Multicast(SSDP_GROUP))
            .await;
        for port in manager.whitelist.clone() {
            manager.open_listener(port, ListenerKind::Broadcast).await;
        }

        tokio::spawn(capture_task(
            Arc::clone(&manager),
            capture_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(transport_task(Arc::clone(&manager), shutdown_rx.clone()));
        tokio::spawn(prune_task(
            Arc::clone(&manager.dedup),
            Arc::clone(&manager.injected_guard),
            shutdown_rx,
        ));

        tracing::info!(
            transport_port,
            whitelist = ?manager.whitelist,
            "broadcast manager started"
        );
        Ok(manager)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Port the transport socket actually bound
    pub fn transport_port(&self) -> u16 {
        self.transport_port
    }

    /// Register a mesh peer as a forwarding target at its virtual IP.
    pub async fn register_peer(&self, peer_id: &str, virtual_ip: Ipv4Addr) {
        self.register_peer_addr(peer_id, SocketAddr::from((virtual_ip, self.transport_port)))
            .await;
    }

    /// Register a forwarding target at an explicit address.
    pub async fn register_peer_addr(&self, peer_id: &str, addr: SocketAddr) {
        self.peers.lock().await.insert(peer_id.to_string(), addr);
        tracing::debug!(peer_id = %peer_id, addr = %addr, "broadcast target registered");
    }

    pub async fn unregister_peer(&self, peer_id: &str) {
        self.peers.lock().await.remove(peer_id);
    }

    /// The game-detection collaborator reports the ports of the currently
    /// running games; reconcile listeners against whitelist + games.
    pub async fn set_game_ports(&self, ports: HashSet<u16>) {
        *self.game_ports.lock().await = ports.clone();

        let mut wanted: HashSet<u16> = self.whitelist.iter().copied().collect();
        wanted.extend(ports);

        let current: HashSet<u16> = self.listeners.lock().await.keys().copied().collect();

        for port in wanted.difference(&current) {
            if *port == MDNS_PORT || *port == SSDP_PORT {
                continue; // already running as multicast listeners
            }
            self.open_listener(*port, ListenerKind::Broadcast).await;
        }
        for port in current.difference(&wanted) {
            if *port == MDNS_PORT || *port == SSDP_PORT {
                continue;
            }
            if let Some(listener) = self.listeners.lock().await.remove(port) {
                listener.stop();
                tracing::info!(port = *port, "listener closed");
            }
        }
    }

    /// A packet arriving from a mesh peer: dedupe and re-emit locally.
    pub async fn handle_remote_packet(&self, packet: BroadcastPacket) {
        if !self
            .dedup
            .check(&packet.payload, packet.src_ip, packet.dst_port)
        {
            return;
        }

        // Remember the payload so our own capture of the injection is not
        // forwarded back into the mesh.
        self.injected_guard.check_payload(&packet.payload);

        if let Err(e) = self.injector.inject(&packet).await {
            tracing::debug!(error = %e, "injection failed");
        }
    }

    pub async fn metrics(&self) -> BroadcastMetrics {
        use std::sync::atomic::Ordering;
        BroadcastMetrics {
            total: self.dedup.metrics.total.load(Ordering::Relaxed),
            forwarded: self.dedup.metrics.forwarded.load(Ordering::Relaxed),
            deduplicated: self.dedup.metrics.deduplicated.load(Ordering::Relaxed),
            dedupe_rate: self.dedup.metrics.dedupe_rate(),
            active_ports: self.listeners.lock().await.keys().copied().collect(),
        }
    }

    async fn open_listener(&self, port: u16, kind: ListenerKind) {
        if self.listeners.lock().await.contains_key(&port) {
            return;
        }
        match PortListener::start(port, kind, self.capture_tx.clone()).await {
            Ok(listener) => {
                self.listeners.lock().await.insert(port, listener);
                tracing::info!(port, "listener opened");
            }
            Err(e) => {
                // Port in use or no multicast permission: skip, keep going.
                tracing::warn!(port, error = %e, "listener skipped");
            }
        }
    }

    /// Fan a locally captured packet out to every peer except its origin.
    async fn forward_to_peers(&self, mut packet: BroadcastPacket) {
        let origin = packet.origin_peer.clone();
        packet.origin_peer = Some(self.local_peer_id.clone());

        let json = serde_json::to_vec(&packet).expect("broadcast packets serialize");
        let peers = self.peers.lock().await.clone();

        for (peer_id, addr) in peers {
            if Some(&peer_id) == origin.as_ref() {
                continue;
            }
            if let Err(e) = self.transport.send_to(&json, addr).await {
                tracing::debug!(peer_id = %peer_id, error = %e, "forward failed");
            }
        }
    }
}

/// Locally captured datagrams: guard against our own injections, dedupe,
/// fan out.
async fn capture_task(
    manager: Arc<BroadcastManager>,
    mut capture_rx: mpsc::Receiver<BroadcastPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            packet = capture_rx.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        // An injection echo: seen payload inside the guard window.
        if !manager.injected_guard.check_payload(&packet.payload) {
            continue;
        }

        if !manager
            .dedup
            .check(&packet.payload, packet.src_ip, packet.dst_port)
        {
            continue;
        }

        manager.forward_to_peers(packet).await;
    }
}

/// Datagrams from mesh peers on the transport socket.
async fn transport_task(manager: Arc<BroadcastManager>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            recv = manager.transport.recv_from(&mut buf) => {
                let Ok((len, from)) = recv else { return };
                match serde_json::from_slice::<BroadcastPacket>(&buf[..len]) {
                    Ok(packet) => manager.handle_remote_packet(packet).await,
                    Err(e) => {
                        tracing::trace!(from = %from, error = %e, "non-broadcast transport datagram");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn prune_task(
    dedup: Arc<Deduplicator>,
    injected_guard: Arc<Deduplicator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                dedup.prune();
                injected_guard.prune();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn load_whitelist(path: &Path) -> HashSet<u16> {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Vec<u16>>(&text) {
            Ok(ports) => ports.into_iter().collect(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "bad whitelist file, ignoring");
                HashSet::new()
            }
        },
        Err(_) => HashSet::new(),
    }
}
