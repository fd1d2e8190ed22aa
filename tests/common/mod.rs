//! Shared harness for end-to-end scenarios: a scriptable tunnel (the one
//! seam the production code stubs), an echo relay with adjustable delay,
//! and a fully wired peer built on the file-based control plane.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};

use lanrage::broadcast::BroadcastManager;
use lanrage::connection::{ConnectionConfig, ConnectionCoordinator, ConnectionManager};
use lanrage::control::local::LocalControlPlane;
use lanrage::control::ControlPlane;
use lanrage::error::Result;
use lanrage::ipam::IpamPool;
use lanrage::logging::NetworkLog;
use lanrage::model::NatType;
use lanrage::nat::punch::HolePuncher;
use lanrage::nat::NatInfo;
use lanrage::party::PartyManager;
use lanrage::tunnel::{InterfaceState, Tunnel, TunnelStatus, WgPeerSpec};

/// Scriptable stand-in for the WireGuard tooling.
pub struct MockTunnel {
    public_key: String,
    listen_port: u16,
    pub peers: Mutex<HashMap<String, WgPeerSpec>>,
    latencies: Mutex<HashMap<Ipv4Addr, Option<f64>>>,
    default_latency: Mutex<Option<f64>>,
}

impl MockTunnel {
    pub async fn new(public_key: &str) -> Arc<Self> {
        // Reserve a genuinely free port for the punch socket.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_port = probe.local_addr().unwrap().port();
        drop(probe);

        Arc::new(Self {
            public_key: public_key.to_string(),
            listen_port,
            peers: Mutex::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
            default_latency: Mutex::new(Some(20.0)),
        })
    }

    /// Script the latency the monitor will observe for `virtual_ip`.
    pub async fn set_latency(&self, virtual_ip: Ipv4Addr, latency: Option<f64>) {
        self.latencies.lock().await.insert(virtual_ip, latency);
    }

    pub async fn set_default_latency(&self, latency: Option<f64>) {
        *self.default_latency.lock().await = latency;
    }

    pub async fn peer_endpoint(&self, public_key: &str) -> Option<SocketAddr> {
        self.peers
            .lock()
            .await
            .get(public_key)
            .and_then(|p| p.endpoint)
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    fn public_key_base64(&self) -> String {
        self.public_key.clone()
    }

    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn add_peer(&self, peer: &WgPeerSpec) -> Result<()> {
        self.peers
            .lock()
            .await
            .insert(peer.public_key.clone(), peer.clone());
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.peers.lock().await.remove(public_key);
        Ok(())
    }

    async fn measure_latency(&self, virtual_ip: Ipv4Addr) -> Option<f64> {
        match self.latencies.lock().await.get(&virtual_ip) {
            Some(value) => *value,
            None => *self.default_latency.lock().await,
        }
    }

    async fn status(&self) -> TunnelStatus {
        let peers = self.peers.lock().await;
        TunnelStatus {
            state: InterfaceState::Active,
            raw_dump: format!("mock interface, {} peers", peers.len()),
            peer_keys: peers.keys().cloned().collect(),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.peers.lock().await.clear();
        Ok(())
    }
}

/// A UDP responder that echoes every datagram back to its sender after a
/// configurable delay. Satisfies the relay latency probe and the adapter's
/// registration traffic.
pub struct EchoRelay {
    pub addr: SocketAddr,
    delay: Arc<Mutex<Duration>>,
}

impl EchoRelay {
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let delay = Arc::new(Mutex::new(Duration::ZERO));

        let task_delay = Arc::clone(&delay);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let wait = *task_delay.lock().await;
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                let _ = socket.send_to(&buf[..len], from).await;
            }
        });

        Self { addr, delay }
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = delay;
    }
}

/// Fast monitor cadence so scenarios settle in well under a second per tick.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        monitor_interval: Duration::from_millis(100),
        ..ConnectionConfig::default()
    }
}

pub struct TestPeer {
    pub name: String,
    pub party: Arc<PartyManager>,
    pub connections: Arc<ConnectionManager>,
    pub tunnel: Arc<MockTunnel>,
    pub broadcast: Arc<BroadcastManager>,
    pub control: Arc<LocalControlPlane>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestPeer {
    /// Build a peer against the shared control-state file in `dir`.
    /// `lan_octet` separates peers into distinct private /24s so the
    /// same-LAN shortcut stays out of the way unless a test wants it.
    pub async fn start(
        dir: &PathBuf,
        name: &str,
        nat_type: NatType,
        lan_octet: u8,
        config: ConnectionConfig,
    ) -> Self {
        let tunnel = MockTunnel::new(&format!("{name}-pubkey")).await;

        let nat_info = NatInfo {
            nat_type,
            public_endpoint: Some(SocketAddr::from(([127, 0, 0, 1], tunnel.listen_port()))),
            local_endpoint: Some(SocketAddr::from((
                [192, 168, lan_octet, 10],
                tunnel.listen_port(),
            ))),
        };

        let control = Arc::new(LocalControlPlane::new(
            dir.join("control_state.json"),
            255,
        ));
        let control_dyn: Arc<dyn ControlPlane> = Arc::clone(&control) as Arc<dyn ControlPlane>;

        let ipam = Arc::new(IpamPool::new("10.66.0.0/16".parse().unwrap()));
        let coordinator = Arc::new(ConnectionCoordinator::new(
            Arc::clone(&control_dyn),
            HolePuncher::new(tunnel.listen_port()),
            nat_info.clone(),
        ));
        let tunnel_dyn: Arc<dyn Tunnel> = Arc::clone(&tunnel) as Arc<dyn Tunnel>;
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&tunnel_dyn),
            Arc::clone(&control_dyn),
            coordinator,
            Arc::clone(&ipam),
            config,
        ));

        let broadcast = BroadcastManager::start(
            name.to_string(),
            0,
            &dir.join(format!("{name}-broadcast-ports.json")),
        )
        .await
        .unwrap();

        let net_log = NetworkLog::start(dir.join(format!("{name}-network.log")));

        let party = Arc::new(
            PartyManager::new(
                Arc::clone(&control_dyn),
                tunnel_dyn,
                Arc::clone(&connections),
                Arc::clone(&broadcast),
                ipam,
                net_log,
                name.to_string(),
                name.to_string(),
                nat_info,
            )
            .with_heartbeat_interval(Duration::from_millis(200)),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&party).heartbeat_loop(shutdown_rx.clone()));
        tokio::spawn(Arc::clone(&party).signal_loop(shutdown_rx));

        Self {
            name: name.to_string(),
            party,
            connections,
            tunnel,
            broadcast,
            control,
            shutdown_tx,
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the connection record for `peer_id` satisfies `check`,
    /// panicking after `deadline`.
    pub async fn wait_for_record<F>(&self, peer_id: &str, deadline: Duration, check: F)
    where
        F: Fn(&lanrage::connection::ConnectionRecord) -> bool,
    {
        let start = tokio::time::Instant::now();
        loop {
            if let Some(record) = self.connections.record(peer_id).await {
                if check(&record) {
                    return;
                }
            }
            if start.elapsed() > deadline {
                let record = self.connections.record(peer_id).await;
                panic!(
                    "{}: record for {peer_id} never satisfied condition; last = {record:?}",
                    self.name
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Seed the shared control state with relays so coordinators can fall back.
pub async fn seed_relays(dir: &PathBuf, relays: &[(&str, SocketAddr)]) {
    use lanrage::control::state::ControlState;
    use lanrage::model::{epoch_secs, RelayInfo};

    let mut state = ControlState::default();
    for (id, addr) in relays {
        state.relays.insert(
            id.to_string(),
            RelayInfo {
                relay_id: id.to_string(),
                endpoint: *addr,
                region: "test".to_string(),
                capacity: 100,
                last_seen: epoch_secs(),
            },
        );
    }
    let json = serde_json::to_string_pretty(&state).unwrap();
    tokio::fs::write(dir.join("control_state.json"), json)
        .await
        .unwrap();
}
