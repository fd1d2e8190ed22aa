//! Per-peer connection lifecycle.
//!
//! Each connected peer gets a record and a monitor task. The monitor
//! measures latency every tick, recovers from transient failures by
//! re-coordinating, switches relays when the current one degrades, and
//! tears the record down once it has been failed for too long.
//!
//! State machine per record:
//! connecting -> active <-> degraded -> failed -> closing -> removed

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::control::ControlPlane;
use crate::error::Result;
use crate::ipam::IpamPool;
use crate::model::{ConnectionStrategy, PeerConnectionStatus, PeerInfo};
use crate::relay::adapter::RelayAdapter;
use crate::tunnel::{Tunnel, WgPeerSpec};

use super::coordinator::{ConnectSignal, ConnectionCoordinator, Coordination};

/// Tunables for the monitor loop
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub monitor_interval: Duration,
    /// Consecutive failures before a reconnect is attempted
    pub reconnect_threshold: u32,
    /// Consecutive failures before the record is marked failed
    pub max_failures: u32,
    pub relay_switch_threshold_ms: f64,
    pub relay_switch_cooldown: Duration,
    pub failed_cleanup_timeout: Duration,
    pub reconnect_backoff_initial: Duration,
    pub reconnect_backoff_cap: Duration,
    pub ewma_alpha: f64,
    pub keepalive: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            reconnect_threshold: 3,
            max_failures: 5,
            relay_switch_threshold_ms: 200.0,
            relay_switch_cooldown: Duration::from_secs(60),
            failed_cleanup_timeout: Duration::from_secs(300),
            reconnect_backoff_initial: Duration::from_secs(5),
            reconnect_backoff_cap: Duration::from_secs(60),
            ewma_alpha: 0.3,
            keepalive: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Degraded,
    Failed,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Failed => "failed",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Everything the rest of the system may want to know about one connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub peer_id: String,
    pub peer_name: String,
    pub virtual_ip: Ipv4Addr,
    pub public_key: String,
    pub strategy: ConnectionStrategy,
    /// The peer's endpoint for direct, the relay's endpoint for relayed
    pub endpoint: SocketAddr,
    pub latency_ewma_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
    pub state: ConnectionState,
    pub failures: u32,
}

struct PeerConnection {
    record: ConnectionRecord,
    adapter: Option<RelayAdapter>,
    monitor_shutdown: watch::Sender<bool>,
    last_measured_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_relay_switch_at: Option<Instant>,
    next_reconnect_at: Option<Instant>,
    reconnect_backoff: Duration,
}

pub struct ConnectionManager {
    tunnel: Arc<dyn Tunnel>,
    control: Arc<dyn ControlPlane>,
    coordinator: Arc<ConnectionCoordinator>,
    ipam: Arc<IpamPool>,
    config: ConnectionConfig,
    connections: Arc<Mutex<HashMap<String, PeerConnection>>>,
}

impl ConnectionManager {
    pub fn new(
        tunnel: Arc<dyn Tunnel>,
        control: Arc<dyn ControlPlane>,
        coordinator: Arc<ConnectionCoordinator>,
        ipam: Arc<IpamPool>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            tunnel,
            control,
            coordinator,
            ipam,
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Establish a connection to `peer_id`: discover, coordinate, install
    /// the WireGuard peer, start monitoring.
    pub async fn connect_to_peer(
        &self,
        party_id: &str,
        local: &PeerInfo,
        peer_id: &str,
    ) -> Result<()> {
        let peer = self
            .control
            .discover_peer(party_id, peer_id)
            .await?
            .ok_or_else(|| crate::error::PartyError::PeerNotFound {
                party_id: party_id.to_string(),
                peer_id: peer_id.to_string(),
            })?;

        let coordination = self
            .coordinator
            .coordinate(party_id, &local.peer_id, local, &peer)
            .await?;

        self.install(party_id, local, peer, coordination).await
    }

    /// Install a peer with an already-decided strategy (the mirror path
    /// driven by incoming signals, and reconnects).
    pub async fn install(
        &self,
        party_id: &str,
        local: &PeerInfo,
        peer: PeerInfo,
        coordination: Coordination,
    ) -> Result<()> {
        // Idempotence: an existing record for this peer is replaced.
        if self.connections.lock().await.contains_key(&peer.peer_id) {
            tracing::debug!(peer_id = %peer.peer_id, "replacing existing connection");
            self.disconnect_from_peer(&peer.peer_id).await?;
        }

        let virtual_ip = match peer.virtual_ip {
            Some(ip) => {
                self.ipam.claim(&peer.peer_id, ip);
                ip
            }
            None => self.ipam.allocate(&peer.peer_id)?,
        };

        let (wg_endpoint, adapter) = match coordination.strategy {
            ConnectionStrategy::Direct => (coordination.endpoint, None),
            ConnectionStrategy::Relay => {
                let adapter = RelayAdapter::start(
                    &local.peer_id,
                    &peer.peer_id,
                    coordination.endpoint,
                )
                .await?;
                (adapter.wireguard_endpoint(), Some(adapter))
            }
        };

        let allowed: Ipv4Net = Ipv4Net::new(virtual_ip, 32).expect("/32 is always valid");
        self.tunnel
            .add_peer(&WgPeerSpec {
                public_key: peer.public_key.clone(),
                endpoint: Some(wg_endpoint),
                allowed_ips: vec![allowed],
                keepalive: self.config.keepalive,
            })
            .await?;

        let record = ConnectionRecord {
            peer_id: peer.peer_id.clone(),
            peer_name: peer.name.clone(),
            virtual_ip,
            public_key: peer.public_key.clone(),
            strategy: coordination.strategy,
            endpoint: coordination.endpoint,
            latency_ewma_ms: None,
            last_latency_ms: None,
            state: ConnectionState::Connecting,
            failures: 0,
        };

        tracing::info!(
            peer_id = %peer.peer_id,
            party_id = %party_id,
            strategy = ?coordination.strategy,
            endpoint = %coordination.endpoint,
            virtual_ip = %virtual_ip,
            best_effort = coordination.best_effort,
            "connection installed"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.connections.lock().await.insert(
            peer.peer_id.clone(),
            PeerConnection {
                record,
                adapter,
                monitor_shutdown: shutdown_tx,
                last_measured_at: None,
                last_failure_at: None,
                last_relay_switch_at: None,
                next_reconnect_at: None,
                reconnect_backoff: self.config.reconnect_backoff_initial,
            },
        );

        self.spawn_monitor(
            party_id.to_string(),
            local.clone(),
            peer.peer_id.clone(),
            shutdown_rx,
        );
        Ok(())
    }

    /// Tear down the connection to `peer_id`. Idempotent.
    pub async fn disconnect_from_peer(&self, peer_id: &str) -> Result<()> {
        let Some(conn) = self.connections.lock().await.remove(peer_id) else {
            return Ok(());
        };

        let _ = conn.monitor_shutdown.send(true);
        if let Some(adapter) = &conn.adapter {
            adapter.stop();
        }
        self.tunnel.remove_peer(&conn.record.public_key).await?;
        self.ipam.release(conn.record.virtual_ip);
        tracing::info!(peer_id = %peer_id, "disconnected");
        Ok(())
    }

    /// Disconnect everything; individual failures are logged, not fatal.
    pub async fn disconnect_all(&self) {
        let peer_ids: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        for peer_id in peer_ids {
            if let Err(e) = self.disconnect_from_peer(&peer_id).await {
                tracing::warn!(peer_id = %peer_id, error = %e, "disconnect failed");
            }
        }
    }

    /// Mark every connection as closing (used when the party disappears
    /// under us) and then tear them down.
    pub async fn close_all(&self) {
        {
            let mut connections = self.connections.lock().await;
            for conn in connections.values_mut() {
                conn.record.state = ConnectionState::Closing;
            }
        }
        self.disconnect_all().await;
    }

    pub async fn record(&self, peer_id: &str) -> Option<ConnectionRecord> {
        self.connections
            .lock()
            .await
            .get(peer_id)
            .map(|c| c.record.clone())
    }

    pub async fn statuses(&self) -> Vec<PeerConnectionStatus> {
        self.connections
            .lock()
            .await
            .values()
            .map(|c| PeerConnectionStatus {
                peer_id: c.record.peer_id.clone(),
                name: c.record.peer_name.clone(),
                virtual_ip: Some(c.record.virtual_ip),
                strategy: Some(c.record.strategy),
                state: c.record.state.to_string(),
                latency_ms: c.record.latency_ewma_ms,
            })
            .collect()
    }

    /// React to a connection signal from another peer.
    pub async fn handle_signal(
        &self,
        party_id: &str,
        local: &PeerInfo,
        from: &str,
        signal: &serde_json::Value,
    ) -> Result<()> {
        let Some(signal) = ConnectSignal::from_value(signal) else {
            tracing::debug!(from = %from, "ignoring unknown signal");
            return Ok(());
        };

        let Some(peer) = self.control.discover_peer(party_id, from).await? else {
            tracing::debug!(from = %from, "signal from peer no longer in party");
            return Ok(());
        };

        match signal {
            ConnectSignal::DirectSelected { endpoint } => {
                if self.record(from).await.is_none() {
                    self.install(
                        party_id,
                        local,
                        peer,
                        Coordination {
                            strategy: ConnectionStrategy::Direct,
                            endpoint,
                            relay: None,
                            best_effort: false,
                        },
                    )
                    .await?;
                }
            }
            ConnectSignal::PunchRequest { endpoint } => {
                // Run the responder burst; if it opens, mirror the direct
                // connection unless one already exists.
                let puncher = crate::nat::punch::HolePuncher::new(self.tunnel.listen_port());
                match puncher.punch(endpoint).await {
                    Ok(observed) => {
                        if self.record(from).await.is_none() {
                            self.install(
                                party_id,
                                local,
                                peer,
                                Coordination {
                                    strategy: ConnectionStrategy::Direct,
                                    endpoint: observed,
                                    relay: None,
                                    best_effort: false,
                                },
                            )
                            .await?;
                        }
                    }
                    Err(e) => {
                        tracing::info!(from = %from, error = %e, "responder punch failed");
                    }
                }
            }
            ConnectSignal::RelaySelected { endpoint, relay_id } => {
                tracing::info!(from = %from, relay = %relay_id, "peer selected relay");
                if self.record(from).await.is_none() {
                    self.install(
                        party_id,
                        local,
                        peer,
                        Coordination {
                            strategy: ConnectionStrategy::Relay,
                            endpoint,
                            relay: None,
                            best_effort: false,
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    fn spawn_monitor(
        &self,
        party_id: String,
        local: PeerInfo,
        peer_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let tunnel = Arc::clone(&self.tunnel);
        let coordinator = Arc::clone(&self.coordinator);
        let connections = Arc::clone(&self.connections);
        let ipam = Arc::clone(&self.ipam);
        let config = self.config.clone();
        let control = Arc::clone(&self.control);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately; skip it so a
            // fresh connection gets one full interval to handshake.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!(peer_id = %peer_id, "monitor cancelled");
                            return;
                        }
                        continue;
                    }
                }

                let virtual_ip = match connections.lock().await.get(&peer_id) {
                    Some(conn) => conn.record.virtual_ip,
                    None => return,
                };

                let measured = tunnel.measure_latency(virtual_ip).await;

                let action = {
                    let mut connections = connections.lock().await;
                    let Some(conn) = connections.get_mut(&peer_id) else {
                        return;
                    };
                    apply_measurement(conn, measured, &config)
                };

                match action {
                    MonitorAction::None => {}
                    MonitorAction::Teardown => {
                        tracing::info!(peer_id = %peer_id, "cleaning up failed connection");
                        let removed = connections.lock().await.remove(&peer_id);
                        if let Some(conn) = removed {
                            if let Some(adapter) = &conn.adapter {
                                adapter.stop();
                            }
                            let _ = tunnel.remove_peer(&conn.record.public_key).await;
                            ipam.release(conn.record.virtual_ip);
                        }
                        return;
                    }
                    MonitorAction::Reconnect => {
                        reconnect(
                            &party_id,
                            &local,
                            &peer_id,
                            &tunnel,
                            &coordinator,
                            &control,
                            &connections,
                            &config,
                        )
                        .await;
                    }
                    MonitorAction::SwitchRelay => {
                        switch_relay(&peer_id, &tunnel, &coordinator, &connections, &config)
                            .await;
                    }
                }
            }
        });
    }
}

enum MonitorAction {
    None,
    Teardown,
    Reconnect,
    SwitchRelay,
}

/// Pure-ish decision step run under the connections lock.
fn apply_measurement(
    conn: &mut PeerConnection,
    measured: Option<f64>,
    config: &ConnectionConfig,
) -> MonitorAction {
    let now = Instant::now();

    if conn.record.state == ConnectionState::Failed {
        let expired = conn
            .last_failure_at
            .map(|at| now.duration_since(at) >= config.failed_cleanup_timeout)
            .unwrap_or(true);
        return if expired {
            conn.record.state = ConnectionState::Closing;
            MonitorAction::Teardown
        } else {
            MonitorAction::None
        };
    }

    match measured {
        Some(ms) => {
            conn.record.failures = 0;
            conn.record.last_latency_ms = Some(ms);
            conn.record.latency_ewma_ms = Some(match conn.record.latency_ewma_ms {
                Some(prev) => config.ewma_alpha * ms + (1.0 - config.ewma_alpha) * prev,
                None => ms,
            });
            conn.last_measured_at = Some(now);
            conn.record.state = ConnectionState::Active;
            conn.reconnect_backoff = config.reconnect_backoff_initial;
            conn.next_reconnect_at = None;

            let cooldown_over = conn
                .last_relay_switch_at
                .map(|at| now.duration_since(at) >= config.relay_switch_cooldown)
                .unwrap_or(true);
            if conn.record.strategy == ConnectionStrategy::Relay
                && ms > config.relay_switch_threshold_ms
                && cooldown_over
            {
                return MonitorAction::SwitchRelay;
            }
            MonitorAction::None
        }
        None => {
            conn.record.failures += 1;
            conn.last_failure_at = Some(now);
            tracing::debug!(
                peer_id = %conn.record.peer_id,
                failures = conn.record.failures,
                "latency measurement failed"
            );

            if conn.record.failures >= config.max_failures {
                conn.record.state = ConnectionState::Failed;
                tracing::warn!(peer_id = %conn.record.peer_id, "connection failed");
                return MonitorAction::None;
            }

            conn.record.state = ConnectionState::Degraded;
            if conn.record.failures >= config.reconnect_threshold {
                let due = conn.next_reconnect_at.map(|at| now >= at).unwrap_or(true);
                if due {
                    conn.next_reconnect_at = Some(now + conn.reconnect_backoff);
                    conn.reconnect_backoff =
                        (conn.reconnect_backoff * 2).min(config.reconnect_backoff_cap);
                    return MonitorAction::Reconnect;
                }
            }
            MonitorAction::None
        }
    }
}

/// Remove and reinstall the peer with a freshly coordinated path.
#[allow(clippy::too_many_arguments)]
async fn reconnect(
    party_id: &str,
    local: &PeerInfo,
    peer_id: &str,
    tunnel: &Arc<dyn Tunnel>,
    coordinator: &Arc<ConnectionCoordinator>,
    control: &Arc<dyn ControlPlane>,
    connections: &Arc<Mutex<HashMap<String, PeerConnection>>>,
    config: &ConnectionConfig,
) {
    tracing::info!(peer_id = %peer_id, "attempting reconnect");

    let peer = match control.discover_peer(party_id, peer_id).await {
        Ok(Some(peer)) => peer,
        Ok(None) => {
            tracing::info!(peer_id = %peer_id, "peer left the party, not reconnecting");
            return;
        }
        Err(e) => {
            tracing::warn!(peer_id = %peer_id, error = %e, "discover failed during reconnect");
            return;
        }
    };

    let coordination = match coordinator
        .coordinate(party_id, &local.peer_id, local, &peer)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(peer_id = %peer_id, error = %e, "re-coordination failed");
            return;
        }
    };

    let mut connections = connections.lock().await;
    let Some(conn) = connections.get_mut(peer_id) else {
        return;
    };

    let (wg_endpoint, adapter) = match coordination.strategy {
        ConnectionStrategy::Direct => (coordination.endpoint, None),
        ConnectionStrategy::Relay => {
            match RelayAdapter::start(&local.peer_id, peer_id, coordination.endpoint).await {
                Ok(adapter) => (adapter.wireguard_endpoint(), Some(adapter)),
                Err(e) => {
                    tracing::warn!(peer_id = %peer_id, error = %e, "relay adapter restart failed");
                    return;
                }
            }
        }
    };

    let _ = tunnel.remove_peer(&conn.record.public_key).await;
    let allowed = Ipv4Net::new(conn.record.virtual_ip, 32).expect("/32 is always valid");
    if let Err(e) = tunnel
        .add_peer(&WgPeerSpec {
            public_key: conn.record.public_key.clone(),
            endpoint: Some(wg_endpoint),
            allowed_ips: vec![allowed],
            keepalive: config.keepalive,
        })
        .await
    {
        tracing::warn!(peer_id = %peer_id, error = %e, "re-add after reconnect failed");
        return;
    }

    if let Some(old) = conn.adapter.take() {
        old.stop();
    }
    conn.adapter = adapter;
    conn.record.strategy = coordination.strategy;
    conn.record.endpoint = coordination.endpoint;
    tracing::info!(
        peer_id = %peer_id,
        strategy = ?coordination.strategy,
        endpoint = %coordination.endpoint,
        "reconnect complete"
    );
}

/// Move a relayed connection to the currently-fastest relay.
async fn switch_relay(
    peer_id: &str,
    tunnel: &Arc<dyn Tunnel>,
    coordinator: &Arc<ConnectionCoordinator>,
    connections: &Arc<Mutex<HashMap<String, PeerConnection>>>,
    config: &ConnectionConfig,
) {
    let best = match coordinator.pick_relay().await {
        Ok(best) => best,
        Err(e) => {
            tracing::debug!(peer_id = %peer_id, error = %e, "no alternative relay");
            return;
        }
    };

    let mut connections = connections.lock().await;
    let Some(conn) = connections.get_mut(peer_id) else {
        return;
    };

    // Stamp the cooldown even when staying put, so a sticky-slow relay is
    // not re-probed every tick.
    conn.last_relay_switch_at = Some(Instant::now());

    if best.endpoint == conn.record.endpoint {
        tracing::debug!(peer_id = %peer_id, "current relay is still the best");
        return;
    }

    tracing::info!(
        peer_id = %peer_id,
        old = %conn.record.endpoint,
        new = %best.endpoint,
        "switching relay"
    );

    if let Some(adapter) = conn.adapter.as_mut() {
        adapter.retarget(best.endpoint);
        // The WireGuard-facing endpoint is unchanged; refresh the peer
        // entry anyway so the keepalive clock restarts promptly.
        let allowed = Ipv4Net::new(conn.record.virtual_ip, 32).expect("/32 is always valid");
        let _ = tunnel
            .add_peer(&WgPeerSpec {
                public_key: conn.record.public_key.clone(),
                endpoint: Some(adapter.wireguard_endpoint()),
                allowed_ips: vec![allowed],
                keepalive: config.keepalive,
            })
            .await;
    }
    conn.record.endpoint = best.endpoint;
    conn.record.latency_ewma_ms = None;
}
