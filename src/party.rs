//! Party orchestration: create/join/leave and connection fan-out.
//!
//! The party manager builds the local peer's identity from the tunnel and
//! NAT classifier, talks to the control plane for membership, and drives
//! the connection manager for every other member. Its background loops
//! heartbeat the control plane and react to incoming connection signals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::Instrument;
use uuid::Uuid;

use crate::broadcast::BroadcastManager;
use crate::connection::ConnectionManager;
use crate::control::{ControlPlane, HEARTBEAT_INTERVAL};
use crate::error::{LanRageError, PartyError, Result};
use crate::ipam::IpamPool;
use crate::logging::{connection_span, NetworkLog};
use crate::model::{epoch_secs, NatType, PartyInfo, PartyStatus, PeerInfo};
use crate::nat::NatInfo;
use crate::tunnel::Tunnel;

/// How long one `next_signal` poll waits before looping
const SIGNAL_POLL: Duration = Duration::from_secs(1);

pub struct PartyManager {
    control: Arc<dyn ControlPlane>,
    tunnel: Arc<dyn Tunnel>,
    connections: Arc<ConnectionManager>,
    broadcast: Arc<BroadcastManager>,
    ipam: Arc<IpamPool>,
    net_log: NetworkLog,
    peer_id: String,
    peer_name: String,
    session_id: String,
    nat_info: NatInfo,
    heartbeat_interval: Duration,
    current_party: Mutex<Option<PartyInfo>>,
}

impl PartyManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<dyn ControlPlane>,
        tunnel: Arc<dyn Tunnel>,
        connections: Arc<ConnectionManager>,
        broadcast: Arc<BroadcastManager>,
        ipam: Arc<IpamPool>,
        net_log: NetworkLog,
        peer_id: String,
        peer_name: String,
        nat_info: NatInfo,
    ) -> Self {
        if nat_info.nat_type == NatType::Unknown && nat_info.public_endpoint.is_none() {
            tracing::warn!("NAT classification unavailable, operating in relay-only mode");
        }
        Self {
            control,
            tunnel,
            connections,
            broadcast,
            ipam,
            net_log,
            peer_id,
            peer_name,
            session_id: Uuid::new_v4().to_string(),
            nat_info,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            current_party: Mutex::new(None),
        }
    }

    /// Shrink the heartbeat cadence (used by tests; production keeps the
    /// default).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn nat_info(&self) -> &NatInfo {
        &self.nat_info
    }

    /// The local peer as seen by the rest of the party.
    pub fn self_peer_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            name: self.peer_name.clone(),
            public_key: self.tunnel.public_key_base64(),
            public_endpoint: self.nat_info.public_endpoint,
            private_endpoint: self.nat_info.local_endpoint,
            nat_type: self.nat_info.nat_type,
            virtual_ip: None,
            last_seen: epoch_secs(),
        }
    }

    /// Create a party and become its host, owning `.1`.
    pub async fn create_party(&self, name: &str) -> Result<PartyInfo> {
        let party_id = Uuid::new_v4().to_string();
        let span = connection_span(&self.peer_id, &party_id, &self.session_id, &correlation());
        self.create_party_inner(party_id, name).instrument(span).await
    }

    async fn create_party_inner(&self, party_id: String, name: &str) -> Result<PartyInfo> {
        self.control.register_peer(&self.peer_id).await?;
        let party = self
            .control
            .register_party(&party_id, name, self.self_peer_info())
            .await?;

        if let Some(host_ip) = party.host().and_then(|h| h.virtual_ip) {
            self.ipam.claim(&self.peer_id, host_ip);
        }

        *self.current_party.lock().await = Some(party.clone());
        self.net_log
            .record(&format!("party created party_id={party_id} name={name}"));
        tracing::info!(party_id = %party_id, name = %name, "party created");
        Ok(party)
    }

    /// Join an existing party and fan out connections to everyone in it.
    pub async fn join_party(&self, party_id: &str) -> Result<PartyInfo> {
        let span = connection_span(&self.peer_id, party_id, &self.session_id, &correlation());
        self.join_party_inner(party_id).instrument(span).await
    }

    async fn join_party_inner(&self, party_id: &str) -> Result<PartyInfo> {
        self.control.register_peer(&self.peer_id).await?;
        let party = self
            .control
            .join_party(party_id, self.self_peer_info())
            .await?;

        if let Some(my_ip) = party.peers.get(&self.peer_id).and_then(|p| p.virtual_ip) {
            self.ipam.claim(&self.peer_id, my_ip);
        }

        *self.current_party.lock().await = Some(party.clone());
        self.net_log
            .record(&format!("party joined party_id={party_id}"));

        let local = party
            .peers
            .get(&self.peer_id)
            .cloned()
            .unwrap_or_else(|| self.self_peer_info());

        // Connect to every existing member concurrently; individual
        // failures surface in the records, not here.
        let others: Vec<PeerInfo> = party
            .peers
            .values()
            .filter(|p| p.peer_id != self.peer_id)
            .cloned()
            .collect();
        let attempts = others.iter().map(|peer| {
            let connections = Arc::clone(&self.connections);
            let local = local.clone();
            let party_id = party_id.to_string();
            let peer_id = peer.peer_id.clone();
            async move {
                if let Err(e) = connections
                    .connect_to_peer(&party_id, &local, &peer_id)
                    .await
                {
                    tracing::warn!(peer_id = %peer_id, error = %e, "fan-out connect failed");
                } else {
                    peer_registered(&connections, &peer_id).await;
                }
                peer_id
            }
        });
        let connected = futures_util::future::join_all(attempts).await;

        for peer in &others {
            if let Some(vip) = peer.virtual_ip {
                self.broadcast.register_peer(&peer.peer_id, vip).await;
            }
        }

        tracing::info!(
            party_id = %party_id,
            peers = connected.len(),
            "join complete"
        );
        Ok(party)
    }

    /// Leave the current party, tearing down every connection first.
    pub async fn leave_party(&self) -> Result<()> {
        let Some(party) = self.current_party.lock().await.take() else {
            return Err(PartyError::NotInParty.into());
        };
        let span = connection_span(
            &self.peer_id,
            &party.party_id,
            &self.session_id,
            &correlation(),
        );
        self.leave_party_inner(party).instrument(span).await
    }

    async fn leave_party_inner(&self, party: PartyInfo) -> Result<()> {
        for peer_id in party.peers.keys().filter(|id| **id != self.peer_id) {
            self.broadcast.unregister_peer(peer_id).await;
        }
        self.connections.disconnect_all().await;

        if let Err(e) = self
            .control
            .leave_party(&party.party_id, &self.peer_id)
            .await
        {
            tracing::warn!(error = %e, "control plane leave failed");
        }
        self.net_log
            .record(&format!("party left party_id={}", party.party_id));
        tracing::info!(party_id = %party.party_id, "left party");
        Ok(())
    }

    /// Current party with live per-peer connection state.
    pub async fn status(&self) -> Result<PartyStatus> {
        let current = self.current_party.lock().await.clone();
        let Some(mut party) = current else {
            return Err(PartyError::NotInParty.into());
        };

        // Refresh membership; the party may have changed under us.
        if let Some(fresh) = self.control.get_party(&party.party_id).await? {
            *self.current_party.lock().await = Some(fresh.clone());
            party = fresh;
        }

        let mut connections = self.connections.statuses().await;
        // On-demand measurement beats a 30 s old EWMA for the status view.
        for status in &mut connections {
            if let Some(vip) = status.virtual_ip {
                if let Some(ms) = self.tunnel.measure_latency(vip).await {
                    status.latency_ms = Some(ms);
                }
            }
        }

        Ok(PartyStatus {
            party,
            local_peer_id: self.peer_id.clone(),
            local_nat_type: self.nat_info.nat_type,
            local_public_endpoint: self.nat_info.public_endpoint,
            connections,
        })
    }

    /// Heartbeat loop: refresh liveness every 30 s; a `PartyNotFound`
    /// answer means the party was deleted (host left or sweep) and every
    /// connection must come down.
    pub async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            let party_id = match &*self.current_party.lock().await {
                Some(party) => party.party_id.clone(),
                None => continue,
            };

            match self.control.heartbeat(&party_id, &self.peer_id).await {
                Ok(()) => {}
                Err(LanRageError::Party(PartyError::PartyNotFound { .. })) => {
                    tracing::info!(party_id = %party_id, "party gone, closing connections");
                    self.net_log
                        .record(&format!("party deleted party_id={party_id}"));
                    self.connections.close_all().await;
                    *self.current_party.lock().await = None;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "heartbeat failed");
                }
            }
        }
    }

    /// Signal loop: deliver punch/relay requests to the connection manager
    /// and register newly connected peers as broadcast targets.
    pub async fn signal_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let envelope = tokio::select! {
                result = self.control.next_signal(SIGNAL_POLL) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            };

            let envelope = match envelope {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "signal poll failed");
                    tokio::time::sleep(SIGNAL_POLL).await;
                    continue;
                }
            };

            let party_id = envelope.party_id.clone();
            let in_party = self
                .current_party
                .lock()
                .await
                .as_ref()
                .map(|p| p.party_id == party_id)
                .unwrap_or(false);
            if !in_party {
                tracing::debug!(party_id = %party_id, "signal for a party we are not in");
                continue;
            }

            let local = self.self_peer_info();
            if let Err(e) = self
                .connections
                .handle_signal(&party_id, &local, &envelope.from, &envelope.signal)
                .await
            {
                tracing::warn!(from = %envelope.from, error = %e, "signal handling failed");
            } else {
                peer_registered(&self.connections, &envelope.from).await;
                if let Some(record) = self.connections.record(&envelope.from).await {
                    self.broadcast
                        .register_peer(&envelope.from, record.virtual_ip)
                        .await;
                }
            }
        }
    }
}

/// Trace the installed record for a freshly connected peer.
async fn peer_registered(connections: &Arc<ConnectionManager>, peer_id: &str) {
    if let Some(record) = connections.record(peer_id).await {
        tracing::debug!(
            peer_id = %peer_id,
            strategy = ?record.strategy,
            endpoint = %record.endpoint,
            "connection record present"
        );
    }
}

fn correlation() -> String {
    Uuid::new_v4().to_string()
}
