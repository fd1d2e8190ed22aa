//! Control plane: peer discovery, party membership, and signaling.
//!
//! Two variants satisfy the same capability trait: a shared-JSON-file plane
//! for LAN testing and a WebSocket client against the central server. The
//! party manager depends only on the trait.

pub mod local;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod state;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::{PartyInfo, PeerInfo, RelayInfo};

/// Peers silent for this long are swept from their party
pub const STALE_PEER_TIMEOUT: Duration = Duration::from_secs(300);
/// Sweep cadence
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Heartbeat cadence expected from clients
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// An out-of-band signal delivered between two peers of a party.
///
/// Signals from the same sender to the same receiver arrive in `seq` order;
/// nothing is guaranteed across distinct pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub party_id: String,
    pub from: String,
    pub to: String,
    pub seq: u64,
    pub signal: Value,
}

/// The discovery/signaling capability both variants provide.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Claim the local peer identity.
    async fn register_peer(&self, peer_id: &str) -> Result<()>;

    /// Create a party. Idempotent on `party_id` for the same host; another
    /// host claiming the ID fails with `PartyExists`.
    async fn register_party(
        &self,
        party_id: &str,
        name: &str,
        host: PeerInfo,
    ) -> Result<PartyInfo>;

    /// Join an existing party; the returned info includes the joiner with
    /// its assigned virtual IP.
    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo>;

    /// Leave (idempotent). The host leaving deletes the party.
    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()>;

    /// Update mutable fields (endpoints, NAT type, last_seen).
    async fn update_peer(&self, party_id: &str, peer: PeerInfo) -> Result<()>;

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>>;

    async fn get_peers(&self, party_id: &str) -> Result<Vec<PeerInfo>>;

    async fn discover_peer(&self, party_id: &str, peer_id: &str) -> Result<Option<PeerInfo>>;

    /// Deliver `signal` to `to` out-of-band.
    async fn signal_connection(
        &self,
        party_id: &str,
        from: &str,
        to: &str,
        signal: Value,
    ) -> Result<()>;

    /// Wait up to `timeout` for the next signal addressed to the local peer.
    async fn next_signal(&self, timeout: Duration) -> Result<Option<SignalEnvelope>>;

    /// Refresh the local peer's liveness.
    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()>;

    async fn list_relays(&self) -> Result<Vec<RelayInfo>>;

    async fn relays_by_region(&self, region: &str) -> Result<Vec<RelayInfo>> {
        let relays = self.list_relays().await?;
        Ok(relays.into_iter().filter(|r| r.region == region).collect())
    }
}
