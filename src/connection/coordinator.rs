//! Per-peer strategy selection: direct or relayed, and through which relay.
//!
//! The decision follows the NAT compatibility matrix. When direct is
//! possible the coordinator signals the peer to start punching and runs its
//! own burst; when it is not (or the punch fails) it ranks the available
//! relays by a UDP round-trip probe and picks the fastest. Both sides must
//! use the same relay, so the chosen one is signaled to the peer.

use std::net::SocketAddr;
use std::time::Duration;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control::ControlPlane;
use crate::error::{PeerConnectionError, RelayError, Result};
use crate::model::{ConnectionStrategy, NatType, PeerInfo, RelayInfo};
use crate::nat::punch::HolePuncher;
use crate::nat::NatInfo;
use crate::relay;

/// Deadline for one relay latency probe
const RELAY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Signals exchanged to synchronize connection establishment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectSignal {
    /// The sender is installing you directly at `endpoint`; install the
    /// reciprocal peer (no punching required for this NAT pairing)
    DirectSelected { endpoint: SocketAddr },
    /// Start punching toward `endpoint` now
    PunchRequest { endpoint: SocketAddr },
    /// The sender will reach you through this relay; mirror it
    RelaySelected {
        relay_id: String,
        endpoint: SocketAddr,
    },
}

impl ConnectSignal {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("signals serialize")
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Outcome of coordination for one peer
#[derive(Debug, Clone)]
pub struct Coordination {
    pub strategy: ConnectionStrategy,
    /// The record endpoint: the peer's endpoint for direct, the relay's for
    /// relayed connections
    pub endpoint: SocketAddr,
    pub relay: Option<RelayInfo>,
    /// Set when no relay was available and direct is a blind best-effort
    pub best_effort: bool,
}

pub struct ConnectionCoordinator {
    control: Arc<dyn ControlPlane>,
    puncher: HolePuncher,
    local_nat: NatInfo,
}

impl ConnectionCoordinator {
    pub fn new(control: Arc<dyn ControlPlane>, puncher: HolePuncher, local_nat: NatInfo) -> Self {
        Self {
            control,
            puncher,
            local_nat,
        }
    }

    pub fn local_nat(&self) -> &NatInfo {
        &self.local_nat
    }

    /// Decide how to reach `peer` and prepare the path.
    pub async fn coordinate(
        &self,
        party_id: &str,
        local_peer_id: &str,
        local: &PeerInfo,
        peer: &PeerInfo,
    ) -> Result<Coordination> {
        // Same-LAN shortcut: skip the public internet entirely.
        if local.same_lan_as(peer) {
            if let Some(private) = peer.private_endpoint {
                tracing::info!(peer_id = %peer.peer_id, endpoint = %private, "same LAN, using private endpoint");
                return Ok(Coordination {
                    strategy: ConnectionStrategy::Direct,
                    endpoint: private,
                    relay: None,
                    best_effort: false,
                });
            }
        }

        let my_nat = self.local_nat.nat_type;
        let direct_possible = my_nat.can_connect_directly(peer.nat_type);

        if direct_possible {
            if let Some(remote) = peer.public_endpoint {
                match self
                    .attempt_direct(party_id, local_peer_id, peer, remote, my_nat)
                    .await
                {
                    Ok(endpoint) => {
                        return Ok(Coordination {
                            strategy: ConnectionStrategy::Direct,
                            endpoint,
                            relay: None,
                            best_effort: false,
                        });
                    }
                    Err(e) => {
                        tracing::info!(peer_id = %peer.peer_id, error = %e, "direct path failed, falling back to relay");
                    }
                }
            } else {
                tracing::info!(peer_id = %peer.peer_id, "peer has no public endpoint, trying relay");
            }
        } else {
            tracing::info!(
                peer_id = %peer.peer_id,
                my_nat = %my_nat,
                peer_nat = %peer.nat_type,
                "NAT types incompatible for direct connection"
            );
        }

        self.relay_fallback(party_id, local_peer_id, peer).await
    }

    /// Punch if the NAT pair needs it, otherwise take the endpoint as-is.
    async fn attempt_direct(
        &self,
        party_id: &str,
        local_peer_id: &str,
        peer: &PeerInfo,
        remote: SocketAddr,
        my_nat: NatType,
    ) -> Result<SocketAddr> {
        if !my_nat.needs_hole_punch(peer.nat_type) {
            // Tell the other side to install the reciprocal peer entry.
            if let Some(my_endpoint) = self.local_nat.public_endpoint {
                self.control
                    .signal_connection(
                        party_id,
                        local_peer_id,
                        &peer.peer_id,
                        ConnectSignal::DirectSelected {
                            endpoint: my_endpoint,
                        }
                        .to_value(),
                    )
                    .await?;
            }
            return Ok(remote);
        }

        // Tell the other side to start its burst, then run ours. Both bursts
        // overlapping is what opens the mappings.
        if let Some(my_endpoint) = self.local_nat.public_endpoint {
            self.control
                .signal_connection(
                    party_id,
                    local_peer_id,
                    &peer.peer_id,
                    ConnectSignal::PunchRequest {
                        endpoint: my_endpoint,
                    }
                    .to_value(),
                )
                .await?;
        }

        self.puncher.punch(remote).await
    }

    /// Pick the lowest-latency relay and tell the peer to use it too.
    async fn relay_fallback(
        &self,
        party_id: &str,
        local_peer_id: &str,
        peer: &PeerInfo,
    ) -> Result<Coordination> {
        match self.pick_relay().await {
            Ok(relay) => {
                self.control
                    .signal_connection(
                        party_id,
                        local_peer_id,
                        &peer.peer_id,
                        ConnectSignal::RelaySelected {
                            relay_id: relay.relay_id.clone(),
                            endpoint: relay.endpoint,
                        }
                        .to_value(),
                    )
                    .await?;
                Ok(Coordination {
                    strategy: ConnectionStrategy::Relay,
                    endpoint: relay.endpoint,
                    relay: Some(relay),
                    best_effort: false,
                })
            }
            Err(e) => {
                // No relays: blind direct attempt is better than nothing.
                tracing::debug!(error = %e, "relay selection failed");
                let endpoint =
                    peer.public_endpoint
                        .ok_or_else(|| PeerConnectionError::NoEndpoint {
                            peer_id: peer.peer_id.clone(),
                        })?;
                tracing::warn!(
                    peer_id = %peer.peer_id,
                    endpoint = %endpoint,
                    "no relays available, attempting direct as best effort"
                );
                Ok(Coordination {
                    strategy: ConnectionStrategy::Direct,
                    endpoint,
                    relay: None,
                    best_effort: true,
                })
            }
        }
    }

    /// Probe every known relay and return the fastest responder.
    pub async fn pick_relay(&self) -> Result<RelayInfo> {
        let relays = self.control.list_relays().await?;
        if relays.is_empty() {
            return Err(RelayError::NoRelaysAvailable.into());
        }

        let probes = relays.into_iter().map(|info| async move {
            match relay::probe_latency(info.endpoint, RELAY_PROBE_TIMEOUT).await {
                Ok(rtt) => {
                    tracing::debug!(relay = %info.relay_id, rtt_ms = rtt.as_millis() as u64, "relay probe");
                    Some((rtt, info))
                }
                Err(e) => {
                    tracing::debug!(relay = %info.relay_id, error = %e, "relay probe failed");
                    None
                }
            }
        });

        let results = futures_util::future::join_all(probes).await;
        results
            .into_iter()
            .flatten()
            .min_by_key(|(rtt, _)| *rtt)
            .map(|(_, info)| info)
            .ok_or_else(|| RelayError::NoRelaysAvailable.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_signal_roundtrip() {
        let signal = ConnectSignal::PunchRequest {
            endpoint: "203.0.113.4:51820".parse().unwrap(),
        };
        let value = signal.to_value();
        assert_eq!(value["type"], "punch_request");
        match ConnectSignal::from_value(&value).unwrap() {
            ConnectSignal::PunchRequest { endpoint } => {
                assert_eq!(endpoint.port(), 51820)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_relay_selected_signal_shape() {
        let signal = ConnectSignal::RelaySelected {
            relay_id: "r1".to_string(),
            endpoint: "198.51.100.10:51820".parse().unwrap(),
        };
        let value = signal.to_value();
        assert_eq!(value["type"], "relay_selected");
        assert_eq!(value["relay_id"], "r1");
        assert!(ConnectSignal::from_value(&value).is_some());
        assert!(ConnectSignal::from_value(&serde_json::json!({"type": "bogus"})).is_none());
    }
}
