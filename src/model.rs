//! Shared data model: peers, parties, NAT types, relays.
//!
//! These types cross every boundary in the system: the control-plane wire
//! protocol, the persisted server state, and the in-process managers all
//! speak in terms of them, so they live in one place and round-trip through
//! serde without loss.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Classification of the local NAT's mapping/filtering behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    Unknown,
}

impl NatType {
    /// Whether two peers behind these NATs can attempt a direct connection.
    ///
    /// `Unknown` is conservatively treated as `Symmetric`.
    pub fn can_connect_directly(self, other: NatType) -> bool {
        use NatType::*;
        let a = if self == Unknown { Symmetric } else { self };
        let b = if other == Unknown { Symmetric } else { other };

        match (a, b) {
            (Symmetric, Symmetric) => false,
            (Open, _) | (_, Open) => true,
            (FullCone, _) | (_, FullCone) => true,
            // Cone-to-cone works with coordinated hole punching.
            (Symmetric, _) | (_, Symmetric) => false,
            _ => true,
        }
    }

    /// Whether reaching a peer behind this NAT pairing requires hole punching
    /// (as opposed to plain endpoint exchange).
    pub fn needs_hole_punch(self, other: NatType) -> bool {
        use NatType::*;
        self.can_connect_directly(other)
            && !matches!((self, other), (Open, _) | (_, Open) | (FullCone, FullCone))
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NatType::Open => "open",
            NatType::FullCone => "full_cone",
            NatType::RestrictedCone => "restricted_cone",
            NatType::PortRestrictedCone => "port_restricted_cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Identity and liveness of a peer within a party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Opaque globally-unique ID, generated once per installation
    pub peer_id: String,
    /// Display name
    pub name: String,
    /// WireGuard public key, base64 on the wire
    pub public_key: String,
    /// IP:port observed via STUN; absent if classification failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<SocketAddr>,
    /// IP:port of the local bind; used to detect same-LAN peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_endpoint: Option<SocketAddr>,
    pub nat_type: NatType,
    /// Assigned by the party host's IPAM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<Ipv4Addr>,
    /// Unix epoch seconds, refreshed on heartbeat
    pub last_seen: u64,
}

impl PeerInfo {
    /// True when both peers report private endpoints on the same /24
    pub fn same_lan_as(&self, other: &PeerInfo) -> bool {
        match (self.private_endpoint, other.private_endpoint) {
            (Some(SocketAddr::V4(a)), Some(SocketAddr::V4(b))) => {
                let a = a.ip().octets();
                let b = b.ip().octets();
                a[0] == b[0] && a[1] == b[1] && a[2] == b[2]
            }
            _ => false,
        }
    }
}

/// A named set of peers forming a fully connected mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyInfo {
    pub party_id: String,
    pub name: String,
    pub host_peer_id: String,
    /// peer_id -> PeerInfo
    pub peers: HashMap<String, PeerInfo>,
    /// Unix epoch seconds
    pub created_at: u64,
}

impl PartyInfo {
    pub fn host(&self) -> Option<&PeerInfo> {
        self.peers.get(&self.host_peer_id)
    }
}

/// A relay available for forwarding when direct connections are impossible
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub relay_id: String,
    pub endpoint: SocketAddr,
    pub region: String,
    /// Advertised client capacity
    pub capacity: u32,
    /// Unix epoch seconds of the relay's last registration
    pub last_seen: u64,
}

/// How a connection to a peer is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStrategy {
    /// Endpoint is the remote peer's public (or same-LAN private) endpoint
    Direct,
    /// Endpoint is a relay's endpoint
    Relay,
}

/// Aggregated view of the current party for the management collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyStatus {
    pub party: PartyInfo,
    pub local_peer_id: String,
    pub local_nat_type: NatType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_public_endpoint: Option<SocketAddr>,
    pub connections: Vec<PeerConnectionStatus>,
}

/// Per-peer slice of `PartyStatus`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConnectionStatus {
    pub peer_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ConnectionStrategy>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

/// Current wall-clock time as Unix epoch seconds
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use NatType::*;

    #[test]
    fn test_symmetric_pair_cannot_direct() {
        assert!(!Symmetric.can_connect_directly(Symmetric));
        assert!(!Unknown.can_connect_directly(Symmetric));
        assert!(!Unknown.can_connect_directly(Unknown));
    }

    #[test]
    fn test_open_reaches_everything_but_symmetric_pairs() {
        assert!(Open.can_connect_directly(Open));
        assert!(Open.can_connect_directly(FullCone));
        assert!(Open.can_connect_directly(RestrictedCone));
        assert!(Open.can_connect_directly(PortRestrictedCone));
        assert!(Open.can_connect_directly(Symmetric));
    }

    #[test]
    fn test_symmetric_needs_open_or_full_cone() {
        assert!(Symmetric.can_connect_directly(Open));
        assert!(Symmetric.can_connect_directly(FullCone));
        assert!(!Symmetric.can_connect_directly(RestrictedCone));
        assert!(!Symmetric.can_connect_directly(PortRestrictedCone));
    }

    #[test]
    fn test_cone_pairs_punch() {
        assert!(RestrictedCone.can_connect_directly(PortRestrictedCone));
        assert!(RestrictedCone.needs_hole_punch(PortRestrictedCone));
        assert!(PortRestrictedCone.needs_hole_punch(PortRestrictedCone));
        // Open never needs punching.
        assert!(!Open.needs_hole_punch(Symmetric));
        assert!(!FullCone.needs_hole_punch(FullCone));
    }

    #[test]
    fn test_unknown_treated_as_symmetric() {
        assert!(Unknown.can_connect_directly(Open));
        assert!(Unknown.can_connect_directly(FullCone));
        assert!(!Unknown.can_connect_directly(RestrictedCone));
    }

    #[test]
    fn test_party_info_json_roundtrip() {
        let mut peers = HashMap::new();
        peers.insert(
            "p1".to_string(),
            PeerInfo {
                peer_id: "p1".to_string(),
                name: "alice".to_string(),
                public_key: "aGVsbG8=".to_string(),
                public_endpoint: Some("203.0.113.7:51820".parse().unwrap()),
                private_endpoint: Some("192.168.1.10:51820".parse().unwrap()),
                nat_type: FullCone,
                virtual_ip: Some(Ipv4Addr::new(10, 66, 0, 1)),
                last_seen: 1_700_000_000,
            },
        );
        let party = PartyInfo {
            party_id: "alpha".to_string(),
            name: "alpha".to_string(),
            host_peer_id: "p1".to_string(),
            peers,
            created_at: 1_700_000_000,
        };

        let json = serde_json::to_string(&party).unwrap();
        let back: PartyInfo = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string(&back).unwrap();
        assert_eq!(json, rejson);
        assert_eq!(back.host().unwrap().name, "alice");
    }

    #[test]
    fn test_same_lan_detection() {
        let mk = |priv_ep: &str| PeerInfo {
            peer_id: "x".to_string(),
            name: "x".to_string(),
            public_key: String::new(),
            public_endpoint: None,
            private_endpoint: Some(priv_ep.parse().unwrap()),
            nat_type: Unknown,
            virtual_ip: None,
            last_seen: 0,
        };
        assert!(mk("192.168.1.10:1").same_lan_as(&mk("192.168.1.44:2")));
        assert!(!mk("192.168.1.10:1").same_lan_as(&mk("192.168.2.44:2")));
    }
}
