//! NAT classification and traversal.
//!
//! Classification probes several public STUN servers from the WireGuard
//! listen port and compares the reflexive endpoints they report. The
//! comparison, not any single reply, is what reveals the NAT's mapping
//! behavior.

pub mod punch;
pub mod stun;

use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::{NatError, Result};
use crate::model::NatType;

/// Public STUN servers probed by default
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Classification result exposed for signaling
#[derive(Debug, Clone)]
pub struct NatInfo {
    pub nat_type: NatType,
    /// Reflexive endpoint, absent when no server answered
    pub public_endpoint: Option<SocketAddr>,
    /// The local bind the probes left from
    pub local_endpoint: Option<SocketAddr>,
}

impl NatInfo {
    /// Fallback used when classification could not run at all; the party
    /// manager then operates in relay-only mode.
    pub fn unknown() -> Self {
        Self {
            nat_type: NatType::Unknown,
            public_endpoint: None,
            local_endpoint: None,
        }
    }
}

/// STUN-based NAT classifier
pub struct NatClassifier {
    servers: Vec<SocketAddr>,
    source_port: u16,
}

impl NatClassifier {
    /// `source_port` should be the WireGuard listen port so the discovered
    /// mapping is the one the tunnel will actually use.
    pub async fn new(source_port: u16) -> Result<Self> {
        let mut servers = Vec::new();
        for host in DEFAULT_STUN_SERVERS {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => {
                    if let Some(addr) = addrs.into_iter().find(SocketAddr::is_ipv4) {
                        servers.push(addr);
                    }
                }
                Err(e) => {
                    tracing::debug!(server = host, error = %e, "STUN server resolution failed");
                }
            }
        }
        Ok(Self {
            servers,
            source_port,
        })
    }

    /// Probe all servers and classify. No responses yields `Unknown`
    /// rather than an error; callers degrade to relay-only.
    pub async fn classify(&self) -> Result<NatInfo> {
        let socket = bind_probe_socket(self.source_port).await?;
        let local_ip = detect_local_ip().await?;
        let local = SocketAddr::new(local_ip, self.source_port);

        let replies = stun::probe_all(&socket, &self.servers).await?;
        let reflexives: Vec<SocketAddr> = replies.iter().map(|r| r.reflexive).collect();

        let nat_type = classify_reflexives(local, &reflexives);
        let public_endpoint = most_common(&reflexives);

        tracing::info!(
            nat_type = %nat_type,
            public = ?public_endpoint,
            replies = replies.len(),
            "NAT classification complete"
        );

        Ok(NatInfo {
            nat_type,
            public_endpoint,
            local_endpoint: Some(local),
        })
    }
}

/// Bind the probe socket with address reuse so WireGuard can take the same
/// port afterwards.
async fn bind_probe_socket(port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(crate::error::StunError::Io)?;
    socket
        .set_reuse_address(true)
        .map_err(crate::error::StunError::Io)?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("static addr");
    socket
        .bind(&addr.into())
        .map_err(crate::error::StunError::Io)?;
    socket
        .set_nonblocking(true)
        .map_err(crate::error::StunError::Io)?;

    UdpSocket::from_std(socket.into())
        .map_err(crate::error::StunError::Io)
        .map_err(Into::into)
}

/// The OS picks the outbound interface for a connected UDP socket; its
/// local address is our LAN-facing IP. No packets are sent.
async fn detect_local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| NatError::LocalAddress {
            reason: e.to_string(),
        })?;
    socket
        .connect("8.8.8.8:53")
        .await
        .map_err(|e| NatError::LocalAddress {
            reason: e.to_string(),
        })?;
    socket
        .local_addr()
        .map(|a| a.ip())
        .map_err(|e| NatError::LocalAddress {
            reason: e.to_string(),
        })
        .map_err(Into::into)
}

/// Core classification rule over the reflexive endpoints seen by each
/// server (all probes shared one source port).
fn classify_reflexives(local: SocketAddr, reflexives: &[SocketAddr]) -> NatType {
    if reflexives.is_empty() {
        return NatType::Unknown;
    }

    let first = reflexives[0];
    let all_identical = reflexives.iter().all(|r| *r == first);

    if all_identical {
        return if first == local {
            NatType::Open
        } else {
            NatType::FullCone
        };
    }

    let all_distinct = {
        let mut seen = std::collections::HashSet::new();
        reflexives.iter().all(|r| seen.insert(*r))
    };
    if all_distinct {
        return NatType::Symmetric;
    }

    // Mixed agreement. If every server saw the same IP and only ports
    // wander, the filter is per-port; otherwise treat it as address
    // restricted. The two classes are equivalent for compatibility.
    let first_ip = first.ip();
    if reflexives.iter().all(|r| r.ip() == first_ip) {
        NatType::PortRestrictedCone
    } else {
        NatType::RestrictedCone
    }
}

/// Most frequently reported reflexive endpoint
fn most_common(reflexives: &[SocketAddr]) -> Option<SocketAddr> {
    let mut counts: std::collections::HashMap<SocketAddr, usize> = std::collections::HashMap::new();
    for r in reflexives {
        *counts.entry(*r).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(addr, _)| addr)
}
