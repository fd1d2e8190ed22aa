//! Virtual IP allocation within the party subnet.
//!
//! Assignments are deterministic: first unused address in ascending order,
//! so the same join order produces the same layout across runs. The network
//! address, the broadcast address, and the host's `.1` are never handed out.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnet::Ipv4Net;

use crate::error::{PartyError, Result};

/// Widest prefix the pool will grow to when the configured subnet fills up
const MIN_PREFIX_LEN: u8 = 16;

struct PoolState {
    subnet: Ipv4Net,
    /// peer_id -> allocated IP
    by_peer: HashMap<String, Ipv4Addr>,
}

/// Deterministic virtual-IP allocator
pub struct IpamPool {
    state: Mutex<PoolState>,
}

impl IpamPool {
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            state: Mutex::new(PoolState {
                subnet,
                by_peer: HashMap::new(),
            }),
        }
    }

    /// The host address of the subnet (`.1`), owned by the party host
    pub fn host_ip(&self) -> Ipv4Addr {
        let state = self.state.lock().unwrap();
        nth_host(state.subnet, 1)
    }

    /// Current subnet (may be wider than configured after expansion)
    pub fn subnet(&self) -> Ipv4Net {
        self.state.lock().unwrap().subnet
    }

    /// Allocate an IP for `peer_id`. Idempotent: a peer that already holds
    /// an address gets the same one back. Guests start at `.2`.
    pub fn allocate(&self, peer_id: &str) -> Result<Ipv4Addr> {
        let mut state = self.state.lock().unwrap();

        if let Some(ip) = state.by_peer.get(peer_id) {
            return Ok(*ip);
        }

        loop {
            if let Some(ip) = first_free(&state) {
                state.by_peer.insert(peer_id.to_string(), ip);
                return Ok(ip);
            }

            // Configured subnet is full; widen one prefix bit at a time
            // rather than fail, until the /16 floor.
            let prefix = state.subnet.prefix_len();
            if prefix <= MIN_PREFIX_LEN {
                return Err(PartyError::PoolExhausted.into());
            }
            let widened = Ipv4Net::new(state.subnet.network(), prefix - 1)
                .expect("prefix already validated")
                .trunc();
            tracing::warn!(
                old = %state.subnet,
                new = %widened,
                "virtual subnet exhausted, widening pool"
            );
            state.subnet = widened;
        }
    }

    /// Record an externally-assigned address (the control plane assigns
    /// virtual IPs at join) so local allocation never collides with it.
    pub fn claim(&self, peer_id: &str, ip: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        state.by_peer.retain(|_, held| *held != ip);
        state.by_peer.insert(peer_id.to_string(), ip);
    }

    /// Mark an IP free. Releasing an address that was never allocated is a
    /// no-op.
    pub fn release(&self, ip: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        state.by_peer.retain(|_, held| *held != ip);
    }

    /// Number of live allocations
    pub fn allocated_count(&self) -> usize {
        self.state.lock().unwrap().by_peer.len()
    }
}

/// The `n`th host address of the subnet (1 = the `.1` host address)
fn nth_host(subnet: Ipv4Net, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + n)
}

fn first_free(state: &PoolState) -> Option<Ipv4Addr> {
    let network = state.subnet.network();
    let broadcast = state.subnet.broadcast();
    let host = nth_host(state.subnet, 1);

    let in_use: std::collections::HashSet<Ipv4Addr> =
        state.by_peer.values().copied().collect();

    let first = u32::from(network) + 2;
    let last = u32::from(broadcast);
    (first..last)
        .map(Ipv4Addr::from)
        .find(|ip| *ip != network && *ip != broadcast && *ip != host && !in_use.contains(ip))
}
