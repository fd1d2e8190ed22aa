//! Party registry state shared by the local plane and the central server.
//!
//! All membership rules live here so both variants behave identically:
//! host-idempotent party registration, capacity limits, virtual-IP
//! assignment at join, host-leave deletion, and the stale-peer sweep.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{PartyError, Result};
use crate::model::{epoch_secs, PartyInfo, PeerInfo, RelayInfo};

use super::SignalEnvelope;

/// The whole registry: parties, relays, undelivered signals.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ControlState {
    pub parties: HashMap<String, PartyInfo>,
    pub relays: HashMap<String, RelayInfo>,
    #[serde(default)]
    pub signals: Vec<SignalEnvelope>,
    /// Per-(from,to) sequence counters for in-order signal delivery
    #[serde(default)]
    pub signal_seq: HashMap<String, u64>,
}

impl ControlState {
    pub fn register_party(
        &mut self,
        party_id: &str,
        name: &str,
        mut host: PeerInfo,
    ) -> Result<PartyInfo> {
        if let Some(existing) = self.parties.get(party_id) {
            if existing.host_peer_id == host.peer_id {
                return Ok(existing.clone());
            }
            return Err(PartyError::PartyExists {
                party_id: party_id.to_string(),
            }
            .into());
        }

        // The host always owns `.1`; guests are assigned from `.2` up.
        if host.virtual_ip.is_none() {
            host.virtual_ip = Some(Ipv4Addr::new(10, 66, 0, 1));
        }
        host.last_seen = epoch_secs();

        let party = PartyInfo {
            party_id: party_id.to_string(),
            name: name.to_string(),
            host_peer_id: host.peer_id.clone(),
            peers: HashMap::from([(host.peer_id.clone(), host)]),
            created_at: epoch_secs(),
        };
        self.parties.insert(party_id.to_string(), party.clone());
        Ok(party)
    }

    pub fn join_party(
        &mut self,
        party_id: &str,
        mut peer: PeerInfo,
        max_clients: usize,
    ) -> Result<PartyInfo> {
        let party = self
            .parties
            .get_mut(party_id)
            .ok_or_else(|| PartyError::PartyNotFound {
                party_id: party_id.to_string(),
            })?;

        if let Some(existing) = party.peers.get(&peer.peer_id) {
            // Re-join keeps the previously assigned address.
            peer.virtual_ip = existing.virtual_ip;
        } else if party.peers.len() >= max_clients {
            return Err(PartyError::PartyFull {
                party_id: party_id.to_string(),
                max: max_clients,
            }
            .into());
        }

        if peer.virtual_ip.is_none() {
            peer.virtual_ip = Some(next_virtual_ip(party));
        }
        peer.last_seen = epoch_secs();
        party.peers.insert(peer.peer_id.clone(), peer);
        Ok(party.clone())
    }

    /// Returns true when the party was deleted (host left or party empty).
    pub fn leave_party(&mut self, party_id: &str, peer_id: &str) -> Result<bool> {
        let Some(party) = self.parties.get_mut(party_id) else {
            return Ok(false); // idempotent
        };

        if party.host_peer_id == peer_id {
            self.parties.remove(party_id);
            return Ok(true);
        }

        party.peers.remove(peer_id);
        if party.peers.is_empty() {
            self.parties.remove(party_id);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn update_peer(&mut self, party_id: &str, peer: PeerInfo) -> Result<()> {
        let party = self
            .parties
            .get_mut(party_id)
            .ok_or_else(|| PartyError::PartyNotFound {
                party_id: party_id.to_string(),
            })?;
        let entry = party
            .peers
            .get_mut(&peer.peer_id)
            .ok_or_else(|| PartyError::PeerNotFound {
                party_id: party_id.to_string(),
                peer_id: peer.peer_id.clone(),
            })?;

        entry.public_endpoint = peer.public_endpoint;
        entry.private_endpoint = peer.private_endpoint;
        entry.nat_type = peer.nat_type;
        entry.name = peer.name;
        entry.last_seen = epoch_secs();
        Ok(())
    }

    pub fn heartbeat(&mut self, party_id: &str, peer_id: &str) -> Result<()> {
        let party = self
            .parties
            .get_mut(party_id)
            .ok_or_else(|| PartyError::PartyNotFound {
                party_id: party_id.to_string(),
            })?;
        let entry = party
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| PartyError::PeerNotFound {
                party_id: party_id.to_string(),
                peer_id: peer_id.to_string(),
            })?;
        entry.last_seen = epoch_secs();
        Ok(())
    }

    /// Queue a signal with the next per-pair sequence number.
    pub fn push_signal(&mut self, party_id: &str, from: &str, to: &str, signal: serde_json::Value) {
        let key = format!("{from}->{to}");
        let seq = self.signal_seq.entry(key).or_insert(0);
        *seq += 1;
        self.signals.push(SignalEnvelope {
            party_id: party_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            seq: *seq,
            signal,
        });
    }

    /// Remove and return all signals addressed to `peer_id`, oldest first.
    pub fn drain_signals_for(&mut self, peer_id: &str) -> Vec<SignalEnvelope> {
        let (mine, rest): (Vec<_>, Vec<_>) = self
            .signals
            .drain(..)
            .partition(|s| s.to == peer_id);
        self.signals = rest;
        mine
    }

    /// Drop peers unseen for longer than `timeout_secs`; delete parties
    /// that become empty or whose host expired. Returns deleted party IDs.
    pub fn cleanup_stale(&mut self, timeout_secs: u64) -> Vec<String> {
        let now = epoch_secs();
        let mut deleted = Vec::new();

        for (party_id, party) in self.parties.iter_mut() {
            party
                .peers
                .retain(|_, peer| now.saturating_sub(peer.last_seen) <= timeout_secs);
            let host_gone = !party.peers.contains_key(&party.host_peer_id);
            if party.peers.is_empty() || host_gone {
                deleted.push(party_id.clone());
            }
        }
        for party_id in &deleted {
            self.parties.remove(party_id);
            tracing::info!(party_id = %party_id, "party removed by stale sweep");
        }

        self.relays
            .retain(|_, relay| now.saturating_sub(relay.last_seen) <= timeout_secs);

        deleted
    }

    pub fn register_relay(&mut self, mut relay: RelayInfo) {
        relay.last_seen = epoch_secs();
        self.relays.insert(relay.relay_id.clone(), relay);
    }
}

/// First unused address after the host's, within the host's /16.
fn next_virtual_ip(party: &PartyInfo) -> Ipv4Addr {
    let base = party
        .host()
        .and_then(|h| h.virtual_ip)
        .unwrap_or(Ipv4Addr::new(10, 66, 0, 1));
    let network = u32::from(base) - 1;

    let in_use: std::collections::HashSet<Ipv4Addr> = party
        .peers
        .values()
        .filter_map(|p| p.virtual_ip)
        .collect();

    (2..u32::from(u16::MAX) as u32)
        .map(|offset| Ipv4Addr::from(network + offset))
        .find(|ip| !in_use.contains(ip))
        .expect("a /16 cannot be fully occupied by a capped party")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NatType;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            peer_id: id.to_string(),
            name: id.to_string(),
            public_key: format!("{id}-key"),
            public_endpoint: None,
            private_endpoint: None,
            nat_type: NatType::Unknown,
            virtual_ip: None,
            last_seen: epoch_secs(),
        }
    }

    #[test]
    fn test_register_party_assigns_host_dot_one() {
        let mut state = ControlState::default();
        let party = state.register_party("pid", "alpha", peer("host")).unwrap();
        assert_eq!(
            party.host().unwrap().virtual_ip,
            Some(Ipv4Addr::new(10, 66, 0, 1))
        );
    }

    #[test]
    fn test_register_party_idempotent_for_same_host() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        let again = state.register_party("pid", "alpha", peer("host")).unwrap();
        assert_eq!(again.party_id, "pid");
    }

    #[test]
    fn test_register_party_conflict_for_other_host() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        let err = state
            .register_party("pid", "alpha", peer("intruder"))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::LanRageError::Party(PartyError::PartyExists { .. })
        ));
    }

    #[test]
    fn test_join_assigns_ascending_guest_ips() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        let p1 = state.join_party("pid", peer("g1"), 255).unwrap();
        assert_eq!(
            p1.peers["g1"].virtual_ip,
            Some(Ipv4Addr::new(10, 66, 0, 2))
        );
        let p2 = state.join_party("pid", peer("g2"), 255).unwrap();
        assert_eq!(
            p2.peers["g2"].virtual_ip,
            Some(Ipv4Addr::new(10, 66, 0, 3))
        );
    }

    #[test]
    fn test_rejoin_keeps_assigned_ip() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        let first = state.join_party("pid", peer("g1"), 255).unwrap();
        let ip = first.peers["g1"].virtual_ip;
        let again = state.join_party("pid", peer("g1"), 255).unwrap();
        assert_eq!(again.peers["g1"].virtual_ip, ip);
        assert_eq!(again.peers.len(), 2);
    }

    #[test]
    fn test_virtual_ips_unique_within_party() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        for i in 0..20 {
            state.join_party("pid", peer(&format!("g{i}")), 255).unwrap();
        }
        let party = &state.parties["pid"];
        let ips: std::collections::HashSet<_> =
            party.peers.values().filter_map(|p| p.virtual_ip).collect();
        assert_eq!(ips.len(), party.peers.len());
    }

    #[test]
    fn test_join_missing_party() {
        let mut state = ControlState::default();
        let err = state.join_party("nope", peer("g1"), 255).unwrap_err();
        assert!(matches!(
            err,
            crate::error::LanRageError::Party(PartyError::PartyNotFound { .. })
        ));
    }

    #[test]
    fn test_party_full() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        state.join_party("pid", peer("g1"), 2).unwrap();
        let err = state.join_party("pid", peer("g2"), 2).unwrap_err();
        assert!(matches!(
            err,
            crate::error::LanRageError::Party(PartyError::PartyFull { .. })
        ));
    }

    #[test]
    fn test_host_leave_deletes_party() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        state.join_party("pid", peer("g1"), 255).unwrap();
        assert!(state.leave_party("pid", "host").unwrap());
        assert!(state.parties.is_empty());
        // Idempotent afterwards.
        assert!(!state.leave_party("pid", "host").unwrap());
    }

    #[test]
    fn test_guest_leave_keeps_party() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        state.join_party("pid", peer("g1"), 255).unwrap();
        assert!(!state.leave_party("pid", "g1").unwrap());
        assert_eq!(state.parties["pid"].peers.len(), 1);
    }

    #[test]
    fn test_heartbeat_unknown_party_errors() {
        let mut state = ControlState::default();
        let err = state.heartbeat("pid", "host").unwrap_err();
        assert!(matches!(
            err,
            crate::error::LanRageError::Party(PartyError::PartyNotFound { .. })
        ));
    }

    #[test]
    fn test_stale_sweep_removes_silent_peers() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        let mut quiet = peer("g1");
        quiet.last_seen = epoch_secs() - 1000;
        state.join_party("pid", quiet, 255).unwrap();
        // join_party refreshes last_seen, so age the entry directly.
        state.parties.get_mut("pid").unwrap().peers.get_mut("g1").unwrap().last_seen =
            epoch_secs() - 1000;

        let deleted = state.cleanup_stale(300);
        assert!(deleted.is_empty());
        assert!(!state.parties["pid"].peers.contains_key("g1"));
    }

    #[test]
    fn test_stale_host_deletes_party() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        state.join_party("pid", peer("g1"), 255).unwrap();
        state
            .parties
            .get_mut("pid")
            .unwrap()
            .peers
            .get_mut("host")
            .unwrap()
            .last_seen = epoch_secs() - 1000;

        let deleted = state.cleanup_stale(300);
        assert_eq!(deleted, vec!["pid".to_string()]);
        assert!(state.parties.is_empty());
    }

    #[test]
    fn test_signal_ordering_per_pair() {
        let mut state = ControlState::default();
        state.push_signal("pid", "a", "b", serde_json::json!({"n": 1}));
        state.push_signal("pid", "a", "b", serde_json::json!({"n": 2}));
        state.push_signal("pid", "c", "b", serde_json::json!({"n": 9}));

        let drained = state.drain_signals_for("b");
        assert_eq!(drained.len(), 3);
        let from_a: Vec<u64> = drained
            .iter()
            .filter(|s| s.from == "a")
            .map(|s| s.seq)
            .collect();
        assert_eq!(from_a, vec![1, 2]);
        assert!(state.signals.is_empty());
    }

    #[test]
    fn test_host_invariant_held() {
        let mut state = ControlState::default();
        state.register_party("pid", "alpha", peer("host")).unwrap();
        state.join_party("pid", peer("g1"), 255).unwrap();
        for party in state.parties.values() {
            assert!(party.peers.contains_key(&party.host_peer_id));
        }
    }
}
