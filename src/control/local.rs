//! File-based control plane for developer and LAN testing.
//!
//! All participating processes point at the same `control_state.json`; each
//! operation is read-modify-write, and incoming signals are discovered by
//! polling. No authentication. The production path is the WebSocket plane
//! in `remote`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{ControlPlaneError, Result};
use crate::model::{PartyInfo, PeerInfo, RelayInfo};

use super::state::ControlState;
use super::{ControlPlane, SignalEnvelope, STALE_PEER_TIMEOUT};

/// Poll cadence for signal discovery
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct LocalControlPlane {
    path: PathBuf,
    max_clients: usize,
    local_peer_id: Mutex<Option<String>>,
    /// Serializes read-modify-write cycles against this state file within
    /// the process; instances sharing a path share the lock. Cross-process
    /// coordination stays best-effort, which is fine for LAN testing.
    io_lock: std::sync::Arc<Mutex<()>>,
}

fn io_lock_for(path: &std::path::Path) -> std::sync::Arc<Mutex<()>> {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex, OnceLock};

    static LOCKS: OnceLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
    locks
        .lock()
        .unwrap()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

impl LocalControlPlane {
    pub fn new(path: PathBuf, max_clients: usize) -> Self {
        let io_lock = io_lock_for(&path);
        Self {
            path,
            max_clients,
            local_peer_id: Mutex::new(None),
            io_lock,
        }
    }

    async fn load(&self) -> Result<ControlState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|_| {
                ControlPlaneError::StateCorrupt {
                    path: self.path.display().to_string(),
                }
                .into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ControlState::default()),
            Err(e) => Err(ControlPlaneError::Io(e).into()),
        }
    }

    async fn store(&self, state: &ControlState) -> Result<()> {
        let json =
            serde_json::to_string_pretty(state).expect("control state is always serializable");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ControlPlaneError::Io)?;
        }
        // Write-then-rename: other processes polling the file must never
        // observe a torn state.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(ControlPlaneError::Io)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(ControlPlaneError::Io)?;
        Ok(())
    }

    /// One read-modify-write cycle under the lock. Also runs the stale
    /// sweep, so LAN testing ages peers out the same way the server does.
    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut ControlState) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.io_lock.lock().await;
        let mut state = self.load().await?;
        state.cleanup_stale(STALE_PEER_TIMEOUT.as_secs());
        let out = apply(&mut state)?;
        self.store(&state).await?;
        Ok(out)
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn register_peer(&self, peer_id: &str) -> Result<()> {
        *self.local_peer_id.lock().await = Some(peer_id.to_string());
        Ok(())
    }

    async fn register_party(
        &self,
        party_id: &str,
        name: &str,
        host: PeerInfo,
    ) -> Result<PartyInfo> {
        self.mutate(|state| state.register_party(party_id, name, host))
            .await
    }

    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo> {
        let max = self.max_clients;
        self.mutate(|state| state.join_party(party_id, peer, max))
            .await
    }

    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()> {
        self.mutate(|state| {
            state.leave_party(party_id, peer_id)?;
            Ok(())
        })
        .await
    }

    async fn update_peer(&self, party_id: &str, peer: PeerInfo) -> Result<()> {
        self.mutate(|state| state.update_peer(party_id, peer)).await
    }

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>> {
        let state = self.load().await?;
        Ok(state.parties.get(party_id).cloned())
    }

    async fn get_peers(&self, party_id: &str) -> Result<Vec<PeerInfo>> {
        let state = self.load().await?;
        Ok(state
            .parties
            .get(party_id)
            .map(|p| p.peers.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn discover_peer(&self, party_id: &str, peer_id: &str) -> Result<Option<PeerInfo>> {
        let state = self.load().await?;
        Ok(state
            .parties
            .get(party_id)
            .and_then(|p| p.peers.get(peer_id))
            .cloned())
    }

    async fn signal_connection(
        &self,
        party_id: &str,
        from: &str,
        to: &str,
        signal: Value,
    ) -> Result<()> {
        self.mutate(|state| {
            state.push_signal(party_id, from, to, signal);
            Ok(())
        })
        .await
    }

    async fn next_signal(&self, timeout: Duration) -> Result<Option<SignalEnvelope>> {
        let me = self
            .local_peer_id
            .lock()
            .await
            .clone()
            .ok_or(ControlPlaneError::Disconnected)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut drained = self
                .mutate(|state| Ok(state.drain_signals_for(&me)))
                .await?;
            if !drained.is_empty() {
                drained.sort_by_key(|s| s.seq);
                let first = drained.remove(0);
                // Put the rest back for the next call, preserving order.
                if !drained.is_empty() {
                    self.mutate(move |state| {
                        state.signals.extend(drained);
                        Ok(())
                    })
                    .await?;
                }
                return Ok(Some(first));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SIGNAL_POLL_INTERVAL.min(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
            ))
            .await;
        }
    }

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()> {
        self.mutate(|state| state.heartbeat(party_id, peer_id)).await
    }

    async fn list_relays(&self) -> Result<Vec<RelayInfo>> {
        let state = self.load().await?;
        Ok(state.relays.values().cloned().collect())
    }
}
