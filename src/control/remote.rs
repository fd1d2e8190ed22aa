//! WebSocket control plane client.
//!
//! One persistent connection to the central server, re-established with
//! exponential backoff (1 s doubling to 60 s). Requests are correlated to
//! responses by `request_id`; unsolicited `signal_incoming` frames land in
//! the signal queue read by `next_signal`. If a bearer token is configured
//! it is presented as the first message after every (re)connect, and the
//! peer identity is re-registered so the server's push routing survives
//! reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{ControlPlaneError, Result};
use crate::model::{PartyInfo, PeerInfo, RelayInfo};

use super::protocol::{error_from_wire, ClientMessage, ServerMessage};
use super::{ControlPlane, SignalEnvelope};

/// Per-request deadline
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Reconnect backoff bounds
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

struct Inner {
    url: String,
    token: Option<String>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>,
    outgoing: mpsc::Sender<ClientMessage>,
    signals: Mutex<mpsc::Receiver<SignalEnvelope>>,
    local_peer_id: Mutex<Option<String>>,
}

pub struct RemoteControlPlane {
    inner: Arc<Inner>,
}

impl RemoteControlPlane {
    /// Start the connection task and return the handle. The task honors
    /// `shutdown` and dies with it.
    pub fn connect(url: String, token: Option<String>, shutdown: watch::Receiver<bool>) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        let (signal_tx, signal_rx) = mpsc::channel(256);

        let inner = Arc::new(Inner {
            url,
            token,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outgoing: outgoing_tx,
            signals: Mutex::new(signal_rx),
            local_peer_id: Mutex::new(None),
        });

        tokio::spawn(connection_task(
            Arc::clone(&inner),
            outgoing_rx,
            signal_tx,
            shutdown,
        ));

        Self { inner }
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientMessage) -> Result<ServerMessage> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(request_id, reply_tx);

        let message = build(request_id);
        if self.inner.outgoing.send(message).await.is_err() {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(ControlPlaneError::Disconnected.into());
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ControlPlaneError::Disconnected.into()),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(crate::error::LanRageError::Timeout {
                    operation: "control plane request".to_string(),
                    seconds: REQUEST_TIMEOUT.as_secs(),
                })
            }
        }
    }

    fn expect_party(response: ServerMessage, op: &str, context: &str) -> Result<PartyInfo> {
        match response {
            ServerMessage::Party {
                party: Some(party), ..
            } => Ok(party),
            ServerMessage::Error { kind, message, .. } => {
                Err(error_from_wire(kind, message, context))
            }
            _ => Err(ControlPlaneError::UnexpectedResponse { op: op.to_string() }.into()),
        }
    }

    fn expect_ok(response: ServerMessage, op: &str, context: &str) -> Result<()> {
        match response {
            ServerMessage::Ok { .. } => Ok(()),
            ServerMessage::Error { kind, message, .. } => {
                Err(error_from_wire(kind, message, context))
            }
            _ => Err(ControlPlaneError::UnexpectedResponse { op: op.to_string() }.into()),
        }
    }
}

/// Owns the socket: connect, authenticate, pump frames, reconnect forever.
async fn connection_task(
    inner: Arc<Inner>,
    mut outgoing: mpsc::Receiver<ClientMessage>,
    signal_tx: mpsc::Sender<SignalEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let stream = tokio::select! {
            connected = connect_async(inner.url.as_str()) => connected,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        };

        let (mut ws, _) = match stream {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(url = %inner.url, error = %e, backoff = ?backoff, "control server unreachable");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };

        tracing::info!(url = %inner.url, "control server connected");
        backoff = BACKOFF_INITIAL;

        // Re-establish session state: token first, then identity.
        if let Some(token) = &inner.token {
            let auth = ClientMessage::Auth {
                request_id: inner.next_request_id.fetch_add(1, Ordering::Relaxed),
                token: token.clone(),
            };
            let text = serde_json::to_string(&auth).expect("client messages serialize");
            if ws.send(Message::Text(text.into())).await.is_err() {
                continue;
            }
        }
        if let Some(peer_id) = inner.local_peer_id.lock().await.clone() {
            let register = ClientMessage::RegisterPeer {
                request_id: inner.next_request_id.fetch_add(1, Ordering::Relaxed),
                peer_id,
            };
            let text = serde_json::to_string(&register).expect("client messages serialize");
            if ws.send(Message::Text(text.into())).await.is_err() {
                continue;
            }
        }

        // Pump until the socket dies or shutdown is requested.
        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            handle_server_frame(&inner, &signal_tx, &text).await;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(_)) | Some(Err(_)) | None => break,
                    }
                }
                request = outgoing.recv() => {
                    let Some(request) = request else { return };
                    let text = serde_json::to_string(&request)
                        .expect("client messages serialize");
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            }
        }

        // Connection lost: nobody will answer what is in flight.
        let mut pending = inner.pending.lock().await;
        let dropped = pending.len();
        pending.clear();
        drop(pending);
        if dropped > 0 {
            tracing::warn!(dropped, "connection lost with requests in flight");
        }
    }
}

async fn handle_server_frame(
    inner: &Inner,
    signal_tx: &mpsc::Sender<SignalEnvelope>,
    text: &str,
) {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable server frame");
            return;
        }
    };

    match message {
        ServerMessage::SignalIncoming {
            party_id,
            from,
            seq,
            signal,
        } => {
            let me = inner.local_peer_id.lock().await.clone().unwrap_or_default();
            let envelope = SignalEnvelope {
                party_id,
                from,
                to: me,
                seq,
                signal,
            };
            if signal_tx.send(envelope).await.is_err() {
                tracing::debug!("signal queue closed");
            }
        }
        ServerMessage::Ok { request_id }
        | ServerMessage::Party { request_id, .. }
        | ServerMessage::Peers { request_id, .. }
        | ServerMessage::Relays { request_id, .. }
        | ServerMessage::Error { request_id, .. } => {
            if let Some(reply) = inner.pending.lock().await.remove(&request_id) {
                let _ = reply.send(message);
            }
            // Unmatched IDs belong to fire-and-forget auth/register frames.
        }
    }
}

#[async_trait]
impl ControlPlane for RemoteControlPlane {
    async fn register_peer(&self, peer_id: &str) -> Result<()> {
        *self.inner.local_peer_id.lock().await = Some(peer_id.to_string());
        let peer_id = peer_id.to_string();
        let response = self
            .request(|request_id| ClientMessage::RegisterPeer {
                request_id,
                peer_id: peer_id.clone(),
            })
            .await?;
        Self::expect_ok(response, "register_peer", &peer_id)
    }

    async fn register_party(
        &self,
        party_id: &str,
        name: &str,
        host: PeerInfo,
    ) -> Result<PartyInfo> {
        let response = self
            .request(|request_id| ClientMessage::RegisterParty {
                request_id,
                party_id: party_id.to_string(),
                name: name.to_string(),
                host_peer_info: host.clone(),
            })
            .await?;
        Self::expect_party(response, "register_party", party_id)
    }

    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo> {
        let response = self
            .request(|request_id| ClientMessage::JoinParty {
                request_id,
                party_id: party_id.to_string(),
                peer_info: peer.clone(),
            })
            .await?;
        Self::expect_party(response, "join_party", party_id)
    }

    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()> {
        let response = self
            .request(|request_id| ClientMessage::LeaveParty {
                request_id,
                party_id: party_id.to_string(),
                peer_id: peer_id.to_string(),
            })
            .await?;
        Self::expect_ok(response, "leave_party", party_id)
    }

    async fn update_peer(&self, party_id: &str, peer: PeerInfo) -> Result<()> {
        let response = self
            .request(|request_id| ClientMessage::UpdatePeer {
                request_id,
                party_id: party_id.to_string(),
                peer_info: peer.clone(),
            })
            .await?;
        Self::expect_ok(response, "update_peer", party_id)
    }

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>> {
        let response = self
            .request(|request_id| ClientMessage::GetParty {
                request_id,
                party_id: party_id.to_string(),
            })
            .await?;
        match response {
            ServerMessage::Party { party, .. } => Ok(party),
            ServerMessage::Error { kind, message, .. } => {
                Err(error_from_wire(kind, message, party_id))
            }
            _ => Err(ControlPlaneError::UnexpectedResponse {
                op: "get_party".to_string(),
            }
            .into()),
        }
    }

    async fn get_peers(&self, party_id: &str) -> Result<Vec<PeerInfo>> {
        let response = self
            .request(|request_id| ClientMessage::GetPeers {
                request_id,
                party_id: party_id.to_string(),
            })
            .await?;
        match response {
            ServerMessage::Peers { peers, .. } => Ok(peers),
            ServerMessage::Error { kind, message, .. } => {
                Err(error_from_wire(kind, message, party_id))
            }
            _ => Err(ControlPlaneError::UnexpectedResponse {
                op: "get_peers".to_string(),
            }
            .into()),
        }
    }

    async fn discover_peer(&self, party_id: &str, peer_id: &str) -> Result<Option<PeerInfo>> {
        let party = self.get_party(party_id).await?;
        Ok(party.and_then(|p| p.peers.get(peer_id).cloned()))
    }

    async fn signal_connection(
        &self,
        party_id: &str,
        from: &str,
        to: &str,
        signal: Value,
    ) -> Result<()> {
        let response = self
            .request(|request_id| ClientMessage::Signal {
                request_id,
                party_id: party_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                signal: signal.clone(),
            })
            .await?;
        Self::expect_ok(response, "signal", party_id)
    }

    async fn next_signal(&self, timeout: Duration) -> Result<Option<SignalEnvelope>> {
        let mut signals = self.inner.signals.lock().await;
        match tokio::time::timeout(timeout, signals.recv()).await {
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => Err(ControlPlaneError::Disconnected.into()),
            Err(_) => Ok(None),
        }
    }

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()> {
        let response = self
            .request(|request_id| ClientMessage::Heartbeat {
                request_id,
                party_id: party_id.to_string(),
                peer_id: peer_id.to_string(),
            })
            .await?;
        Self::expect_ok(response, "heartbeat", party_id)
    }

    async fn list_relays(&self) -> Result<Vec<RelayInfo>> {
        let response = self
            .request(|request_id| ClientMessage::ListRelays { request_id })
            .await?;
        match response {
            ServerMessage::Relays { relays, .. } => Ok(relays),
            ServerMessage::Error { kind, message, .. } => {
                Err(error_from_wire(kind, message, "list_relays"))
            }
            _ => Err(ControlPlaneError::UnexpectedResponse {
                op: "list_relays".to_string(),
            }
            .into()),
        }
    }
}

impl RemoteControlPlane {
    /// Announce a relay deployment to the directory (relay mode only).
    pub async fn register_relay(&self, relay: RelayInfo) -> Result<()> {
        let response = self
            .request(|request_id| ClientMessage::RegisterRelay {
                request_id,
                relay: relay.clone(),
            })
            .await?;
        Self::expect_ok(response, "register_relay", &relay.relay_id)
    }
}
