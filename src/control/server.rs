//! Central control server: party registry, WebSocket signaling hub, relay
//! directory.
//!
//! State mutations are serialized through one command channel consumed by
//! the persister task, which applies them, answers the caller over a
//! oneshot, and batches disk flushes (at most one per second, plus a final
//! flush on shutdown). Reads go straight to the shared snapshot behind a
//! read lock. A background sweep evicts stale peers every minute.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tower_http::trace::TraceLayer;

use crate::error::{ControlPlaneError, LanRageError, Result};
use crate::model::{PartyInfo, PeerInfo, RelayInfo};

use super::protocol::{error_to_wire, ClientMessage, ErrorKind, ServerMessage};
use super::state::ControlState;
use super::{CLEANUP_INTERVAL, STALE_PEER_TIMEOUT};

/// Maximum time mutations sit in memory before a flush
const FLUSH_DELAY: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T>>;

/// Mutations accepted by the persister task
enum Command {
    RegisterParty {
        party_id: String,
        name: String,
        host: PeerInfo,
        reply: Reply<PartyInfo>,
    },
    JoinParty {
        party_id: String,
        peer: PeerInfo,
        reply: Reply<PartyInfo>,
    },
    LeaveParty {
        party_id: String,
        peer_id: String,
        reply: Reply<()>,
    },
    UpdatePeer {
        party_id: String,
        peer: PeerInfo,
        reply: Reply<()>,
    },
    Heartbeat {
        party_id: String,
        peer_id: String,
        reply: Reply<()>,
    },
    PushSignal {
        party_id: String,
        from: String,
        to: String,
        signal: serde_json::Value,
        reply: Reply<u64>,
    },
    RegisterRelay {
        relay: RelayInfo,
        reply: Reply<()>,
    },
    CleanupTick,
    Flush,
}

/// Per-connection sender for pushed frames
type ClientSink = mpsc::Sender<ServerMessage>;

struct Shared {
    state: RwLock<ControlState>,
    commands: mpsc::Sender<Command>,
    /// peer_id -> live WebSocket sink
    clients: tokio::sync::Mutex<HashMap<String, ClientSink>>,
    token: Option<String>,
    max_clients: usize,
}

/// The control server deployment
pub struct ControlServer {
    shared: Arc<Shared>,
    persist_path: PathBuf,
    command_rx: mpsc::Receiver<Command>,
}

impl ControlServer {
    pub async fn new(
        persist_path: PathBuf,
        token: Option<String>,
        max_clients: usize,
    ) -> Result<Self> {
        let state = match tokio::fs::read_to_string(&persist_path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|_| {
                ControlPlaneError::StateCorrupt {
                    path: persist_path.display().to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ControlState::default(),
            Err(e) => return Err(ControlPlaneError::Io(e).into()),
        };

        let (commands, command_rx) = mpsc::channel(256);
        Ok(Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                commands,
                clients: tokio::sync::Mutex::new(HashMap::new()),
                token,
                max_clients,
            }),
            persist_path,
            command_rx,
        })
    }

    /// Serve on `addr` until `shutdown` flips. Runs the persister and the
    /// stale sweep alongside the acceptor.
    pub async fn run(self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(ControlPlaneError::Io)?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already-bound listener (lets tests use an ephemeral port).
    pub async fn run_with_listener(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let ControlServer {
            shared,
            persist_path,
            command_rx,
        } = self;

        let persister = tokio::spawn(persister_task(
            Arc::clone(&shared),
            persist_path,
            command_rx,
        ));

        let sweep_commands = shared.commands.clone();
        let mut sweep_shutdown = shutdown.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let _ = sweep_commands.send(Command::CleanupTick).await;
                    }
                    changed = sweep_shutdown.changed() => {
                        if changed.is_err() || *sweep_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/healthz", get(|| async { "ok" }))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&shared));

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "control server listening");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() || *shutdown.borrow() {
                        tracing::info!("control server shutting down");
                        return;
                    }
                }
            })
            .await
            .map_err(ControlPlaneError::Io)?;

        // Final flush before the persister goes away.
        let _ = shared.commands.send(Command::Flush).await;
        drop(shared);
        sweeper.abort();
        let _ = tokio::time::timeout(Duration::from_secs(5), persister).await;
        Ok(())
    }
}

/// Applies commands, answers callers, and batches disk writes.
async fn persister_task(
    shared: Arc<Shared>,
    path: PathBuf,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut dirty = false;
    let mut flush_deadline: Option<tokio::time::Instant> = None;

    loop {
        let command = if let Some(deadline) = flush_deadline {
            tokio::select! {
                cmd = commands.recv() => cmd,
                _ = tokio::time::sleep_until(deadline) => {
                    flush(&shared, &path).await;
                    dirty = false;
                    flush_deadline = None;
                    continue;
                }
            }
        } else {
            commands.recv().await
        };

        let Some(command) = command else {
            // Channel closed: the server is gone. One last flush.
            if dirty {
                flush(&shared, &path).await;
            }
            return;
        };

        let mutated = apply_command(&shared, command).await;
        if mutated {
            dirty = true;
            if flush_deadline.is_none() {
                flush_deadline = Some(tokio::time::Instant::now() + FLUSH_DELAY);
            }
        }
    }
}

/// Apply one command; returns whether state changed.
async fn apply_command(shared: &Shared, command: Command) -> bool {
    let mut state = shared.state.write().await;
    match command {
        Command::RegisterParty {
            party_id,
            name,
            host,
            reply,
        } => {
            let result = state.register_party(&party_id, &name, host);
            let _ = reply.send(result);
            true
        }
        Command::JoinParty {
            party_id,
            peer,
            reply,
        } => {
            let result = state.join_party(&party_id, peer, shared.max_clients);
            let _ = reply.send(result);
            true
        }
        Command::LeaveParty {
            party_id,
            peer_id,
            reply,
        } => {
            let result = state.leave_party(&party_id, &peer_id).map(|_| ());
            let _ = reply.send(result);
            true
        }
        Command::UpdatePeer {
            party_id,
            peer,
            reply,
        } => {
            let result = state.update_peer(&party_id, peer);
            let _ = reply.send(result);
            true
        }
        Command::Heartbeat {
            party_id,
            peer_id,
            reply,
        } => {
            let result = state.heartbeat(&party_id, &peer_id);
            let _ = reply.send(result);
            true
        }
        Command::PushSignal {
            party_id,
            from,
            to,
            signal,
            reply,
        } => {
            state.push_signal(&party_id, &from, &to, signal);
            let seq = state
                .signals
                .last()
                .map(|s| s.seq)
                .unwrap_or_default();
            let _ = reply.send(Ok(seq));
            true
        }
        Command::RegisterRelay { relay, reply } => {
            state.register_relay(relay);
            let _ = reply.send(Ok(()));
            true
        }
        Command::CleanupTick => {
            let deleted = state.cleanup_stale(STALE_PEER_TIMEOUT.as_secs());
            !deleted.is_empty()
        }
        Command::Flush => true,
    }
}

async fn flush(shared: &Shared, path: &PathBuf) {
    let json = {
        let state = shared.state.read().await;
        serde_json::to_string_pretty(&*state).expect("control state is always serializable")
    };
    if let Err(e) = tokio::fs::write(path, json).await {
        tracing::error!(path = %path.display(), error = %e, "state flush failed");
    } else {
        tracing::debug!(path = %path.display(), "state flushed");
    }
}

async fn ws_upgrade(
    State(shared): State<Arc<Shared>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_client(shared, socket))
}

/// One connected client: authenticate (if a token is configured), register
/// its identity on first use, then service requests until it hangs up.
async fn handle_client(shared: Arc<Shared>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (push_tx, mut push_rx) = mpsc::channel::<ServerMessage>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = push_rx.recv().await {
            let text = serde_json::to_string(&message).expect("server messages serialize");
            if sink.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
    });

    let mut authed = shared.token.is_none();
    let mut peer_id: Option<String> = None;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable client frame");
                continue;
            }
        };
        let request_id = message.request_id();

        // Authentication gate: only Auth passes until the token is shown.
        if !authed {
            match &message {
                ClientMessage::Auth { token, .. } => {
                    if Some(token.as_str()) == shared.token.as_deref() {
                        authed = true;
                        let _ = push_tx.send(ServerMessage::Ok { request_id }).await;
                    } else {
                        let _ = push_tx
                            .send(ServerMessage::Error {
                                request_id,
                                kind: ErrorKind::AuthRejected,
                                message: "invalid token".to_string(),
                            })
                            .await;
                        break;
                    }
                }
                _ => {
                    let _ = push_tx
                        .send(ServerMessage::Error {
                            request_id,
                            kind: ErrorKind::AuthRejected,
                            message: "authenticate first".to_string(),
                        })
                        .await;
                }
            }
            continue;
        }

        let response = dispatch(&shared, &push_tx, &mut peer_id, message).await;
        if let Some(response) = response {
            if push_tx.send(response).await.is_err() {
                break;
            }
        }
    }

    if let Some(peer_id) = peer_id {
        shared.clients.lock().await.remove(&peer_id);
        tracing::debug!(peer_id = %peer_id, "client disconnected");
    }
    writer.abort();
}

async fn send_command<T>(
    shared: &Shared,
    make: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let (reply_tx, reply_rx) = oneshot::channel();
    shared
        .commands
        .send(make(reply_tx))
        .await
        .map_err(|_| ControlPlaneError::Disconnected)?;
    reply_rx
        .await
        .map_err(|_| LanRageError::from(ControlPlaneError::Disconnected))?
}

/// Handle one authenticated request; `None` means the handler already
/// pushed everything it needed to.
async fn dispatch(
    shared: &Shared,
    push_tx: &ClientSink,
    session_peer: &mut Option<String>,
    message: ClientMessage,
) -> Option<ServerMessage> {
    let request_id = message.request_id();

    let result: Result<ServerMessage> = match message {
        ClientMessage::Auth { .. } => Ok(ServerMessage::Ok { request_id }),

        ClientMessage::RegisterPeer { peer_id, .. } => {
            *session_peer = Some(peer_id.clone());
            shared
                .clients
                .lock()
                .await
                .insert(peer_id, push_tx.clone());
            Ok(ServerMessage::Ok { request_id })
        }

        ClientMessage::RegisterParty {
            party_id,
            name,
            host_peer_info,
            ..
        } => send_command(shared, |reply| Command::RegisterParty {
            party_id,
            name,
            host: host_peer_info,
            reply,
        })
        .await
        .map(|party| ServerMessage::Party {
            request_id,
            party: Some(party),
        }),

        ClientMessage::JoinParty {
            party_id,
            peer_info,
            ..
        } => send_command(shared, |reply| Command::JoinParty {
            party_id,
            peer: peer_info,
            reply,
        })
        .await
        .map(|party| ServerMessage::Party {
            request_id,
            party: Some(party),
        }),

        ClientMessage::LeaveParty {
            party_id, peer_id, ..
        } => send_command(shared, |reply| Command::LeaveParty {
            party_id,
            peer_id,
            reply,
        })
        .await
        .map(|_| ServerMessage::Ok { request_id }),

        ClientMessage::UpdatePeer {
            party_id,
            peer_info,
            ..
        } => send_command(shared, |reply| Command::UpdatePeer {
            party_id,
            peer: peer_info,
            reply,
        })
        .await
        .map(|_| ServerMessage::Ok { request_id }),

        ClientMessage::GetParty { party_id, .. } => {
            let state = shared.state.read().await;
            Ok(ServerMessage::Party {
                request_id,
                party: state.parties.get(&party_id).cloned(),
            })
        }

        ClientMessage::GetPeers { party_id, .. } => {
            let state = shared.state.read().await;
            Ok(ServerMessage::Peers {
                request_id,
                peers: state
                    .parties
                    .get(&party_id)
                    .map(|p| p.peers.values().cloned().collect())
                    .unwrap_or_default(),
            })
        }

        ClientMessage::Signal {
            party_id,
            from,
            to,
            signal,
            ..
        } => {
            let seq = send_command(shared, |reply| Command::PushSignal {
                party_id: party_id.clone(),
                from: from.clone(),
                to: to.clone(),
                signal: signal.clone(),
                reply,
            })
            .await;

            match seq {
                Ok(seq) => {
                    forward_signal(shared, &party_id, &from, &to, seq, signal).await;
                    Ok(ServerMessage::Ok { request_id })
                }
                Err(e) => Err(e),
            }
        }

        ClientMessage::Heartbeat {
            party_id, peer_id, ..
        } => send_command(shared, |reply| Command::Heartbeat {
            party_id,
            peer_id,
            reply,
        })
        .await
        .map(|_| ServerMessage::Ok { request_id }),

        ClientMessage::ListRelays { .. } => {
            let state = shared.state.read().await;
            Ok(ServerMessage::Relays {
                request_id,
                relays: state.relays.values().cloned().collect(),
            })
        }

        ClientMessage::RegisterRelay { relay, .. } => {
            send_command(shared, |reply| Command::RegisterRelay { relay, reply })
                .await
                .map(|_| ServerMessage::Ok { request_id })
        }
    };

    Some(result.unwrap_or_else(|err| {
        let (kind, message) = error_to_wire(&err);
        ServerMessage::Error {
            request_id,
            kind,
            message,
        }
    }))
}

/// Push a signal to its recipient if connected; otherwise it stays queued
/// in state for delivery when the recipient reconnects.
async fn forward_signal(
    shared: &Shared,
    party_id: &str,
    from: &str,
    to: &str,
    seq: u64,
    signal: serde_json::Value,
) {
    let sink = shared.clients.lock().await.get(to).cloned();
    let Some(sink) = sink else {
        tracing::debug!(to = %to, "signal recipient offline, queued");
        return;
    };

    let delivered = sink
        .send(ServerMessage::SignalIncoming {
            party_id: party_id.to_string(),
            from: from.to_string(),
            seq,
            signal,
        })
        .await
        .is_ok();

    if delivered {
        // Delivered live; drop the queued copy.
        let mut state = shared.state.write().await;
        state.signals.retain(|s| !(s.to == to && s.seq == seq && s.from == from));
    }
}
