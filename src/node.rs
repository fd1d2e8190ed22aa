//! Top-level client node: wires every subsystem together and exposes the
//! surface the management collaborator drives (initialize, party
//! operations, status, shutdown).

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broadcast::BroadcastManager;
use crate::config::Settings;
use crate::connection::{ConnectionConfig, ConnectionCoordinator, ConnectionManager};
use crate::control::{local::LocalControlPlane, remote::RemoteControlPlane, ControlPlane};
use crate::error::{Result, WireGuardError};
use crate::ipam::IpamPool;
use crate::logging::NetworkLog;
use crate::model::{PartyInfo, PartyStatus, RelayInfo};
use crate::nat::punch::HolePuncher;
use crate::nat::{NatClassifier, NatInfo};
use crate::party::PartyManager;
use crate::tasks::{TaskManager, SHUTDOWN_DEADLINE};
use crate::tunnel::{KeyPair, Tunnel, WgTunnel};

struct Runtime {
    party: Arc<PartyManager>,
    tunnel: Arc<dyn Tunnel>,
    control: Arc<dyn ControlPlane>,
    broadcast: Arc<BroadcastManager>,
}

/// One LANrage client process
pub struct Node {
    settings: Settings,
    tasks: TaskManager,
    runtime: Mutex<Option<Runtime>>,
}

impl Node {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            tasks: TaskManager::new(),
            runtime: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bring the node up: keys, NAT classification, WireGuard interface,
    /// control plane, background loops. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        if self.runtime.lock().await.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.settings.config_dir)
            .map_err(crate::error::ConfigError::Io)?;
        let keys = KeyPair::load_or_generate(&self.settings.keys_dir)?;

        let tunnel: Arc<dyn Tunnel> = Arc::new(WgTunnel::new(
            self.settings.interface_name.clone(),
            keys,
            self.settings.virtual_subnet,
            self.settings.listen_port,
            self.settings.config_dir.clone(),
        ));

        self.initialize_with(tunnel).await
    }

    /// Initialization with an injected tunnel implementation. The tunnel is
    /// the single external-tool seam, so this is also the test entry point.
    pub async fn initialize_with(&self, tunnel: Arc<dyn Tunnel>) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        let peer_id = load_or_generate_peer_id(&self.settings.config_dir)?;
        tracing::info!(peer_id = %peer_id, "node starting");

        // Classify before the interface exists so the probe socket can own
        // the WireGuard port. Failure degrades to relay-only, not fatal.
        let nat_info = match NatClassifier::new(self.settings.listen_port).await {
            Ok(classifier) => match classifier.classify().await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(error = %e, "NAT classification failed");
                    NatInfo::unknown()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "NAT classifier unavailable");
                NatInfo::unknown()
            }
        };

        // Interface failure is fatal: nothing works without the tunnel.
        tunnel.initialize().await?;

        let control: Arc<dyn ControlPlane> = if self.settings.control_server == "local" {
            Arc::new(LocalControlPlane::new(
                self.settings.control_state_path(),
                self.settings.max_clients,
            ))
        } else {
            Arc::new(RemoteControlPlane::connect(
                self.settings.control_server.clone(),
                self.settings.control_token.clone(),
                self.tasks.shutdown_signal(),
            ))
        };

        let ipam = Arc::new(IpamPool::new(self.settings.virtual_subnet));
        let coordinator = Arc::new(ConnectionCoordinator::new(
            Arc::clone(&control),
            HolePuncher::new(self.settings.listen_port),
            nat_info.clone(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&tunnel),
            Arc::clone(&control),
            coordinator,
            Arc::clone(&ipam),
            ConnectionConfig {
                keepalive: self.settings.wireguard_keepalive,
                ..ConnectionConfig::default()
            },
        ));

        let broadcast = BroadcastManager::start(
            peer_id.clone(),
            self.settings.broadcast_transport_port,
            &self.settings.broadcast_whitelist_path(),
        )
        .await?;

        let net_log = NetworkLog::start(self.settings.network_log_path());

        let party = Arc::new(PartyManager::new(
            Arc::clone(&control),
            Arc::clone(&tunnel),
            Arc::clone(&connections),
            Arc::clone(&broadcast),
            ipam,
            net_log,
            peer_id,
            self.settings.peer_name.clone(),
            nat_info,
        ));

        let heartbeat_party = Arc::clone(&party);
        self.tasks
            .spawn("heartbeat", move |shutdown| {
                heartbeat_party.heartbeat_loop(shutdown)
            })
            .await;
        let signal_party = Arc::clone(&party);
        self.tasks
            .spawn("signals", move |shutdown| signal_party.signal_loop(shutdown))
            .await;

        *runtime = Some(Runtime {
            party,
            tunnel,
            control,
            broadcast,
        });
        tracing::info!("node initialized");
        Ok(())
    }

    async fn party(&self) -> Result<Arc<PartyManager>> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::clone(&r.party))
            .ok_or_else(|| {
                WireGuardError::InterfaceMissing {
                    interface: self.settings.interface_name.clone(),
                }
                .into()
            })
    }

    pub async fn create_party(&self, name: &str) -> Result<PartyInfo> {
        self.party().await?.create_party(name).await
    }

    pub async fn join_party(&self, party_id: &str) -> Result<PartyInfo> {
        self.party().await?.join_party(party_id).await
    }

    pub async fn leave_party(&self) -> Result<()> {
        self.party().await?.leave_party().await
    }

    pub async fn status(&self) -> Result<PartyStatus> {
        self.party().await?.status().await
    }

    pub async fn list_relays(&self) -> Result<Vec<RelayInfo>> {
        let runtime = self.runtime.lock().await;
        let runtime = runtime.as_ref().ok_or(crate::error::ControlPlaneError::Disconnected)?;
        runtime.control.list_relays().await
    }

    pub async fn nat_info(&self) -> Result<NatInfo> {
        Ok(self.party().await?.nat_info().clone())
    }

    /// Raw interface diagnostics (the wg dump and installed peer keys).
    pub async fn tunnel_status(&self) -> Result<crate::tunnel::TunnelStatus> {
        let runtime = self.runtime.lock().await;
        let runtime = runtime
            .as_ref()
            .ok_or(crate::error::ControlPlaneError::Disconnected)?;
        Ok(runtime.tunnel.status().await)
    }

    /// Tear everything down. Idempotent; safe to call on a node that never
    /// initialized.
    pub async fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return;
        };
        tracing::info!("node shutting down");

        if let Err(e) = runtime.party.leave_party().await {
            tracing::debug!(error = %e, "no party to leave on shutdown");
        }
        runtime.broadcast.shutdown();
        self.tasks.shutdown_all(SHUTDOWN_DEADLINE).await;
        if let Err(e) = runtime.tunnel.cleanup().await {
            tracing::warn!(error = %e, "interface cleanup failed");
        }
        tracing::info!("node stopped");
    }
}

/// The peer identity survives restarts; it is generated once per
/// installation and lives beside (not inside) the settings store.
fn load_or_generate_peer_id(config_dir: &Path) -> Result<String> {
    let path = config_dir.join("peer.id");
    match std::fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        _ => {
            let id = Uuid::new_v4().to_string();
            std::fs::write(&path, &id).map_err(crate::error::ConfigError::Io)?;
            Ok(id)
        }
    }
}
