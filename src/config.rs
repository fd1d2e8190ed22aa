//! Settings consumed from the settings collaborator.
//!
//! The settings store itself (`settings.db`) is owned by an external
//! collaborator and is opaque to the core: a flat JSON object of typed
//! values. This module reads the subset of keys the core needs and applies
//! the documented defaults for anything absent. WireGuard keys deliberately
//! do NOT live here; they are flat files under `keys_dir` (the peer's
//! identity outlives any settings migration).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde_json::Value;

use crate::error::{ConfigError, Result};

/// Operating mode of the entry binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Relay,
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "client" => Ok(Mode::Client),
            "relay" => Ok(Mode::Relay),
            other => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Typed view over the opaque settings store
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub virtual_subnet: Ipv4Net,
    pub interface_name: String,
    /// Bind host/port of the management API collaborator
    pub api_host: String,
    pub api_port: u16,
    pub peer_name: String,
    pub wireguard_keepalive: u64,
    /// Control server URL, or "local" for the file-based plane
    pub control_server: String,
    pub relay_public_ip: Option<Ipv4Addr>,
    pub relay_port: u16,
    pub max_clients: usize,
    pub config_dir: PathBuf,
    pub keys_dir: PathBuf,
    /// Optional bearer token for the remote control server
    pub control_token: Option<String>,
    /// WireGuard listen port; also the STUN/punch source port
    pub listen_port: u16,
    /// UDP port the broadcast manager uses for peer-to-peer forwarding
    pub broadcast_transport_port: u16,
}

impl Settings {
    /// Load settings from `<config_dir>/settings.db`, falling back to
    /// defaults for any key the collaborator has not written yet.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("settings.db");
        let raw: HashMap<String, Value> = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|_| ConfigError::InvalidValue {
                key: "settings.db".to_string(),
                value: path.display().to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(ConfigError::Io(e).into()),
        };

        Self::from_values(config_dir, raw)
    }

    fn from_values(config_dir: &Path, raw: HashMap<String, Value>) -> Result<Self> {
        let str_of = |key: &str, default: &str| -> String {
            raw.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let int_of = |key: &str, default: u64| -> u64 {
            raw.get(key).and_then(Value::as_u64).unwrap_or(default)
        };

        let mode: Mode = str_of("mode", "client").parse()?;

        let subnet_str = str_of("virtual_subnet", "10.66.0.0/16");
        let virtual_subnet: Ipv4Net =
            subnet_str
                .parse()
                .map_err(|_| ConfigError::InvalidCidr {
                    value: subnet_str.clone(),
                })?;

        let relay_public_ip = match raw.get("relay_public_ip").and_then(Value::as_str) {
            Some(s) => Some(s.parse().map_err(|_| ConfigError::InvalidValue {
                key: "relay_public_ip".to_string(),
                value: s.to_string(),
            })?),
            None => None,
        };

        let keys_dir = raw
            .get("keys_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("keys"));

        Ok(Settings {
            mode,
            virtual_subnet,
            interface_name: str_of("interface_name", "lanrage0"),
            api_host: str_of("api_host", "127.0.0.1"),
            api_port: int_of("api_port", 8666) as u16,
            peer_name: str_of("peer_name", "anonymous"),
            wireguard_keepalive: int_of("wireguard_keepalive", 25),
            control_server: str_of("control_server", "local"),
            relay_public_ip,
            relay_port: int_of("relay_port", 51820) as u16,
            max_clients: int_of("max_clients", 255) as usize,
            config_dir: config_dir.to_path_buf(),
            keys_dir,
            control_token: raw
                .get("control_token")
                .and_then(Value::as_str)
                .map(str::to_string),
            listen_port: int_of("listen_port", 51820) as u16,
            broadcast_transport_port: int_of("broadcast_transport_port", 8667) as u16,
        })
    }

    /// Path of the local control plane's shared state file
    pub fn control_state_path(&self) -> PathBuf {
        self.config_dir.join("control_state.json")
    }

    /// Path of the async network event log
    pub fn network_log_path(&self) -> PathBuf {
        self.config_dir.join("network.log")
    }

    /// Path of the user's broadcast port whitelist
    pub fn broadcast_whitelist_path(&self) -> PathBuf {
        self.config_dir.join("custom_broadcast_ports.json")
    }

    /// Relay mode requires a public IP to advertise
    pub fn require_relay_public_ip(&self) -> Result<Ipv4Addr> {
        self.relay_public_ip
            .ok_or_else(|| {
                ConfigError::MissingSetting {
                    key: "relay_public_ip".to_string(),
                }
                .into()
            })
    }
}
