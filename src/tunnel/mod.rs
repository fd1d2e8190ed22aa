//! WireGuard tunnel management.
//!
//! The tunnel manager owns the interface exclusively: everything else in the
//! crate goes through its typed methods, and it is the only component that
//! invokes external tools. The `Tunnel` trait is the seam the rest of the
//! system (and the tests) depend on.

pub mod command;
pub mod keys;

#[cfg(unix)]
mod linux;
#[cfg(windows)]
mod windows;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::Mutex;

pub use keys::KeyPair;

use crate::error::{Result, WireGuardError};

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1420;

/// Deadline for one latency ping
const PING_DEADLINE: Duration = Duration::from_secs(1);

/// Peer entry handed to `add_peer`
#[derive(Debug, Clone)]
pub struct WgPeerSpec {
    /// Base64 public key
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<Ipv4Net>,
    /// Persistent keepalive seconds; always set so NAT mappings stay alive
    pub keepalive: u64,
}

/// Interface state surfaced by `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Active,
    NotCreated,
    Error,
}

/// Diagnostic snapshot of the interface
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub state: InterfaceState,
    /// Raw `wg show <iface> dump` output
    pub raw_dump: String,
    /// Base64 public keys of installed peers, parsed from the dump
    pub peer_keys: Vec<String>,
}

/// The single seam between the mesh logic and the WireGuard tooling.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// The local public key, base64
    fn public_key_base64(&self) -> String;

    /// Port the interface listens on (also the STUN/punch source port)
    fn listen_port(&self) -> u16;

    /// Verify tooling, create the interface, assign the host IP, bring up
    async fn initialize(&self) -> Result<()>;

    /// Install or update a peer. Idempotent on the public key.
    async fn add_peer(&self, peer: &WgPeerSpec) -> Result<()>;

    /// Remove a peer. Idempotent.
    async fn remove_peer(&self, public_key: &str) -> Result<()>;

    /// One ICMP echo to the peer's virtual IP. `None` means unreachable.
    async fn measure_latency(&self, virtual_ip: Ipv4Addr) -> Option<f64>;

    async fn status(&self) -> TunnelStatus;

    /// Tear the interface down. Idempotent.
    async fn cleanup(&self) -> Result<()>;
}

/// Production tunnel manager backed by the wg/ip tools
pub struct WgTunnel {
    iface: String,
    keys: KeyPair,
    host_ip: Ipv4Addr,
    prefix_len: u8,
    listen_port: u16,
    #[allow(dead_code)] // consumed by the Windows provisioning path only
    config_dir: PathBuf,
    /// Serializes interface mutations; the wg tools are not transactional.
    op_lock: Mutex<()>,
}

impl WgTunnel {
    pub fn new(
        iface: String,
        keys: KeyPair,
        subnet: Ipv4Net,
        listen_port: u16,
        config_dir: PathBuf,
    ) -> Self {
        let host_ip = Ipv4Addr::from(u32::from(subnet.network()) + 1);
        Self {
            iface,
            keys,
            host_ip,
            prefix_len: subnet.prefix_len(),
            listen_port,
            config_dir,
            op_lock: Mutex::new(()),
        }
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }
}

#[async_trait]
impl Tunnel for WgTunnel {
    fn public_key_base64(&self) -> String {
        self.keys.public_base64()
    }

    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    async fn initialize(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        #[cfg(unix)]
        {
            linux::check_tooling().await?;
            linux::create_interface(
                &self.iface,
                &self.keys.private_base64(),
                self.host_ip,
                self.prefix_len,
                DEFAULT_MTU,
                self.listen_port,
            )
            .await?;
        }
        #[cfg(windows)]
        {
            windows::check_tooling().await?;
            windows::create_interface(
                &self.config_dir,
                &self.iface,
                &self.keys.private_base64(),
                self.host_ip,
                self.prefix_len,
                self.listen_port,
            )
            .await?;
        }

        tracing::info!(
            iface = %self.iface,
            host_ip = %self.host_ip,
            port = self.listen_port,
            "WireGuard interface up"
        );
        Ok(())
    }

    async fn add_peer(&self, peer: &WgPeerSpec) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
        let allowed = allowed.join(",");
        let keepalive = peer.keepalive.to_string();

        let mut args: Vec<&str> = vec!["set", &self.iface, "peer", &peer.public_key];
        let endpoint;
        if let Some(ep) = peer.endpoint {
            endpoint = ep.to_string();
            args.push("endpoint");
            args.push(&endpoint);
        }
        args.extend_from_slice(&[
            "allowed-ips",
            &allowed,
            "persistent-keepalive",
            &keepalive,
        ]);

        command::run("wg", &args, command::DEFAULT_TIMEOUT).await?;
        tracing::debug!(peer = %peer.public_key, endpoint = ?peer.endpoint, "peer installed");
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        match command::run(
            "wg",
            &["set", &self.iface, "peer", public_key, "remove"],
            command::DEFAULT_TIMEOUT,
        )
        .await
        {
            Ok(_) => Ok(()),
            // Removing an absent peer is a clean state, not a failure.
            Err(crate::error::LanRageError::WireGuard(WireGuardError::CommandFailed {
                ..
            })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn measure_latency(&self, virtual_ip: Ipv4Addr) -> Option<f64> {
        let target = virtual_ip.to_string();
        #[cfg(unix)]
        let args = ["-c", "1", "-W", "1", target.as_str()];
        #[cfg(windows)]
        let args = ["-n", "1", "-w", "1000", target.as_str()];

        // The external deadline covers process startup on top of ping's own.
        match command::run("ping", &args, PING_DEADLINE * 2).await {
            Ok(out) => parse_ping_ms(&out.stdout),
            Err(_) => None,
        }
    }

    async fn status(&self) -> TunnelStatus {
        match command::run(
            "wg",
            &["show", &self.iface, "dump"],
            Duration::from_secs(5),
        )
        .await
        {
            Ok(out) => {
                let peer_keys = parse_dump_peers(&out.stdout);
                TunnelStatus {
                    state: InterfaceState::Active,
                    raw_dump: out.stdout,
                    peer_keys,
                }
            }
            Err(crate::error::LanRageError::WireGuard(WireGuardError::CommandFailed {
                stderr,
                ..
            })) => TunnelStatus {
                state: InterfaceState::NotCreated,
                raw_dump: stderr,
                peer_keys: Vec::new(),
            },
            Err(e) => TunnelStatus {
                state: InterfaceState::Error,
                raw_dump: e.to_string(),
                peer_keys: Vec::new(),
            },
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        #[cfg(unix)]
        linux::destroy_interface(&self.iface).await?;
        #[cfg(windows)]
        windows::destroy_interface(&self.config_dir, &self.iface).await?;

        tracing::info!(iface = %self.iface, "WireGuard interface removed");
        Ok(())
    }
}

/// Parse the round-trip time out of one ping's stdout.
///
/// Handles `time=12.3 ms` (Linux), `time=12ms` and `time<1ms` (Windows).
fn parse_ping_ms(stdout: &str) -> Option<f64> {
    for line in stdout.lines() {
        if let Some(idx) = line.find("time=") {
            let rest = &line[idx + 5..];
            let num: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Ok(ms) = num.parse::<f64>() {
                return Some(ms);
            }
        }
        if line.contains("time<1ms") {
            return Some(0.5);
        }
    }
    None
}

/// Peer public keys from `wg show <iface> dump`: the first line describes
/// the interface, each further line starts with a peer key.
fn parse_dump_peers(dump: &str) -> Vec<String> {
    dump.lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux_ping() {
        let out = "PING 10.66.0.2 (10.66.0.2) 56(84) bytes of data.\n\
                   64 bytes from 10.66.0.2: icmp_seq=1 ttl=64 time=23.4 ms\n";
        assert_eq!(parse_ping_ms(out), Some(23.4));
    }

    #[test]
    fn test_parse_windows_ping() {
        let out = "Reply from 10.66.0.2: bytes=32 time=41ms TTL=64\n";
        assert_eq!(parse_ping_ms(out), Some(41.0));
        let sub_ms = "Reply from 10.66.0.2: bytes=32 time<1ms TTL=64\n";
        assert_eq!(parse_ping_ms(sub_ms), Some(0.5));
    }

    #[test]
    fn test_parse_ping_no_reply() {
        let out = "PING 10.66.0.2 (10.66.0.2) 56(84) bytes of data.\n\
                   \n--- 10.66.0.2 ping statistics ---\n\
                   1 packets transmitted, 0 received, 100% packet loss\n";
        assert_eq!(parse_ping_ms(out), None);
    }

    #[test]
    fn test_parse_dump_peers() {
        let dump = "privkey\tpubkey\t51820\toff\n\
                    AAAA=\t(none)\t1.2.3.4:51820\t10.66.0.2/32\t0\t0\t0\t25\n\
                    BBBB=\t(none)\t(none)\t10.66.0.3/32\t0\t0\t0\t25\n";
        assert_eq!(parse_dump_peers(dump), vec!["AAAA=", "BBBB="]);
    }

    #[test]
    fn test_parse_dump_no_peers() {
        let dump = "privkey\tpubkey\t51820\toff\n";
        assert!(parse_dump_peers(dump).is_empty());
    }
}
