//! Windows interface provisioning via the `wireguard` tunnel service.
//!
//! Requires Administrator. A `.conf` is written next to the keys and handed
//! to `wireguard /installtunnelservice`; the service name is derived from
//! the interface name by the tool itself.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::tunnel::command;

fn conf_path(config_dir: &Path, iface: &str) -> PathBuf {
    config_dir.join(format!("{iface}.conf"))
}

/// Write the tunnel config and install the WireGuard service.
pub async fn create_interface(
    config_dir: &Path,
    iface: &str,
    private_key_base64: &str,
    host_ip: Ipv4Addr,
    prefix_len: u8,
    listen_port: u16,
) -> Result<()> {
    let conf = format!(
        "[Interface]\nPrivateKey = {private_key_base64}\nAddress = {host_ip}/{prefix_len}\nListenPort = {listen_port}\n"
    );
    let path = conf_path(config_dir, iface);
    std::fs::write(&path, conf).map_err(crate::error::WireGuardError::Io)?;

    let path_str = path.display().to_string();
    command::run(
        "wireguard",
        &["/installtunnelservice", &path_str],
        command::DEFAULT_TIMEOUT,
    )
    .await?;
    Ok(())
}

/// Uninstall the tunnel service. Succeeds if it is already gone.
pub async fn destroy_interface(config_dir: &Path, iface: &str) -> Result<()> {
    let result = command::run(
        "wireguard",
        &["/uninstalltunnelservice", iface],
        command::DEFAULT_TIMEOUT,
    )
    .await;
    let _ = std::fs::remove_file(conf_path(config_dir, iface));
    match result {
        Ok(_) => Ok(()),
        // Service not installed is a clean state for teardown.
        Err(crate::error::LanRageError::WireGuard(
            crate::error::WireGuardError::CommandFailed { .. },
        )) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Verify the `wg` tool answers within the short check deadline.
pub async fn check_tooling() -> Result<()> {
    command::run("wg", &["--version"], std::time::Duration::from_secs(5)).await?;
    Ok(())
}
