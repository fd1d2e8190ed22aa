//! Linux interface provisioning via `ip` and `wg`.
//!
//! Requires root or CAP_NET_ADMIN. The private key never touches the
//! filesystem here; it is piped to `wg set ... private-key /dev/stdin`.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Result, WireGuardError};
use crate::tunnel::command;

/// Create and bring up the WireGuard interface.
pub async fn create_interface(
    iface: &str,
    private_key_base64: &str,
    host_ip: Ipv4Addr,
    prefix_len: u8,
    mtu: u16,
    listen_port: u16,
) -> Result<()> {
    check_privileges()?;

    command::run(
        "ip",
        &["link", "add", "dev", iface, "type", "wireguard"],
        command::DEFAULT_TIMEOUT,
    )
    .await?;

    let port = listen_port.to_string();
    command::run_with_stdin(
        "wg",
        &[
            "set",
            iface,
            "listen-port",
            &port,
            "private-key",
            "/dev/stdin",
        ],
        Some(private_key_base64),
        command::DEFAULT_TIMEOUT,
    )
    .await?;

    let addr = format!("{host_ip}/{prefix_len}");
    command::run(
        "ip",
        &["address", "add", "dev", iface, &addr],
        command::DEFAULT_TIMEOUT,
    )
    .await?;

    let mtu = mtu.to_string();
    command::run(
        "ip",
        &["link", "set", "mtu", &mtu, "up", "dev", iface],
        command::DEFAULT_TIMEOUT,
    )
    .await?;

    Ok(())
}

/// Delete the interface. Succeeds if it is already gone.
pub async fn destroy_interface(iface: &str) -> Result<()> {
    match command::run(
        "ip",
        &["link", "delete", "dev", iface],
        command::DEFAULT_TIMEOUT,
    )
    .await
    {
        Ok(_) => Ok(()),
        Err(crate::error::LanRageError::WireGuard(WireGuardError::CommandFailed {
            stderr,
            ..
        })) if stderr.contains("Cannot find device") => Ok(()),
        Err(e) => Err(e),
    }
}

/// Verify the `wg` tool answers within the short check deadline.
pub async fn check_tooling() -> Result<()> {
    command::run("wg", &["--version"], Duration::from_secs(5)).await?;
    Ok(())
}

fn check_privileges() -> Result<()> {
    // CAP_NET_ADMIN without euid 0 also works; the `ip link add` call will
    // surface that case. euid 0 is the common path worth a clear error for.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        tracing::warn!("not running as root; interface creation may fail");
    }
    Ok(())
}
