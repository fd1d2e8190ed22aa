//! Coordinated UDP hole punching.
//!
//! Both peers run `punch` concurrently (synchronized via the control-plane
//! signal channel): short bursts to the other side's public endpoint from
//! the WireGuard listen port, listening in between. The first datagram that
//! arrives from the expected peer proves the path is open; an ACK tells the
//! other side the same.
//!
//! The bursts must leave from the port WireGuard will use, so the socket is
//! bound with address reuse before the interface exists.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{HolePunchError, Result};

/// Total punch window
pub const PUNCH_WINDOW: Duration = Duration::from_secs(3);
/// Interval between burst packets
pub const BURST_INTERVAL: Duration = Duration::from_millis(100);

const PUNCH_PAYLOAD: &[u8] = b"LANRAGE/punch";
const ACK_PAYLOAD: &[u8] = b"LANRAGE/ack";

/// Executes coordinated punches from a fixed local port
pub struct HolePuncher {
    local_port: u16,
}

impl HolePuncher {
    pub fn new(local_port: u16) -> Self {
        Self { local_port }
    }

    /// Punch toward `remote`. Returns the endpoint the peer's packets
    /// actually arrived from (a port-restricted NAT may rewrite the port).
    pub async fn punch(&self, remote: SocketAddr) -> Result<SocketAddr> {
        let socket = bind_reuse(self.local_port).await?;
        punch_on(&socket, remote, PUNCH_WINDOW).await
    }
}

/// Burst-and-listen on an existing socket. Split out so tests can drive
/// both sides over loopback with ephemeral ports.
pub async fn punch_on(
    socket: &UdpSocket,
    remote: SocketAddr,
    window: Duration,
) -> Result<SocketAddr> {
    let deadline = tokio::time::Instant::now() + window;
    let mut ticker = tokio::time::interval(BURST_INTERVAL);
    let mut buf = [0u8; 64];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(HolePunchError::WindowExpired {
                        endpoint: remote.to_string(),
                    }
                    .into());
                }
                if let Err(e) = socket.send_to(PUNCH_PAYLOAD, remote).await {
                    tracing::debug!(remote = %remote, error = %e, "punch send failed");
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = recv.map_err(HolePunchError::Io)?;
                // Restricted NATs rewrite ports; same source IP is proof
                // enough that the path opened.
                if from.ip() != remote.ip() {
                    tracing::debug!(from = %from, "ignoring datagram from unexpected host");
                    continue;
                }
                let payload = &buf[..len];
                if payload == PUNCH_PAYLOAD || payload == ACK_PAYLOAD {
                    // Let the other side observe success too.
                    for _ in 0..3 {
                        let _ = socket.send_to(ACK_PAYLOAD, from).await;
                    }
                    tracing::info!(endpoint = %from, "hole punch succeeded");
                    return Ok(from);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(HolePunchError::WindowExpired {
                    endpoint: remote.to_string(),
                }
                .into());
            }
        }
    }
}

async fn bind_reuse(port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
        HolePunchError::SocketUnavailable {
            reason: e.to_string(),
        }
    })?;
    socket
        .set_reuse_address(true)
        .map_err(HolePunchError::Io)?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("static addr");
    socket.bind(&addr.into()).map_err(|e| HolePunchError::SocketUnavailable {
        reason: e.to_string(),
    })?;
    socket.set_nonblocking(true).map_err(HolePunchError::Io)?;
    UdpSocket::from_std(socket.into())
        .map_err(HolePunchError::Io)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_both_sides_reachable_succeeds() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        let (ra, rb) = tokio::join!(
            punch_on(&a, addr_b, PUNCH_WINDOW),
            punch_on(&b, addr_a, PUNCH_WINDOW),
        );

        assert_eq!(ra.unwrap(), addr_b);
        assert_eq!(rb.unwrap(), addr_a);
    }

    #[tokio::test]
    async fn test_silent_peer_expires_window() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Nothing listens on this port's far side; use an address that
        // swallows packets (bound socket that never sends).
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();

        let err = punch_on(&a, target, Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::LanRageError::HolePunch(HolePunchError::WindowExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_datagrams_from_other_hosts_are_ignored() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a = a.local_addr().unwrap();
        let noisy = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Noise with the right payload but (conceptually) wrong peer: use a
        // payload mismatch since loopback shares the IP.
        let noise = tokio::spawn(async move {
            for _ in 0..5 {
                let _ = noisy.send_to(b"definitely-not-punch", addr_a).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = punch_on(&a, target, Duration::from_millis(400)).await;
        noise.abort();
        assert!(err.is_err());
    }
}
