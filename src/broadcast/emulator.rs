//! Broadcast and multicast capture and re-injection.
//!
//! Listeners bind the monitored game ports (plus the mDNS and SSDP groups)
//! and hand every captured datagram to the manager. Injection goes the
//! other way: a packet received from a mesh peer is re-emitted on the
//! local LAN's broadcast or multicast address so local games see it.

use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::error::Result;

/// mDNS group
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;
/// SSDP group
pub const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

/// A captured LAN discovery datagram, as carried between mesh peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastPacket {
    pub src_ip: Ipv4Addr,
    pub dst_port: u16,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// The mesh peer the packet originated from; used to suppress
    /// forwarding it back to them. `None` for locally captured packets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_peer: Option<String>,
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Whether a listener watches a plain broadcast port or a multicast group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Broadcast,
    Multicast(Ipv4Addr),
}

/// One bound port feeding captured datagrams to the manager
pub struct PortListener {
    pub port: u16,
    pub kind: ListenerKind,
    shutdown_tx: watch::Sender<bool>,
}

impl PortListener {
    /// Bind and start capturing. "Port in use" and multicast-join failures
    /// surface as errors; the manager logs and skips the port.
    pub async fn start(
        port: u16,
        kind: ListenerKind,
        capture_tx: mpsc::Sender<BroadcastPacket>,
    ) -> Result<Self> {
        let socket = bind_capture_socket(port, kind)?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        let Ok((len, from)) = recv else { return };
                        let SocketAddr::V4(from) = from else { continue };
                        let packet = BroadcastPacket {
                            src_ip: *from.ip(),
                            dst_port: port,
                            payload: buf[..len].to_vec(),
                            origin_peer: None,
                        };
                        if capture_tx.send(packet).await.is_err() {
                            return;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        tracing::debug!(port, ?kind, "listener started");
        Ok(Self {
            port,
            kind,
            shutdown_tx,
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_capture_socket(port: u16, kind: ListenerKind) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(std::io::Error::from)?;
    socket.set_reuse_address(true).map_err(std::io::Error::from)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(std::io::Error::from)?;

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("static addr");
    socket.bind(&addr.into())?;

    if let ListenerKind::Multicast(group) = kind {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    }

    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Re-emit a packet from a mesh peer on the local LAN.
pub struct Injector {
    socket: UdpSocket,
}

impl Injector {
    pub async fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(std::io::Error::from)?;
        socket.set_broadcast(true).map_err(std::io::Error::from)?;
        let addr: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket.into())?,
        })
    }

    /// Send to the broadcast address (or the multicast group for the mDNS
    /// and SSDP ports) on the packet's destination port.
    pub async fn inject(&self, packet: &BroadcastPacket) -> Result<()> {
        let target_ip = match packet.dst_port {
            MDNS_PORT => MDNS_GROUP,
            SSDP_PORT => SSDP_GROUP,
            _ => Ipv4Addr::BROADCAST,
        };
        let target = SocketAddr::from((target_ip, packet.dst_port));
        self.socket
            .send_to(&packet.payload, target)
            .await
            .map_err(crate::error::LanRageError::System)?;
        tracing::trace!(target = %target, bytes = packet.payload.len(), "packet injected");
        Ok(())
    }

    #[cfg(test)]
    pub async fn inject_to(&self, packet: &BroadcastPacket, target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(&packet.payload, target)
            .await
            .map_err(crate::error::LanRageError::System)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_broadcast_packet_json_roundtrip() {
        let packet = BroadcastPacket {
            src_ip: Ipv4Addr::new(192, 168, 1, 7),
            dst_port: 27015,
            payload: vec![0x00, 0xff, 0x42, 0x13],
            origin_peer: Some("peer-a".to_string()),
        };
        let json = serde_json::to_string(&packet).unwrap();
        let back: BroadcastPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(back.src_ip, packet.src_ip);
        assert_eq!(back.dst_port, 27015);
        assert_eq!(back.payload, packet.payload);
        assert_eq!(back.origin_peer.as_deref(), Some("peer-a"));
    }

    #[tokio::test]
    async fn test_listener_captures_datagrams() {
        let (capture_tx, mut capture_rx) = mpsc::channel(16);
        // Port 0 gives an ephemeral port; read it back via a probe socket
        // instead. Bind the listener on a fixed high port for the test.
        let port = 39415;
        let listener = PortListener::start(port, ListenerKind::Broadcast, capture_tx)
            .await
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"server-announce", format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), capture_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.payload, b"server-announce");
        assert_eq!(packet.dst_port, port);
        listener.stop();
    }

    #[tokio::test]
    async fn test_injector_reaches_local_listener() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let injector = Injector::new().await.unwrap();
        let packet = BroadcastPacket {
            src_ip: Ipv4Addr::new(10, 66, 0, 3),
            dst_port: target.port(),
            payload: b"discovery".to_vec(),
            origin_peer: Some("peer-b".to_string()),
        };
        injector.inject_to(&packet, target).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"discovery");
    }

    #[tokio::test]
    async fn test_port_in_use_is_error_not_panic() {
        // Occupy a port without reuse flags, then ask the listener for it.
        let holder = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        let addr: SocketAddr = "0.0.0.0:39416".parse().unwrap();
        if holder.bind(&addr.into()).is_err() {
            return; // port taken by the environment; nothing to assert
        }

        // With SO_REUSEADDR/PORT the bind may still succeed on some
        // platforms; the contract is only "no panic, Result either way".
        let (capture_tx, _capture_rx) = mpsc::channel(1);
        let _ = PortListener::start(39416, ListenerKind::Broadcast, capture_tx).await;
    }
}
