//! STUN binding probes.
//!
//! One socket, many servers: all Binding Requests leave from the same source
//! port so that differing reflexive endpoints can only come from the NAT's
//! mapping behavior, not from our own binds. Responses are matched to
//! requests by transaction ID.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytecodec::{DecodeExt, EncodeExt};
use rand::RngCore;
use stun_codec::rfc5389::attributes::XorMappedAddress;
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5389::Attribute;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use tokio::net::UdpSocket;

use crate::error::{Result, StunError};

/// Per-server response deadline
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One server's answer: where it saw us from
#[derive(Debug, Clone)]
pub struct StunReply {
    pub server: SocketAddr,
    pub reflexive: SocketAddr,
}

fn new_transaction_id() -> TransactionId {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    TransactionId::new(bytes)
}

fn encode_binding_request(txid: TransactionId) -> Result<Vec<u8>> {
    let message: Message<Attribute> = Message::new(MessageClass::Request, BINDING, txid);
    let mut encoder = MessageEncoder::new();
    encoder
        .encode_into_bytes(message)
        .map_err(|e| StunError::Encode {
            reason: e.to_string(),
        })
        .map_err(Into::into)
}

fn decode_reflexive(buf: &[u8], server: SocketAddr) -> Result<(TransactionId, SocketAddr)> {
    let mut decoder = MessageDecoder::<Attribute>::new();
    let message = decoder
        .decode_from_bytes(buf)
        .map_err(|e| StunError::Decode {
            server: server.to_string(),
            reason: e.to_string(),
        })?
        .map_err(|_| StunError::Decode {
            server: server.to_string(),
            reason: "broken STUN message".to_string(),
        })?;

    let mapped = message
        .get_attribute::<XorMappedAddress>()
        .map(|a| a.address())
        .ok_or(StunError::NoMappedAddress {
            server: server.to_string(),
        })?;

    Ok((message.transaction_id(), mapped))
}

/// Send Binding Requests to every server from `socket` and collect the
/// reflexive endpoints that arrive within the probe window.
pub async fn probe_all(socket: &UdpSocket, servers: &[SocketAddr]) -> Result<Vec<StunReply>> {
    let mut pending: HashMap<TransactionId, SocketAddr> = HashMap::new();

    for server in servers {
        let txid = new_transaction_id();
        let request = encode_binding_request(txid)?;
        match socket.send_to(&request, server).await {
            Ok(_) => {
                pending.insert(txid, *server);
            }
            Err(e) => {
                // One unreachable server must not sink the whole probe.
                tracing::debug!(server = %server, error = %e, "STUN send failed");
            }
        }
    }

    let mut replies = Vec::new();
    let deadline = tokio::time::Instant::now() + PROBE_TIMEOUT;
    let mut buf = [0u8; 1500];

    while !pending.is_empty() {
        let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let (len, from) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "STUN recv failed");
                break;
            }
            Err(_) => break, // window closed
        };

        match decode_reflexive(&buf[..len], from) {
            Ok((txid, reflexive)) => {
                if let Some(server) = pending.remove(&txid) {
                    replies.push(StunReply { server, reflexive });
                }
            }
            Err(e) => {
                tracing::debug!(from = %from, error = %e, "discarding non-STUN datagram");
            }
        }
    }

    Ok(replies)
}
