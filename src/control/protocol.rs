//! WebSocket wire protocol between clients and the central control server.
//!
//! Every client→server message is a JSON object tagged with `op` and
//! carrying a `request_id`; the server answers with a message echoing that
//! ID, or pushes unsolicited `signal_incoming` frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControlPlaneError, LanRageError, PartyError};
use crate::model::{PartyInfo, PeerInfo, RelayInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        request_id: u64,
        token: String,
    },
    RegisterPeer {
        request_id: u64,
        peer_id: String,
    },
    RegisterParty {
        request_id: u64,
        party_id: String,
        name: String,
        host_peer_info: PeerInfo,
    },
    JoinParty {
        request_id: u64,
        party_id: String,
        peer_info: PeerInfo,
    },
    LeaveParty {
        request_id: u64,
        party_id: String,
        peer_id: String,
    },
    UpdatePeer {
        request_id: u64,
        party_id: String,
        peer_info: PeerInfo,
    },
    GetParty {
        request_id: u64,
        party_id: String,
    },
    GetPeers {
        request_id: u64,
        party_id: String,
    },
    Signal {
        request_id: u64,
        party_id: String,
        from: String,
        to: String,
        signal: Value,
    },
    Heartbeat {
        request_id: u64,
        party_id: String,
        peer_id: String,
    },
    ListRelays {
        request_id: u64,
    },
    /// Relay deployments announce themselves so clients can discover them.
    RegisterRelay {
        request_id: u64,
        relay: RelayInfo,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientMessage::Auth { request_id, .. }
            | ClientMessage::RegisterPeer { request_id, .. }
            | ClientMessage::RegisterParty { request_id, .. }
            | ClientMessage::JoinParty { request_id, .. }
            | ClientMessage::LeaveParty { request_id, .. }
            | ClientMessage::UpdatePeer { request_id, .. }
            | ClientMessage::GetParty { request_id, .. }
            | ClientMessage::GetPeers { request_id, .. }
            | ClientMessage::Signal { request_id, .. }
            | ClientMessage::Heartbeat { request_id, .. }
            | ClientMessage::ListRelays { request_id }
            | ClientMessage::RegisterRelay { request_id, .. } => *request_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Ok {
        request_id: u64,
    },
    Party {
        request_id: u64,
        party: Option<PartyInfo>,
    },
    Peers {
        request_id: u64,
        peers: Vec<PeerInfo>,
    },
    Relays {
        request_id: u64,
        relays: Vec<RelayInfo>,
    },
    Error {
        request_id: u64,
        kind: ErrorKind,
        message: String,
    },
    /// Unsolicited: a signal from another peer, forwarded by the server
    SignalIncoming {
        party_id: String,
        from: String,
        seq: u64,
        signal: Value,
    },
}

/// Error kinds crossing the wire; mapped back to the local taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PartyNotFound,
    PartyExists,
    PartyFull,
    PeerNotFound,
    AuthRejected,
    BadRequest,
    Internal,
}

/// Map a server-side failure to its wire representation.
pub fn error_to_wire(err: &LanRageError) -> (ErrorKind, String) {
    let kind = match err {
        LanRageError::Party(PartyError::PartyNotFound { .. }) => ErrorKind::PartyNotFound,
        LanRageError::Party(PartyError::PartyExists { .. }) => ErrorKind::PartyExists,
        LanRageError::Party(PartyError::PartyFull { .. }) => ErrorKind::PartyFull,
        LanRageError::Party(PartyError::PeerNotFound { .. }) => ErrorKind::PeerNotFound,
        LanRageError::ControlPlane(ControlPlaneError::AuthRejected) => ErrorKind::AuthRejected,
        _ => ErrorKind::Internal,
    };
    (kind, err.to_string())
}

/// Reconstruct a typed error from the wire representation.
pub fn error_from_wire(kind: ErrorKind, message: String, context: &str) -> LanRageError {
    match kind {
        ErrorKind::PartyNotFound => PartyError::PartyNotFound {
            party_id: context.to_string(),
        }
        .into(),
        ErrorKind::PartyExists => PartyError::PartyExists {
            party_id: context.to_string(),
        }
        .into(),
        ErrorKind::PartyFull => PartyError::PartyFull {
            party_id: context.to_string(),
            max: 0,
        }
        .into(),
        ErrorKind::PeerNotFound => PartyError::PeerNotFound {
            party_id: context.to_string(),
            peer_id: String::new(),
        }
        .into(),
        ErrorKind::AuthRejected => ControlPlaneError::AuthRejected.into(),
        ErrorKind::BadRequest | ErrorKind::Internal => ControlPlaneError::RequestFailed {
            op: context.to_string(),
            reason: message,
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NatType;

    #[test]
    fn test_client_message_json_shape() {
        let msg = ClientMessage::Heartbeat {
            request_id: 7,
            party_id: "pid".to_string(),
            peer_id: "me".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "heartbeat");
        assert_eq!(json["request_id"], 7);
        assert_eq!(json["party_id"], "pid");
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage::Error {
            request_id: 3,
            kind: ErrorKind::PartyFull,
            message: "full".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::PartyFull),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_register_party_carries_peer_info() {
        let host = PeerInfo {
            peer_id: "h".to_string(),
            name: "host".to_string(),
            public_key: "k".to_string(),
            public_endpoint: None,
            private_endpoint: None,
            nat_type: NatType::FullCone,
            virtual_ip: None,
            last_seen: 0,
        };
        let msg = ClientMessage::RegisterParty {
            request_id: 1,
            party_id: "pid".to_string(),
            name: "alpha".to_string(),
            host_peer_info: host,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id(), 1);
        match back {
            ClientMessage::RegisterParty { host_peer_info, .. } => {
                assert_eq!(host_peer_info.nat_type, NatType::FullCone)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_wire_mapping_roundtrip() {
        let err: LanRageError = PartyError::PartyNotFound {
            party_id: "pid".to_string(),
        }
        .into();
        let (kind, msg) = error_to_wire(&err);
        assert_eq!(kind, ErrorKind::PartyNotFound);
        let back = error_from_wire(kind, msg, "pid");
        assert!(matches!(
            back,
            LanRageError::Party(PartyError::PartyNotFound { .. })
        ));
    }
}
