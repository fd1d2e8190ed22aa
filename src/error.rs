//! Error types for LANrage

use thiserror::Error;

/// Main error type for LANrage
#[derive(Error, Debug)]
pub enum LanRageError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// WireGuard tooling errors
    #[error("WireGuard error: {0}")]
    WireGuard(#[from] WireGuardError),

    /// NAT classification errors
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    /// STUN probe errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// UDP hole punching errors
    #[error("Hole punch error: {0}")]
    HolePunch(#[from] HolePunchError),

    /// Per-peer connection errors
    #[error("Peer connection error: {0}")]
    PeerConnection(#[from] PeerConnectionError),

    /// Party membership errors
    #[error("Party error: {0}")]
    Party(#[from] PartyError),

    /// Control plane errors
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// Relay server errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// An external call exceeded its deadline
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {key}")]
    MissingSetting { key: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Config directory not writable: {path}")]
    DirNotWritable { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// WireGuard tooling and interface errors
#[derive(Error, Debug)]
pub enum WireGuardError {
    #[error("WireGuard tools not found: {tool}")]
    ToolMissing { tool: String },

    #[error("Command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Key file corrupt: {path}")]
    KeyFileCorrupt { path: String },

    #[error("Interface {interface} not created")]
    InterfaceMissing { interface: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// NAT classification errors
#[derive(Error, Debug)]
pub enum NatError {
    #[error("No STUN servers responded")]
    NoServersReachable,

    #[error("Could not determine local bind address: {reason}")]
    LocalAddress { reason: String },
}

/// STUN probe errors
#[derive(Error, Debug)]
pub enum StunError {
    #[error("Failed to encode binding request: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode response from {server}: {reason}")]
    Decode { server: String, reason: String },

    #[error("Response from {server} carried no XOR-MAPPED-ADDRESS")]
    NoMappedAddress { server: String },

    #[error("No response from {server} within {seconds}s")]
    Timeout { server: String, seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// UDP hole punching errors
#[derive(Error, Debug)]
pub enum HolePunchError {
    #[error("No packet received from {endpoint} within the punch window")]
    WindowExpired { endpoint: String },

    #[error("Punch socket unavailable: {reason}")]
    SocketUnavailable { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-peer connection errors
#[derive(Error, Debug)]
pub enum PeerConnectionError {
    #[error("Peer {peer_id} has no public endpoint")]
    NoEndpoint { peer_id: String },

    #[error("Connection to peer {peer_id} failed: {reason}")]
    ConnectFailed { peer_id: String, reason: String },

    #[error("No connection record for peer {peer_id}")]
    NotConnected { peer_id: String },
}

/// Party membership errors
#[derive(Error, Debug)]
pub enum PartyError {
    #[error("Party {party_id} not found")]
    PartyNotFound { party_id: String },

    #[error("Party {party_id} already exists")]
    PartyExists { party_id: String },

    #[error("Party {party_id} is full ({max} peers)")]
    PartyFull { party_id: String, max: usize },

    #[error("Peer {peer_id} not found in party {party_id}")]
    PeerNotFound { party_id: String, peer_id: String },

    #[error("Not currently in a party")]
    NotInParty,

    #[error("Virtual IP pool exhausted")]
    PoolExhausted,
}

/// Control plane errors
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Not connected to control server")]
    Disconnected,

    #[error("Request {op} failed: {reason}")]
    RequestFailed { op: String, reason: String },

    #[error("Unexpected response for {op}")]
    UnexpectedResponse { op: String },

    #[error("State file corrupt: {path}")]
    StateCorrupt { path: String },

    #[error("Authentication rejected")]
    AuthRejected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay server errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("No relays available")]
    NoRelaysAvailable,

    #[error("Relay {endpoint} did not answer the latency probe")]
    ProbeFailed { endpoint: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LanRageError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::WireGuard(WireGuardError::ToolMissing { tool }) => {
                format!(
                    "{} not found on PATH.\n  Install WireGuard tools and try again.",
                    tool
                )
            }

            Self::WireGuard(WireGuardError::InsufficientPrivileges { .. }) => {
                #[cfg(target_os = "linux")]
                return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                        sudo setcap cap_net_admin=eip ./lanrage"
                    .to_string();
                #[cfg(target_os = "windows")]
                return "Insufficient privileges. Run as Administrator.".to_string();
                #[cfg(not(any(target_os = "linux", target_os = "windows")))]
                return format!("{}", self);
            }

            Self::Config(ConfigError::MissingSetting { key }) => {
                format!("Required setting `{}` is missing from settings.db.", key)
            }

            Self::Party(PartyError::PartyNotFound { party_id }) => {
                format!(
                    "Party {} does not exist.\n  Check the party ID with its host.",
                    party_id
                )
            }

            Self::Party(PartyError::PartyFull { party_id, max }) => {
                format!("Party {} already has {} peers.", party_id, max)
            }

            Self::Nat(NatError::NoServersReachable) => {
                "NAT classification failed (no STUN responses).\n  \
                 Continuing in relay-only mode; direct connections are unavailable."
                    .to_string()
            }

            _ => format!("{}", self),
        }
    }

    /// Whether the failure leaves the process unable to function
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::WireGuard(WireGuardError::ToolMissing { .. })
                | Self::WireGuard(WireGuardError::InsufficientPrivileges { .. })
                | Self::WireGuard(WireGuardError::KeyFileCorrupt { .. })
        )
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::WireGuard(WireGuardError::InsufficientPrivileges { .. }) => 2,
            Self::WireGuard(_) => 3,
            Self::Nat(_) | Self::Stun(_) => 4,
            Self::ControlPlane(_) => 5,
            Self::Relay(_) => 6,
            _ => 255,
        }
    }
}

/// Result type alias for LANrage operations
pub type Result<T> = std::result::Result<T, LanRageError>;
