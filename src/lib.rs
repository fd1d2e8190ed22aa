//! LANrage - peer-to-peer mesh VPN for LAN gaming
//!
//! Machines join named "parties" and appear to each other on a shared
//! virtual LAN: WireGuard tunnels between every pair of peers, NAT
//! traversal with coordinated hole punching, relay forwarding when direct
//! paths are impossible, and broadcast/multicast emulation so LAN
//! discovery keeps working across the mesh.
//!
//! # Usage
//!
//! ```no_run
//! use lanrage::{config::Settings, node::Node};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(std::path::Path::new("/home/me/.lanrage"))?;
//!     let node = Node::new(settings);
//!     node.initialize().await?;
//!     let party = node.create_party("friday-night").await?;
//!     println!("party id: {}", party.party_id);
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod ipam;
pub mod logging;
pub mod model;
pub mod nat;
pub mod node;
pub mod party;
pub mod relay;
pub mod tasks;
pub mod tunnel;

pub use error::{LanRageError, Result};
pub use model::{NatType, PartyInfo, PeerInfo, RelayInfo};
pub use node::Node;
