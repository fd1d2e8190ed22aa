//! Connection establishment and lifecycle: strategy coordination plus the
//! per-peer state machine with monitoring and recovery.

pub mod coordinator;
pub mod manager;

pub use coordinator::{ConnectSignal, Coordination, ConnectionCoordinator};
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionRecord, ConnectionState};
