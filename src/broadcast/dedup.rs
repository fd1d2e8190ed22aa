//! Time-windowed packet deduplication.
//!
//! Broadcast emulation can see the same datagram more than once (several
//! listeners, a peer echoing it back, a game retransmitting). Each packet
//! is keyed by SHA-256 of (payload, source IP, destination port); a key
//! seen inside the window is dropped. Expired keys are pruned by a
//! background tick the manager owns.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Default suppression window
pub const DEDUPE_WINDOW: Duration = Duration::from_secs(2);
/// Default prune cadence
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

type PacketHash = [u8; 32];

/// Forward/drop counters surfaced in status output
#[derive(Debug, Default)]
pub struct DedupeMetrics {
    pub total: AtomicU64,
    pub forwarded: AtomicU64,
    pub deduplicated: AtomicU64,
}

impl DedupeMetrics {
    pub fn dedupe_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.deduplicated.load(Ordering::Relaxed) as f64 / total as f64
    }
}

pub struct Deduplicator {
    window: Duration,
    seen: Mutex<HashMap<PacketHash, Instant>>,
    pub metrics: DedupeMetrics,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
            metrics: DedupeMetrics::default(),
        }
    }

    pub fn packet_hash(payload: &[u8], src_ip: Ipv4Addr, dst_port: u16) -> PacketHash {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hasher.update(src_ip.octets());
        hasher.update(dst_port.to_be_bytes());
        hasher.finalize().into()
    }

    /// Returns true when the packet is fresh and should be forwarded.
    pub fn check(&self, payload: &[u8], src_ip: Ipv4Addr, dst_port: u16) -> bool {
        self.check_hash(Self::packet_hash(payload, src_ip, dst_port))
    }

    /// Variant for callers that key on payload alone.
    pub fn check_payload(&self, payload: &[u8]) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        self.check_hash(hasher.finalize().into())
    }

    fn check_hash(&self, hash: PacketHash) -> bool {
        self.metrics.total.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();

        match seen.get(&hash) {
            Some(at) if now.duration_since(*at) < self.window => {
                self.metrics.deduplicated.fetch_add(1, Ordering::Relaxed);
                false
            }
            _ => {
                seen.insert(hash, now);
                self.metrics.forwarded.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Drop entries older than the window.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.window;
        self.seen
            .lock()
            .unwrap()
            .retain(|_, at| now.duration_since(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
