//! Logging setup, correlation spans, and the network event log.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::model::epoch_secs;

/// Install the global subscriber. `verbose` lifts the default level to
/// debug; `RUST_LOG` still wins when set.
pub fn init(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();
}

/// Span carrying the correlation fields every connection-scoped record
/// should have. Enter it around party/connection operations.
pub fn connection_span(
    peer_id: &str,
    party_id: &str,
    session_id: &str,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "conn",
        peer_id = %peer_id,
        party_id = %party_id,
        session_id = %session_id,
        correlation_id = %correlation_id,
    )
}

/// Async appender for `network.log`: connection events, relay switches,
/// party membership changes. Fire-and-forget; a full queue drops entries
/// rather than stalling the caller.
#[derive(Clone)]
pub struct NetworkLog {
    tx: mpsc::Sender<String>,
}

impl NetworkLog {
    pub fn start(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(256);

        tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "network log unavailable");
                    // Drain and drop so senders never block.
                    while rx.recv().await.is_some() {}
                    return;
                }
            };

            while let Some(line) = rx.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::debug!(error = %e, "network log write failed");
                }
            }
            let _ = file.flush().await;
        });

        Self { tx }
    }

    pub fn record(&self, event: &str) {
        let line = format!("{} {}\n", epoch_secs(), event);
        if self.tx.try_send(line).is_err() {
            tracing::trace!("network log queue full, entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.log");
        let log = NetworkLog::start(path.clone());

        log.record("peer connected peer_id=abc strategy=direct");
        log.record("relay switch old=a new=b");
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("peer connected"));
        assert!(lines[1].contains("relay switch"));
    }
}
