//! Long-running task supervision.
//!
//! Every background loop (monitors, sweeps, pumps, the WebSocket reader)
//! registers here with a name. Shutdown flips one watch channel that all
//! tasks share, then awaits each of them under a single bounded deadline;
//! whatever does not finish in time is abandoned with a warning.

use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Overall deadline for graceful shutdown
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct TaskManager {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The cancellation signal handed to every registered task.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named task. The closure receives the shutdown receiver and
    /// must honor it within one tick of its loop.
    pub async fn spawn<F, Fut>(&self, name: &str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.shutdown_signal()));
        self.tasks.lock().await.push((name.to_string(), handle));
        tracing::debug!(task = name, "task registered");
    }

    /// Adopt an already-spawned task.
    pub async fn register(&self, name: &str, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name.to_string(), handle));
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancel everything and wait up to `deadline` overall. Tasks still
    /// running at the deadline are aborted.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<(String, JoinHandle<()>)> =
            self.tasks.lock().await.drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        tracing::info!(count = tasks.len(), "shutting down tasks");

        let overall = tokio::time::Instant::now() + deadline;
        for (name, handle) in tasks {
            let remaining = overall.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "task finished"),
                Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "task panicked"),
                Err(_) => {
                    tracing::warn!(task = %name, "task ignored shutdown, abandoning");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tasks_stop_on_shutdown() {
        let manager = TaskManager::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        manager
            .spawn("ticker", move |mut shutdown| async move {
                let mut tick = tokio::time::interval(Duration::from_millis(10));
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                let _ = done_tx.send(());
                                return;
                            }
                        }
                    }
                }
            })
            .await;

        manager.shutdown_all(Duration::from_secs(2)).await;
        assert!(done_rx.await.is_ok());
        assert_eq!(manager.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_stubborn_task_is_abandoned_within_deadline() {
        let manager = TaskManager::new();
        manager
            .spawn("stubborn", |_shutdown| async {
                // Never looks at the shutdown signal.
                std::future::pending::<()>().await;
            })
            .await;

        let started = std::time::Instant::now();
        manager.shutdown_all(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_shutdown_with_no_tasks_is_noop() {
        let manager = TaskManager::new();
        manager.shutdown_all(Duration::from_millis(50)).await;
    }
}
