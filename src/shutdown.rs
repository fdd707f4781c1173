//! Process-wide shutdown: signal handling plus draining background tasks.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Resolve on Ctrl-C, SIGTERM, or an explicit [`shutdown`](Self::shutdown).
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            _ = ctrl_c() => info!("[shutdown] Received Ctrl-C"),
            _ = terminate() => info!("[shutdown] Received SIGTERM"),
            _ = self.token.cancelled() => {}
        }
        self.shutdown();
    }

    /// Cancel the token, then wait up to `timeout` for `handles` to finish.
    /// Tasks still running afterwards are aborted.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "[shutdown] Draining background tasks"
        );

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("[shutdown] Drain timed out after {timeout:?}, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[shutdown] Failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("[shutdown] Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coord = ShutdownCoordinator::default();
        assert!(!coord.token().is_cancelled());
    }

    #[tokio::test]
    async fn token_fires_once_the_signal_watcher_finishes() {
        let coord = std::sync::Arc::new(ShutdownCoordinator::new());
        let stop = coord.token();
        let watcher = coord.clone();
        let task = tokio::spawn(async move { watcher.wait_for_signal().await });

        assert!(!stop.is_cancelled());
        coord.shutdown();
        tokio::time::timeout(Duration::from_secs(1), stop.cancelled())
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[test]
    fn shutdown_is_idempotent_and_reaches_every_token() {
        let coord = ShutdownCoordinator::new();
        let a = coord.token();
        let b = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.token().is_cancelled());
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_signal_returns_after_explicit_shutdown() {
        let coord = ShutdownCoordinator::new();
        coord.shutdown();
        tokio::time::timeout(Duration::from_secs(1), coord.wait_for_signal())
            .await
            .expect("explicit shutdown should end the wait");
    }

    #[tokio::test]
    async fn drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            let _ = done_tx.send(());
        });

        coord.drain(vec![handle], None).await;
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stuck_tasks() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let abort = handle.abort_handle();

        coord
            .drain(vec![handle], Some(Duration::from_millis(100)))
            .await;
        for _ in 0..100 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }
}
