//! Cooperative shutdown.
//!
//! Every long-running task (ingestion loops, the scrape endpoint, discovery
//! deregistration, metrics upkeep) is spawned through the coordinator. On
//! shutdown the shared token is cancelled and the coordinator waits until
//! all of them have returned.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root token, cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled on shutdown that can also be cancelled on its own,
    /// e.g. to stop a single namespace.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns a task that shutdown will wait for.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "spawning tracked task");
        self.tracker.spawn(async move {
            task.await;
            debug!(task = name, "tracked task finished");
        });
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn running_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels every task and waits until all of them have finished.
    pub async fn shutdown(&self) {
        info!(tasks = self.tracker.len(), "shutting down");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("all tasks finished");
    }
}

/// Resolves with the name of the first termination signal received.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "could not install SIGTERM handler");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        name = ctrl_c() => name,
        _ = terminate.recv() => "SIGTERM",
    }
}

/// Resolves with the name of the first termination signal received.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(e) => {
            tracing::warn!(error = %e, "could not listen for Ctrl-C");
            std::future::pending().await
        }
    }
}
