//! Daemon - wires configuration, store, watcher, processor and pusher together
//!
//! Startup: resolve credentials, open or clone the repository, register every
//! managed path and start the pusher. Shutdown runs in reverse on SIGINT or
//! SIGTERM: stop the pusher, then close the processor (final push and watcher
//! teardown), all bounded by the configured shutdown timeout.

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::config::Config;
use crate::git::GitStore;
use crate::processor::{combine_errors, ManageSummary, Processor};
use crate::pusher::Pusher;
use crate::store::VersionedStore;
use crate::watch::FileWatcher;

/// Foreground daemon
pub struct Daemon {
    config: Arc<Config>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Run until SIGINT/SIGTERM, then shut down gracefully
    pub async fn run(&self) -> Result<()> {
        info!("Starting FileSentry daemon");

        let credentials = auth::resolve(&self.config.repository.auth)
            .await
            .context("Unable to extract authentication information from configuration")?;

        let store: Arc<dyn VersionedStore> = Arc::new(
            GitStore::open_or_clone(&self.config.repository, credentials)
                .await
                .context("Unable to initialise git repository")?,
        );

        self.run_with_store(store, wait_for_shutdown_signal()).await
    }

    /// Run against an already opened store until `shutdown_signal` completes
    pub async fn run_with_store<F>(&self, store: Arc<dyn VersionedStore>, shutdown_signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let shutdown_timeout = self.config.shutdown_timeout()?;

        let watcher = FileWatcher::new(self.config.recovery_interval()?, shutdown_timeout)
            .context("Unable to establish file watcher")?;
        let processor = Processor::new(Arc::new(watcher), store.clone());

        let summary = self.manage_all(&processor).await;
        info!(
            "Watching {} files ({} failed, {} rejected)",
            summary.watched.len(),
            summary.failed.len(),
            summary.rejected.len()
        );

        let (shutdown_sender, _) = broadcast::channel(1);
        let pusher = Pusher::new(self.config.push_interval()?, store);
        let pusher_task = tokio::spawn(pusher.start(shutdown_sender.subscribe()));

        shutdown_signal.await;
        info!("Initialise shutdown of application");

        // One deadline for the whole sequence, final push included
        let deadline = Instant::now() + shutdown_timeout;

        let _ = shutdown_sender.send(());
        let pusher_result = Self::join_pusher(pusher_task, deadline, shutdown_timeout).await;
        let close_result = match timeout_at(deadline, processor.close()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "Final push and watcher shutdown did not finish within {:?}",
                shutdown_timeout
            )),
        };

        let result = combine_errors(
            [pusher_result, close_result]
                .into_iter()
                .filter_map(Result::err)
                .collect(),
        );

        if let Err(e) = &result {
            error!("Unable to shutdown correctly: {:#}", e);
        } else {
            info!("Shutdown complete");
        }

        result
    }

    async fn manage_all(&self, processor: &Processor) -> ManageSummary {
        let mut summary = ManageSummary::default();

        for path in self.config.managed_paths() {
            let managed = processor.manage(&path).await;
            if managed == ManageSummary::default() {
                warn!(path = %path.display(), "Managed directory contains no files");
            }
            summary.merge(managed);
        }

        summary
    }

    async fn join_pusher(task: JoinHandle<()>, deadline: Instant, limit: Duration) -> Result<()> {
        let abort = task.abort_handle();

        match timeout_at(deadline, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!("Pusher task failed: {}", e)),
            Err(_) => {
                abort.abort();
                Err(anyhow!("Pusher did not stop within {:?}", limit))
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Unable to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    debug!("Ctrl+C received");
}
