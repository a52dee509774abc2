//! File Watcher - turns native filesystem notifications into change/delete callbacks
//!
//! A [`FileWatcher`] owns two maps:
//!
//! - the active registry: paths with an armed native watch
//! - the pending set: paths that do not exist right now (never existed, or
//!   were removed/renamed away) and are polled until they reappear
//!
//! A path lives in at most one of them. Native watches are tied to the
//! inode, so a removed or renamed file silently stops producing events; the
//! delivery task moves such paths to the pending set and the recovery task
//! re-arms them once the path exists again.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Receiver of semantic file events for one watched path
#[async_trait]
pub trait WatchHandler: Send + Sync {
    /// The file was written, or reappeared after a removal
    async fn on_change(&self, path: &Path);

    /// The file was removed or renamed away
    async fn on_delete(&self, path: &Path);
}

/// Capability contract of a change observer
#[async_trait]
pub trait ChangeObserver: Send + Sync {
    /// Start delivering events for `path` to `handler`.
    ///
    /// A path that does not exist yet is remembered and armed once it appears.
    async fn watch(&self, path: &Path, handler: Arc<dyn WatchHandler>) -> Result<()>;

    /// Stop delivering events for `path`. Unknown paths are not an error.
    async fn unwatch(&self, path: &Path) -> Result<()>;

    /// Stop all background work. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Operation kinds the watcher reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Write,
    Remove,
    Rename,
}

impl FsOp {
    /// Map a native event kind, ignoring kinds that carry no content change
    pub fn classify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Modify(ModifyKind::Name(_)) => Some(FsOp::Rename),
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                Some(FsOp::Write)
            }
            EventKind::Remove(_) => Some(FsOp::Remove),
            _ => None,
        }
    }
}

enum RawEvent {
    Fs(Event),
    Error(notify::Error),
}

type HandlerMap = HashMap<PathBuf, Arc<dyn WatchHandler>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the public API and the background tasks
struct Shared {
    native: Mutex<Option<RecommendedWatcher>>,
    callbacks: Mutex<HandlerMap>,
    pending: Mutex<HandlerMap>,
}

impl Shared {
    fn arm(&self, path: &Path) -> Result<()> {
        let mut native = lock(&self.native);
        let watcher = native.as_mut().ok_or_else(|| anyhow!("Watcher is closed"))?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Unable to watch {}", path.display()))
    }

    fn disarm(&self, path: &Path) -> Result<()> {
        let mut native = lock(&self.native);
        match native.as_mut() {
            Some(watcher) => watcher
                .unwatch(path)
                .with_context(|| format!("Unable to unwatch {}", path.display())),
            None => Ok(()),
        }
    }

    fn activate(&self, path: &Path, handler: Arc<dyn WatchHandler>) -> Result<()> {
        self.arm(path)?;
        lock(&self.callbacks).insert(path.to_path_buf(), handler);
        Ok(())
    }

    /// Move `path` from the registry to the pending set, dropping its native watch
    fn move_to_pending(&self, path: &Path) {
        let Some(handler) = lock(&self.callbacks).remove(path) else {
            return;
        };

        // The kernel usually dropped the watch together with the inode
        if let Err(e) = self.disarm(path) {
            debug!(path = %path.display(), "Stale watch already gone: {:#}", e);
        }

        lock(&self.pending).insert(path.to_path_buf(), handler);
    }

    fn pending_paths(&self) -> Vec<PathBuf> {
        lock(&self.pending).keys().cloned().collect()
    }

    /// Re-arm the pending paths found on disk again
    fn rearm_recreated(&self, existing: Vec<PathBuf>) -> Vec<(PathBuf, Arc<dyn WatchHandler>)> {
        let mut recovered = Vec::new();

        for path in existing {
            let Some(handler) = lock(&self.pending).remove(&path) else {
                continue;
            };

            match self.arm(&path) {
                Ok(()) => {
                    lock(&self.callbacks).insert(path.clone(), handler.clone());
                    info!(path = %path.display(), "Watched path reappeared");
                    recovered.push((path, handler));
                }
                Err(e) => {
                    warn!(path = %path.display(), "Unable to re-arm watch: {:#}", e);
                    lock(&self.pending).insert(path, handler);
                }
            }
        }

        recovered
    }

    async fn dispatch(&self, path: &Path, op: FsOp) {
        let handler = lock(&self.callbacks).get(path).cloned();
        let Some(handler) = handler else {
            return;
        };

        match op {
            FsOp::Write => handler.on_change(path).await,
            // Stays registered until on_delete returns, so recovery cannot overtake it
            FsOp::Remove | FsOp::Rename => {
                handler.on_delete(path).await;
                self.move_to_pending(path);
            }
        }
    }
}

/// [`ChangeObserver`] backed by the platform's native notification API
pub struct FileWatcher {
    shared: Arc<Shared>,
    shutdown_sender: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    closed: AtomicBool,
}

impl FileWatcher {
    /// Create the watcher and spawn its delivery and recovery tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(recovery_interval: Duration, shutdown_timeout: Duration) -> Result<Self> {
        if recovery_interval.is_zero() {
            bail!("Recovery interval must be greater than zero");
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let native = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let raw = match res {
                    Ok(event) => RawEvent::Fs(event),
                    Err(e) => RawEvent::Error(e),
                };
                // Receiver is gone only after close
                let _ = event_tx.send(raw);
            },
            notify::Config::default(),
        )
        .context("Unable to establish file watcher")?;

        let shared = Arc::new(Shared {
            native: Mutex::new(Some(native)),
            callbacks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });

        let (shutdown_sender, _) = broadcast::channel(1);

        let delivery = tokio::spawn(deliver_events(
            shared.clone(),
            event_rx,
            shutdown_sender.subscribe(),
        ));
        let recovery = tokio::spawn(recover_recreated(
            shared.clone(),
            recovery_interval,
            shutdown_sender.subscribe(),
        ));

        Ok(Self {
            shared,
            shutdown_sender,
            tasks: Mutex::new(vec![delivery, recovery]),
            shutdown_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Whether `path` currently has an armed native watch
    pub fn is_watching(&self, path: &Path) -> bool {
        lock(&self.shared.callbacks).contains_key(path)
    }

    /// Whether `path` is waiting to be recreated
    pub fn is_pending(&self, path: &Path) -> bool {
        lock(&self.shared.pending).contains_key(path)
    }

    /// Number of paths with an armed watch and number of pending paths
    pub fn counts(&self) -> (usize, usize) {
        let active = lock(&self.shared.callbacks).len();
        let pending = lock(&self.shared.pending).len();
        (active, pending)
    }

    fn release(&self) {
        let _ = self.shutdown_sender.send(());

        // Dropping the native watcher also closes the event channel
        let native = lock(&self.shared.native).take();
        drop(native);

        lock(&self.shared.callbacks).clear();
        lock(&self.shared.pending).clear();
    }
}

#[async_trait]
impl ChangeObserver for FileWatcher {
    async fn watch(&self, path: &Path, handler: Arc<dyn WatchHandler>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("Watcher is closed");
        }

        lock(&self.shared.pending).remove(path);
        if lock(&self.shared.callbacks).remove(path).is_some() {
            if let Err(e) = self.shared.disarm(path) {
                debug!(path = %path.display(), "Previous watch already gone: {:#}", e);
            }
        }

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Path does not exist yet, waiting for creation");
            lock(&self.shared.pending).insert(path.to_path_buf(), handler);
            return Ok(());
        }

        self.shared.activate(path, handler)
    }

    async fn unwatch(&self, path: &Path) -> Result<()> {
        lock(&self.shared.pending).remove(path);

        if lock(&self.shared.callbacks).remove(path).is_none() {
            return Ok(());
        }

        self.shared.disarm(path)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Stopping file watcher");
        self.release();

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        let joined = timeout(self.shutdown_timeout, async {
            for task in tasks.iter_mut() {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        return Err(anyhow!("Watcher task panicked: {}", e));
                    }
                }
            }
            Ok(())
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(_) => {
                for task in &tasks {
                    task.abort();
                }
                Err(anyhow!(
                    "Watcher tasks did not stop within {:?}",
                    self.shutdown_timeout
                ))
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release();
        }
    }
}

/// Event-delivery task: one event at a time, so per-path order is kept
async fn deliver_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let raw = tokio::select! {
            _ = shutdown.recv() => break,
            raw = events.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        match raw {
            RawEvent::Error(e) => error!("Watcher error occurred: {}", e),
            RawEvent::Fs(event) => {
                let Some(op) = FsOp::classify(&event.kind) else {
                    continue;
                };
                for path in &event.paths {
                    debug!(path = %path.display(), ?op, "Filesystem event");
                    shared.dispatch(path, op).await;
                }
            }
        }
    }

    debug!("Event delivery stopped");
}

/// Recovery task: polls pending paths, since a removed path has no watch to report its creation
async fn recover_recreated(
    shared: Arc<Shared>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let candidates = shared.pending_paths();
                if candidates.is_empty() {
                    continue;
                }

                let existing = tokio::task::spawn_blocking(move || {
                    candidates.into_iter().filter(|path| path.exists()).collect::<Vec<PathBuf>>()
                })
                .await
                .unwrap_or_else(|e| {
                    error!("Recreation check failed: {}", e);
                    Vec::new()
                });

                for (path, handler) in shared.rearm_recreated(existing) {
                    handler.on_change(&path).await;
                }
            }
        }
    }

    debug!("Recreation polling stopped");
}
