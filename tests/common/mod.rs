//! Common test utilities and helpers for FileSentry tests
#![allow(dead_code)]

use async_trait::async_trait;
use filesentry::config::RepositoryConfig;
use filesentry::WatchHandler;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub use std::time::Duration;

/// A bare "remote" plus a checkout location inside one temp dir
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub remote: PathBuf,
    pub checkout: PathBuf,
    pub files_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remote = temp_dir.path().join("remote.git");
        let checkout = temp_dir.path().join("checkout");
        let files_dir = temp_dir.path().join("files");

        std::fs::create_dir_all(&files_dir).expect("Failed to create files dir");
        git(temp_dir.path(), &["init", "--quiet", "--bare", remote.to_str().unwrap()]);

        Self {
            temp_dir,
            remote,
            checkout,
            files_dir,
        }
    }

    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            url: self.remote.to_string_lossy().into_owned(),
            path: self.checkout.to_string_lossy().into_owned(),
            ..RepositoryConfig::default()
        }
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.temp_dir.path().join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Commit subjects in the checkout, newest first
    pub fn local_log(&self) -> Vec<String> {
        log_subjects(&["-C", self.checkout.to_str().unwrap(), "log", "--format=%s"])
    }

    /// Commit subjects on every branch of the remote, newest first
    pub fn remote_log(&self) -> Vec<String> {
        let git_dir = format!("--git-dir={}", self.remote.display());
        log_subjects(&[&git_dir, "log", "--all", "--format=%s"])
    }
}

/// Run git and panic on failure
pub fn git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("Failed to execute git");

    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn log_subjects(args: &[&str]) -> Vec<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .expect("Failed to execute git");

    // An empty repository has no log
    if !output.status.success() {
        return Vec::new();
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Handler that forwards every callback into a channel
pub struct Recorder {
    events: mpsc::UnboundedSender<(&'static str, PathBuf)>,
}

#[async_trait]
impl WatchHandler for Recorder {
    async fn on_change(&self, path: &Path) {
        let _ = self.events.send(("change", path.to_path_buf()));
    }

    async fn on_delete(&self, path: &Path) {
        let _ = self.events.send(("delete", path.to_path_buf()));
    }
}

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<(&'static str, PathBuf)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { events: tx }), rx)
}

/// Wait until `kind` is reported for `path`, skipping unrelated events
pub async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<(&'static str, PathBuf)>,
    kind: &str,
    path: &Path,
) {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some((event, event_path)) = events.recv().await {
            if event == kind && event_path == path {
                return true;
            }
        }
        false
    })
    .await;

    assert_eq!(found, Ok(true), "no '{}' event for {}", kind, path.display());
}

/// Poll `condition` until it holds, giving up after ten seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
