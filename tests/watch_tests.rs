mod common;

use common::{expect_event, recorder, wait_until, Duration, TestEnvironment};
use filesentry::{ChangeObserver, FileWatcher};

/// FileWatcher tests against the real platform notification backend

const RECOVERY: Duration = Duration::from_millis(100);
const SHUTDOWN: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_write_is_reported_as_change() {
    let env = TestEnvironment::new();
    let file = env.files_dir.join("notes.txt");
    std::fs::write(&file, "v1").unwrap();

    let watcher = FileWatcher::new(RECOVERY, SHUTDOWN).unwrap();
    let (handler, mut events) = recorder();
    watcher.watch(&file, handler).await.unwrap();

    std::fs::write(&file, "v2").unwrap();
    expect_event(&mut events, "change", &file).await;

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_is_reported_and_path_becomes_pending() {
    let env = TestEnvironment::new();
    let file = env.files_dir.join("notes.txt");
    std::fs::write(&file, "v1").unwrap();

    let watcher = FileWatcher::new(RECOVERY, SHUTDOWN).unwrap();
    let (handler, mut events) = recorder();
    watcher.watch(&file, handler).await.unwrap();

    std::fs::remove_file(&file).unwrap();
    expect_event(&mut events, "delete", &file).await;

    assert!(wait_until(|| watcher.is_pending(&file)).await);
    assert!(!watcher.is_watching(&file));

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn test_recreated_file_is_rearmed() {
    let env = TestEnvironment::new();
    let file = env.files_dir.join("notes.txt");
    std::fs::write(&file, "v1").unwrap();

    let watcher = FileWatcher::new(RECOVERY, SHUTDOWN).unwrap();
    let (handler, mut events) = recorder();
    watcher.watch(&file, handler).await.unwrap();

    std::fs::remove_file(&file).unwrap();
    expect_event(&mut events, "delete", &file).await;

    std::fs::write(&file, "v2").unwrap();
    expect_event(&mut events, "change", &file).await;
    assert!(watcher.is_watching(&file));

    // The new inode is watched too
    std::fs::write(&file, "v3").unwrap();
    expect_event(&mut events, "change", &file).await;

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn test_rename_away_is_reported_as_delete() {
    let env = TestEnvironment::new();
    let file = env.files_dir.join("notes.txt");
    std::fs::write(&file, "v1").unwrap();

    let watcher = FileWatcher::new(RECOVERY, SHUTDOWN).unwrap();
    let (handler, mut events) = recorder();
    watcher.watch(&file, handler).await.unwrap();

    std::fs::rename(&file, env.files_dir.join("notes.txt.bak")).unwrap();
    expect_event(&mut events, "delete", &file).await;
    assert!(wait_until(|| watcher.is_pending(&file)).await);

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn test_unwatched_file_reports_nothing() {
    let env = TestEnvironment::new();
    let file = env.files_dir.join("notes.txt");
    std::fs::write(&file, "v1").unwrap();

    let watcher = FileWatcher::new(RECOVERY, SHUTDOWN).unwrap();
    let (handler, mut events) = recorder();
    watcher.watch(&file, handler.clone()).await.unwrap();
    watcher.unwatch(&file).await.unwrap();

    std::fs::write(&file, "v2").unwrap();
    let next = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
    assert!(next.is_err(), "unexpected event: {:?}", next);
    assert_eq!(watcher.counts(), (0, 0));

    watcher.close().await.unwrap();
}
