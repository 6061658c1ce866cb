//! End-to-end event delivery scenarios.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use tempfile::TempDir;
use vigil::{ChangeType, ChannelSink, FileWatcher, WatchError};

fn channel_watcher() -> (
    FileWatcher,
    Receiver<(ChangeType, PathBuf)>,
    Receiver<WatchError>,
) {
    let (event_tx, event_rx) = unbounded();
    let (error_tx, error_rx) = unbounded();
    let watcher =
        FileWatcher::new(Box::new(ChannelSink::new(event_tx, error_tx))).expect("start watcher");
    (watcher, event_rx, error_rx)
}

/// Block until an event matching the predicate arrives or the timeout
/// elapses. Non-matching events are consumed and discarded.
fn wait_for(
    events: &Receiver<(ChangeType, PathBuf)>,
    timeout: Duration,
    matches: impl Fn(ChangeType, &Path) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match events.recv_timeout(remaining) {
            Ok((change, path)) => {
                if matches(change, &path) {
                    return true;
                }
            }
            Err(_) => return false,
        }
    }
}

/// Collect every event that arrives within the window.
fn collect_for(
    events: &Receiver<(ChangeType, PathBuf)>,
    window: Duration,
) -> Vec<(ChangeType, PathBuf)> {
    let deadline = Instant::now() + window;
    let mut collected = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return collected;
        }
        match events.recv_timeout(remaining) {
            Ok(event) => collected.push(event),
            Err(_) => return collected,
        }
    }
}

#[test]
fn test_create_emits_created_with_absolute_path() {
    let dir = TempDir::new().unwrap();
    let (watcher, events, _errors) = channel_watcher();
    watcher
        .start_watching(&[dir.path().to_path_buf()])
        .unwrap();

    let target = dir.path().join("a.txt");
    fs::write(&target, b"").unwrap();

    assert!(
        wait_for(&events, Duration::from_secs(2), |change, path| {
            assert!(path.is_absolute(), "non-absolute path delivered: {path:?}");
            change == ChangeType::Created && path == target
        }),
        "expected a created event for {}",
        target.display()
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[test]
fn test_create_then_delete_orders_created_before_removed() {
    let dir = TempDir::new().unwrap();
    let (watcher, events, _errors) = channel_watcher();
    watcher
        .start_watching(&[dir.path().to_path_buf()])
        .unwrap();

    let target = dir.path().join("b.txt");
    fs::write(&target, b"short lived").unwrap();
    thread::sleep(Duration::from_millis(50));
    fs::remove_file(&target).unwrap();

    let collected = collect_for(&events, Duration::from_secs(1));
    let for_target: Vec<ChangeType> = collected
        .iter()
        .filter(|(_, path)| path == &target)
        .map(|(change, _)| *change)
        .collect();

    let created = for_target.iter().position(|c| *c == ChangeType::Created);
    let removed = for_target.iter().position(|c| *c == ChangeType::Removed);
    assert!(created.is_some(), "no created event in {for_target:?}");
    assert!(removed.is_some(), "no removed event in {for_target:?}");
    assert!(
        created < removed,
        "created must precede removed: {for_target:?}"
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[test]
fn test_rename_emits_removed_for_old_and_created_for_new() {
    let dir = TempDir::new().unwrap();
    let old = dir.path().join("x");
    fs::write(&old, b"payload").unwrap();

    let (watcher, events, _errors) = channel_watcher();
    watcher
        .start_watching(&[dir.path().to_path_buf()])
        .unwrap();

    let new = dir.path().join("y");
    fs::rename(&old, &new).unwrap();

    let collected = collect_for(&events, Duration::from_secs(1));
    assert!(
        collected
            .iter()
            .any(|(change, path)| *change == ChangeType::Removed && path == &old),
        "missing removed for old name in {collected:?}"
    );
    assert!(
        collected
            .iter()
            .any(|(change, path)| *change == ChangeType::Created && path == &new),
        "missing created for new name in {collected:?}"
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[test]
fn test_modify_emits_modified() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("notes.txt");
    fs::write(&target, b"v1").unwrap();

    let (watcher, events, _errors) = channel_watcher();
    watcher
        .start_watching(&[dir.path().to_path_buf()])
        .unwrap();

    fs::write(&target, b"v2 with more content").unwrap();

    assert!(
        wait_for(&events, Duration::from_secs(2), |change, path| {
            change == ChangeType::Modified && path == target
        }),
        "expected a modified event for {}",
        target.display()
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[test]
fn test_no_events_after_stop_watching() {
    let dir = TempDir::new().unwrap();
    let (watcher, events, _errors) = channel_watcher();
    let root = dir.path().to_path_buf();

    watcher.start_watching(&[root.clone()]).unwrap();
    assert!(watcher.stop_watching(&[root]).unwrap());

    fs::write(dir.path().join("z.txt"), b"unseen").unwrap();

    let collected = collect_for(&events, Duration::from_millis(500));
    assert!(
        collected.is_empty(),
        "no events expected after stop, got {collected:?}"
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[test]
fn test_deleting_the_watched_root_notifies_on_the_root() {
    let outer = TempDir::new().unwrap();
    let root = outer.path().join("root");
    fs::create_dir(&root).unwrap();

    let (watcher, events, _errors) = channel_watcher();
    watcher.start_watching(&[root.clone()]).unwrap();

    fs::remove_dir(&root).unwrap();

    // inotify reports the vanished root as removed; FSEvents signals a root
    // change, which surfaces as invalidated.
    assert!(
        wait_for(&events, Duration::from_secs(2), |change, path| {
            matches!(change, ChangeType::Removed | ChangeType::Invalidated) && path == root
        }),
        "expected removed or invalidated for the watched root"
    );

    // inotify reaps the watch on its own; stopping it again is a no-op.
    #[cfg(target_os = "linux")]
    {
        thread::sleep(Duration::from_millis(100));
        assert!(!watcher.stop_watching(&[root]).unwrap());
    }

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[cfg(target_os = "linux")]
#[test]
fn test_subdirectory_changes_are_not_delivered_on_linux() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("sub");
    fs::create_dir(&sub).unwrap();

    let (watcher, events, _errors) = channel_watcher();
    watcher
        .start_watching(&[dir.path().to_path_buf()])
        .unwrap();

    fs::write(sub.join("inner.txt"), b"below the watch").unwrap();

    let collected = collect_for(&events, Duration::from_millis(500));
    assert!(
        !collected
            .iter()
            .any(|(_, path)| path.ends_with("inner.txt")),
        "shallow watch must not see subdirectory files: {collected:?}"
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[cfg(any(target_os = "macos", windows))]
#[test]
fn test_subdirectory_changes_are_delivered_on_recursive_platforms() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("sub");
    fs::create_dir(&sub).unwrap();

    let (watcher, events, _errors) = channel_watcher();
    watcher
        .start_watching(&[dir.path().to_path_buf()])
        .unwrap();

    let inner = sub.join("inner.txt");
    fs::write(&inner, b"below the watch").unwrap();

    assert!(
        wait_for(&events, Duration::from_secs(2), |change, path| {
            change == ChangeType::Created && path.ends_with("sub/inner.txt")
        }),
        "recursive watch must see subdirectory files"
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}

#[test]
fn test_two_roots_deliver_independently() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    fs::create_dir(&first).unwrap();
    fs::create_dir(&second).unwrap();

    let (watcher, events, _errors) = channel_watcher();
    watcher
        .start_watching(&[first.clone(), second.clone()])
        .unwrap();

    fs::write(first.join("one.txt"), b"1").unwrap();
    fs::write(second.join("two.txt"), b"2").unwrap();

    let collected = collect_for(&events, Duration::from_secs(1));
    assert!(
        collected
            .iter()
            .any(|(change, path)| *change == ChangeType::Created
                && path == &first.join("one.txt")),
        "missing event under the first root: {collected:?}"
    );
    assert!(
        collected
            .iter()
            .any(|(change, path)| *change == ChangeType::Created
                && path == &second.join("two.txt")),
        "missing event under the second root: {collected:?}"
    );

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
}
