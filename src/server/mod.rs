//! Per-platform watch servers.
//!
//! Each platform module owns a dedicated run-loop thread, the registry of
//! active watch points, and the termination protocol. The caller thread
//! never touches a watch point directly: structural changes travel through
//! a command channel and a platform wakeup primitive (self-pipe on Linux,
//! run-loop wake on macOS, user APC on Windows), and the loop replies once
//! the mutation has been applied.
//!
//! # Architecture
//!
//! ```text
//! FileWatcher (caller thread)
//!   - validates paths
//!   - enqueues Register/Unregister/Shutdown commands
//!   - blocks on replies / the termination signal
//!         |
//!   wakeup primitive
//!         |
//! run-loop thread (one per server)
//!   - blocks in the OS wait primitive
//!   - owns the watch-point registry
//!   - normalizes raw OS events and calls the sink
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::WatchError;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub(crate) use linux::LinuxServer as PlatformServer;
#[cfg(target_os = "macos")]
pub(crate) use macos::MacServer as PlatformServer;
#[cfg(windows)]
pub(crate) use windows::WindowsServer as PlatformServer;

/// A structural mutation request from the caller thread to the run loop.
pub(crate) enum ServerCommand {
    Register {
        path: PathBuf,
        reply: Sender<Result<(), WatchError>>,
    },
    Unregister {
        path: PathBuf,
        reply: Sender<bool>,
    },
    Shutdown,
}

/// Termination handshake between the run loop and `close`.
///
/// The run loop signals exactly once, after its last watch point has been
/// reaped; `close` waits with a caller-supplied timeout and may wait again
/// later to extend it.
pub(crate) struct Termination {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Termination {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        let mut done = self.done.lock().expect("termination lock");
        *done = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for the run loop to finish. Returns whether it
    /// has terminated.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().expect("termination lock");
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .expect("termination lock");
        *done
    }

    pub(crate) fn is_terminated(&self) -> bool {
        *self.done.lock().expect("termination lock")
    }
}

/// Validate a path before it is handed to the run loop.
///
/// Paths must always be absolute. On every platform except macOS they must
/// also name an existing directory; FSEvents accepts missing or
/// non-directory paths silently, and that platform behavior is preserved.
pub(crate) fn validate_watch_target(path: &Path) -> Result<(), WatchError> {
    if !path.is_absolute() {
        return Err(WatchError::InvalidTarget {
            path: path.to_path_buf(),
            reason: "path is not absolute".to_string(),
        });
    }

    #[cfg(not(target_os = "macos"))]
    {
        let metadata = std::fs::metadata(path).map_err(|err| WatchError::InvalidTarget {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(WatchError::InvalidTarget {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_relative_path_is_rejected() {
        let err = validate_watch_target(Path::new("relative/dir")).unwrap_err();
        assert!(matches!(err, WatchError::InvalidTarget { .. }));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_file_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        let err = validate_watch_target(&file).unwrap_err();
        match err {
            WatchError::InvalidTarget { path, reason } => {
                assert_eq!(path, file);
                assert!(reason.contains("not a directory"));
            }
            other => panic!("expected InvalidTarget, got {other:?}"),
        }
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_missing_target_is_rejected() {
        let err = validate_watch_target(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, WatchError::InvalidTarget { .. }));
    }

    #[test]
    fn test_termination_signal_wakes_waiter() {
        let termination = Arc::new(Termination::new());
        assert!(!termination.wait(Duration::from_millis(10)));

        let signaller = Arc::clone(&termination);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal();
        });

        assert!(termination.wait(Duration::from_secs(2)));
        assert!(termination.is_terminated());
        handle.join().unwrap();
    }
}
