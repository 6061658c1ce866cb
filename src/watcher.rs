//! Public watcher handle.
//!
//! A [`FileWatcher`] owns one platform server and tracks the closed state
//! required by the `close` contract. All methods are callable from any
//! thread; events are always delivered on the watcher's own run-loop
//! thread.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::log_event;
use crate::server::PlatformServer;
use crate::sink::{ChangeSink, SinkDispatcher};

/// Watches directory trees and delivers change events to a [`ChangeSink`].
///
/// # Examples
///
/// ```no_run
/// use std::path::PathBuf;
/// use std::time::Duration;
/// use crossbeam_channel::unbounded;
/// use vigil::{ChannelSink, FileWatcher};
///
/// # fn main() -> Result<(), vigil::WatchError> {
/// let (event_tx, event_rx) = unbounded();
/// let (error_tx, _error_rx) = unbounded();
///
/// let watcher = FileWatcher::new(Box::new(ChannelSink::new(event_tx, error_tx)))?;
/// watcher.start_watching(&[PathBuf::from("/tmp/project")])?;
///
/// while let Ok((change, path)) = event_rx.recv() {
///     println!("{change}: {}", path.display());
/// }
///
/// watcher.close(Duration::from_secs(5))?;
/// # Ok(())
/// # }
/// ```
pub struct FileWatcher {
    server: PlatformServer,
    config: WatcherConfig,
    /// Set once a `close` call has observed complete termination.
    closed: Mutex<bool>,
}

impl FileWatcher {
    /// Create a watcher with the default configuration.
    ///
    /// Spawns the run-loop thread; fails with
    /// [`WatchError::Initialization`] if the loop cannot start.
    pub fn new(sink: Box<dyn ChangeSink>) -> Result<Self, WatchError> {
        Self::with_config(sink, WatcherConfig::default())
    }

    /// Create a watcher with an explicit configuration.
    pub fn with_config(
        sink: Box<dyn ChangeSink>,
        config: WatcherConfig,
    ) -> Result<Self, WatchError> {
        let dispatcher = SinkDispatcher::new(sink);
        let server = PlatformServer::start(dispatcher, &config)?;
        log_event!("watcher", "started");
        Ok(Self {
            server,
            config,
            closed: Mutex::new(false),
        })
    }

    /// The batching latency of the underlying OS subscription.
    pub fn latency(&self) -> Duration {
        self.config.latency()
    }

    /// Start watching the given absolute directory paths.
    ///
    /// Each path is validated, then registered on the run-loop thread; the
    /// call returns once every registration has been acknowledged. Errors:
    /// [`WatchError::InvalidTarget`], [`WatchError::AlreadyWatching`],
    /// [`WatchError::WatchFailed`]. Paths registered before a failing entry
    /// stay registered.
    pub fn start_watching(&self, paths: &[PathBuf]) -> Result<(), WatchError> {
        self.ensure_open()?;
        self.server.register_paths(paths)
    }

    /// Stop watching the given paths. Idempotent per path: paths that were
    /// never watched are silently accepted.
    ///
    /// Returns whether all paths were previously watched. Events the OS
    /// observed before the unregistration is acknowledged may still be
    /// delivered; callers must tolerate a short tail.
    pub fn stop_watching(&self, paths: &[PathBuf]) -> Result<bool, WatchError> {
        self.ensure_open()?;
        self.server.unregister_paths(paths)
    }

    /// Shut the watcher down, draining in-flight events.
    ///
    /// Returns `Ok(true)` once the run loop has terminated, or `Ok(false)`
    /// if `timeout` elapsed first; the watcher then remains in a draining
    /// state and `close` may be called again to extend the wait. Calling
    /// `close` after a completed close fails with
    /// [`WatchError::AlreadyClosed`].
    pub fn close(&self, timeout: Duration) -> Result<bool, WatchError> {
        let mut closed = self.closed.lock().expect("closed flag");
        if *closed {
            return Err(WatchError::AlreadyClosed);
        }
        let drained = self.server.shutdown(timeout);
        if drained {
            *closed = true;
            log_event!("watcher", "closed");
        }
        Ok(drained)
    }

    fn ensure_open(&self) -> Result<(), WatchError> {
        if *self.closed.lock().expect("closed flag") {
            return Err(WatchError::AlreadyClosed);
        }
        Ok(())
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        let closed = self.closed.get_mut().expect("closed flag");
        if !*closed {
            *closed = self.server.shutdown(Duration::from_secs(5));
        }
    }
}
