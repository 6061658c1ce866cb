//! Error types for the watcher engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
///
/// Errors raised by calls on the caller thread are returned synchronously;
/// errors arising on the run-loop thread are delivered through
/// [`ChangeSink::report_error`](crate::ChangeSink::report_error).
#[derive(Error, Debug, Clone)]
pub enum WatchError {
    /// The run loop could not start (OS resource exhaustion, permissions).
    /// This is the only error fatal to a watcher.
    #[error("failed to initialize watcher: {reason}")]
    Initialization { reason: String },

    /// The path is not absolute, or does not refer to a directory where the
    /// platform requires one.
    #[error("cannot watch {path}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },

    /// The path is already registered with this watcher.
    #[error("already watching {path}")]
    AlreadyWatching { path: PathBuf },

    /// The OS refused to install the watch.
    #[error("failed to install watch for {path}: os error {code}")]
    WatchFailed { path: PathBuf, code: i32 },

    /// The user callback panicked; the original panic message is preserved.
    #[error("change callback failed: {message}")]
    CallbackFailure { message: String },

    /// `close` was called after a previous `close` already completed.
    #[error("watcher is already closed")]
    AlreadyClosed,

    /// Unexpected OS return on the run loop.
    #[error("internal watcher error ({context}): os error {code}")]
    Internal { code: i32, context: String },
}

impl WatchError {
    pub(crate) fn initialization(err: &std::io::Error) -> Self {
        WatchError::Initialization {
            reason: err.to_string(),
        }
    }

    pub(crate) fn watch_failed(path: PathBuf, err: &std::io::Error) -> Self {
        WatchError::WatchFailed {
            path,
            code: err.raw_os_error().unwrap_or(-1),
        }
    }

    pub(crate) fn internal(context: &str, err: &std::io::Error) -> Self {
        WatchError::Internal {
            code: err.raw_os_error().unwrap_or(-1),
            context: context.to_string(),
        }
    }

    /// The run-loop thread or its command channel went away unexpectedly.
    pub(crate) fn disconnected() -> Self {
        WatchError::Internal {
            code: -1,
            context: "run loop is gone".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_path() {
        let err = WatchError::AlreadyWatching {
            path: PathBuf::from("/tmp/root"),
        };
        assert!(err.to_string().contains("/tmp/root"));

        let err = WatchError::WatchFailed {
            path: PathBuf::from("/tmp/root"),
            code: 13,
        };
        assert!(err.to_string().contains("os error 13"));
    }

    #[test]
    fn test_callback_failure_preserves_message() {
        let err = WatchError::CallbackFailure {
            message: "sink exploded".to_string(),
        };
        assert!(err.to_string().contains("sink exploded"));
    }
}
