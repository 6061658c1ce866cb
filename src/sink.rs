//! Event delivery to the embedding application.
//!
//! The engine pushes every normalized event through a caller-supplied
//! [`ChangeSink`]. Sinks are always invoked from the watcher's run-loop
//! thread, never from the thread that created the watcher, so they must be
//! prepared to hand work off rather than block.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;

use crate::error::WatchError;
use crate::event::ChangeType;

/// Receives normalized change notifications and error reports.
///
/// Both methods are called synchronously from the run-loop thread. A panic
/// in [`path_changed`](Self::path_changed) does not kill the watcher: it is
/// caught, wrapped in [`WatchError::CallbackFailure`] with the original
/// message, and delivered through [`report_error`](Self::report_error). A
/// panic in `report_error` is logged and suppressed.
pub trait ChangeSink: Send + Sync {
    /// A change was observed under a watched root. `path` is always absolute.
    fn path_changed(&self, change: ChangeType, path: &Path);

    /// An error occurred on the run-loop thread.
    fn report_error(&self, error: &WatchError);
}

/// A sink that forwards events and errors into crossbeam channels.
///
/// Convenient for tests and for embedders that want to consume events from
/// their own thread instead of inside the watcher callback.
pub struct ChannelSink {
    events: Sender<(ChangeType, PathBuf)>,
    errors: Sender<WatchError>,
}

impl ChannelSink {
    pub fn new(events: Sender<(ChangeType, PathBuf)>, errors: Sender<WatchError>) -> Self {
        Self { events, errors }
    }
}

impl ChangeSink for ChannelSink {
    fn path_changed(&self, change: ChangeType, path: &Path) {
        let _ = self.events.send((change, path.to_path_buf()));
    }

    fn report_error(&self, error: &WatchError) {
        let _ = self.errors.send(error.clone());
    }
}

/// Wraps the user sink with panic isolation for the run loop.
///
/// The run-loop thread must survive arbitrary user callbacks, and on macOS
/// and Windows the call sites sit below C callback frames that unwinding
/// must never cross.
pub(crate) struct SinkDispatcher {
    sink: Box<dyn ChangeSink>,
}

impl SinkDispatcher {
    pub(crate) fn new(sink: Box<dyn ChangeSink>) -> Self {
        Self { sink }
    }

    /// Deliver one event, converting a sink panic into a reported
    /// `CallbackFailure`.
    pub(crate) fn dispatch(&self, change: ChangeType, path: &Path) {
        tracing::trace!("[event] {} {}", change, path.display());
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.sink.path_changed(change, path);
        }));
        if let Err(payload) = result {
            self.report(&WatchError::CallbackFailure {
                message: panic_message(payload.as_ref()),
            });
        }
    }

    /// Deliver an error report, suppressing any panic it raises itself.
    pub(crate) fn report(&self, error: &WatchError) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.sink.report_error(error);
        }));
        if result.is_err() {
            tracing::error!("[sink] error report for `{error}` panicked; suppressed");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    struct PanickingSink {
        errors: Sender<WatchError>,
    }

    impl ChangeSink for PanickingSink {
        fn path_changed(&self, _change: ChangeType, _path: &Path) {
            panic!("sink exploded");
        }

        fn report_error(&self, error: &WatchError) {
            let _ = self.errors.send(error.clone());
        }
    }

    #[test]
    fn test_dispatch_wraps_panic_in_callback_failure() {
        let (error_tx, error_rx) = unbounded();
        let dispatcher = SinkDispatcher::new(Box::new(PanickingSink { errors: error_tx }));

        dispatcher.dispatch(ChangeType::Created, Path::new("/tmp/a.txt"));

        let reported = error_rx.try_recv().expect("one error report");
        match reported {
            WatchError::CallbackFailure { message } => {
                assert!(message.contains("sink exploded"));
            }
            other => panic!("expected CallbackFailure, got {other:?}"),
        }
        assert!(error_rx.try_recv().is_err(), "exactly one report expected");
    }

    struct DoublePanicSink;

    impl ChangeSink for DoublePanicSink {
        fn path_changed(&self, _change: ChangeType, _path: &Path) {
            panic!("first failure");
        }

        fn report_error(&self, _error: &WatchError) {
            panic!("report also fails");
        }
    }

    #[test]
    fn test_panicking_report_is_suppressed() {
        let dispatcher = SinkDispatcher::new(Box::new(DoublePanicSink));
        // Must not propagate either panic.
        dispatcher.dispatch(ChangeType::Modified, Path::new("/tmp/b.txt"));
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (event_tx, event_rx) = unbounded();
        let (error_tx, _error_rx) = unbounded();
        let sink = ChannelSink::new(event_tx, error_tx);

        sink.path_changed(ChangeType::Removed, Path::new("/tmp/gone.txt"));

        let (change, path) = event_rx.try_recv().unwrap();
        assert_eq!(change, ChangeType::Removed);
        assert_eq!(path, PathBuf::from("/tmp/gone.txt"));
    }
}
