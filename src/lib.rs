//! Cross-platform filesystem change notification engine.
//!
//! Watches one or more directory trees on disk and delivers change events
//! (create, remove, modify, invalidate, overflow) to a caller-supplied
//! [`ChangeSink`]. Three operating-system mechanisms sit behind one
//! contract: FSEvents on macOS, inotify on Linux, and overlapped
//! `ReadDirectoryChangesW` reads on Windows.
//!
//! # Architecture
//!
//! ```text
//! FileWatcher
//!   - public handle, closed-state tracking
//!         |
//! platform server (one dedicated run-loop thread)
//!   - watch-point registry, termination protocol
//!   - LinuxServer / MacServer / WindowsServer
//!         |
//! SinkDispatcher -> ChangeSink (user code, panic-isolated)
//! ```
//!
//! Events are delivered synchronously on the run-loop thread, in the order
//! the OS produced them for each watched root. No ordering is promised
//! across roots.
//!
//! # Platform notes
//!
//! - Linux watches a single directory level per root; macOS and Windows
//!   watch recursively. This asymmetry follows the native facilities.
//! - On Windows a notification-buffer overflow surfaces as
//!   [`ChangeType::Invalidated`] for the root; Linux and macOS report
//!   [`ChangeType::Overflow`].
//! - On macOS, watching a missing or non-directory path succeeds silently.

pub mod config;
mod error;
mod event;
pub mod logging;
mod server;
mod sink;
mod watcher;

pub use config::WatcherConfig;
pub use error::WatchError;
pub use event::ChangeType;
pub use sink::{ChangeSink, ChannelSink};
pub use watcher::FileWatcher;
