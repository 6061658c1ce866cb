//! macOS watch server backed by the FSEvents API.
//!
//! FSEvents delivers batches of path-level events with a bitmask of change
//! flags per entry. All registered roots share one event stream scheduled
//! on a dedicated `CFRunLoop` thread; structural mutations stop the loop,
//! rebuild the stream with the new root set, and start it again, which is
//! the scheduled-callback equivalent for this API.
//!
//! Watching a missing or non-directory path succeeds silently here; that is
//! the documented platform behavior, not an oversight.

#![allow(non_upper_case_globals)]

use std::collections::HashSet;
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;

use super::{validate_watch_target, Termination};
use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::event::ChangeType;
use crate::sink::SinkDispatcher;
use crate::{debug_event, log_event};

extern "C" {
    /// Whether the run loop is blocked waiting for an event. Not exposed by
    /// fsevent-sys.
    fn CFRunLoopIsWaiting(run_loop: cf::CFRef) -> cf::Boolean;
}

bitflags::bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    struct StreamFlags: u32 {
        const NONE = fs::kFSEventStreamEventFlagNone;
        const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
        const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
        const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
        const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
        const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
        const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
        const MOUNT = fs::kFSEventStreamEventFlagMount;
        const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
        const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
        const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
        const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
        const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
        const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
        const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
        const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
        const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
        const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
        const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
        const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
        const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
    }
}

const FALSE: cf::Boolean = 0;

/// Context handed to the FSEvents callback. Owned by the stream; freed by
/// `release_context` when the stream is released.
struct StreamContext {
    dispatcher: Arc<SinkDispatcher>,
    /// Roots whose `ROOT_CHANGED` already fired; no further events for them.
    stopped_roots: Arc<Mutex<HashSet<PathBuf>>>,
}

extern "C" fn release_context(info: *const c_void) {
    unsafe {
        drop(Box::from_raw(info as *const StreamContext as *mut StreamContext));
    }
}

/// Wrapper to move CF references across the spawning thread boundary.
struct CFSendWrapper(cf::CFRef);
unsafe impl Send for CFSendWrapper {}

pub(crate) struct MacServer {
    inner: Mutex<MacInner>,
    termination: Arc<Termination>,
}

struct MacInner {
    dispatcher: Arc<SinkDispatcher>,
    latency: cf::CFTimeInterval,
    roots: Vec<PathBuf>,
    stopped_roots: Arc<Mutex<HashSet<PathBuf>>>,
    runloop: Option<(CFSendWrapper, thread::JoinHandle<()>)>,
}

impl MacServer {
    pub(crate) fn start(
        dispatcher: SinkDispatcher,
        config: &WatcherConfig,
    ) -> Result<Self, WatchError> {
        Ok(Self {
            inner: Mutex::new(MacInner {
                dispatcher: Arc::new(dispatcher),
                latency: config.latency().as_secs_f64(),
                roots: Vec::new(),
                stopped_roots: Arc::new(Mutex::new(HashSet::new())),
                runloop: None,
            }),
            termination: Arc::new(Termination::new()),
        })
    }

    pub(crate) fn register_paths(&self, paths: &[PathBuf]) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().expect("mutation lock");
        for path in paths {
            validate_watch_target(path)?;
            if inner.roots.contains(path) {
                return Err(WatchError::AlreadyWatching { path: path.clone() });
            }
            inner.stop();
            inner.roots.push(path.clone());
            if let Err(err) = inner.run() {
                inner.roots.pop();
                let _ = inner.run();
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool, WatchError> {
        let mut inner = self.inner.lock().expect("mutation lock");
        let mut all_watched = true;
        for path in paths {
            match inner.roots.iter().position(|root| root == path) {
                Some(index) => {
                    inner.stop();
                    inner.roots.remove(index);
                    inner.stopped_roots.lock().expect("stopped roots").remove(path);
                    let _ = inner.run();
                }
                None => all_watched = false,
            }
        }
        Ok(all_watched)
    }

    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut inner = self.inner.lock().expect("mutation lock");
            inner.stop();
            inner.roots.clear();
            self.termination.signal();
        }
        self.termination.wait(timeout)
    }
}

impl MacInner {
    /// Stop the run-loop thread, leaving the root set intact.
    fn stop(&mut self) {
        if let Some((runloop, handle)) = self.runloop.take() {
            unsafe {
                while CFRunLoopIsWaiting(runloop.0) == 0 {
                    thread::yield_now();
                }
                cf::CFRunLoopStop(runloop.0 as _);
            }
            let _ = handle.join();
            debug_event!("macos", "run loop stopped");
        }
    }

    /// Build one stream over the current root set and run it on a fresh
    /// dedicated thread.
    fn run(&mut self) -> Result<(), WatchError> {
        if self.roots.is_empty() {
            return Ok(());
        }

        let paths = unsafe {
            let array =
                cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
            for root in &self.roots {
                let str_path = root.to_str().ok_or_else(|| WatchError::InvalidTarget {
                    path: root.clone(),
                    reason: "path contains invalid UTF-8".to_string(),
                })?;
                let mut err: cf::CFErrorRef = ptr::null_mut();
                let cf_path = cf::str_path_to_cfstring_ref(str_path, &mut err);
                if cf_path.is_null() {
                    if !err.is_null() {
                        cf::CFRelease(err as cf::CFRef);
                    }
                    continue;
                }
                cf::CFArrayAppendValue(array, cf_path);
                cf::CFRelease(cf_path);
            }
            array
        };

        let context_info = Box::into_raw(Box::new(StreamContext {
            dispatcher: Arc::clone(&self.dispatcher),
            stopped_roots: Arc::clone(&self.stopped_roots),
        }));
        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context_info as *mut c_void,
            retain: None,
            release: Some(release_context),
            copy_description: None,
        };

        let stream = unsafe {
            fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                callback,
                &stream_context,
                paths,
                fs::kFSEventStreamEventIdSinceNow,
                self.latency,
                fs::kFSEventStreamCreateFlagFileEvents
                    | fs::kFSEventStreamCreateFlagNoDefer
                    | fs::kFSEventStreamCreateFlagWatchRoot,
            )
        };
        unsafe { cf::CFRelease(paths as _) };

        let stream = CFSendWrapper(stream as cf::CFRef);
        let failed_path = self.roots.last().cloned().unwrap_or_default();
        let (rl_tx, rl_rx) = bounded(1);

        let handle = thread::Builder::new()
            .name("vigil-fsevents".to_string())
            .spawn(move || {
                let stream = stream.0 as fs::FSEventStreamRef;
                unsafe {
                    let current = cf::CFRunLoopGetCurrent();
                    fs::FSEventStreamScheduleWithRunLoop(
                        stream,
                        current,
                        cf::kCFRunLoopDefaultMode,
                    );
                    if fs::FSEventStreamStart(stream) == FALSE {
                        fs::FSEventStreamInvalidate(stream);
                        fs::FSEventStreamRelease(stream);
                        let _ = rl_tx.send(Err(WatchError::WatchFailed {
                            path: failed_path,
                            code: -1,
                        }));
                        return;
                    }
                    let _ = rl_tx.send(Ok(CFSendWrapper(current as _)));

                    cf::CFRunLoopRun();

                    fs::FSEventStreamStop(stream);
                    fs::FSEventStreamInvalidate(stream);
                    fs::FSEventStreamRelease(stream);
                }
            })
            .map_err(|err| WatchError::initialization(&err))?;

        let runloop = rl_rx.recv().map_err(|_| WatchError::disconnected())??;
        self.runloop = Some((runloop, handle));
        log_event!("macos", "watching", "{} roots", self.roots.len());
        Ok(())
    }
}

impl Drop for MacInner {
    fn drop(&mut self) {
        self.stop();
    }
}

extern "C" fn callback(
    _stream: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    let context = unsafe { &*(info as *const StreamContext) };
    let event_paths = event_paths as *const *const c_char;

    for index in 0..num_events {
        let path = unsafe {
            let bytes = CStr::from_ptr(*event_paths.add(index)).to_bytes();
            PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
        };
        let raw_flags = unsafe { *event_flags.add(index) };
        let flags = StreamFlags::from_bits_truncate(raw_flags);

        tracing::trace!("[macos] raw event {:#x} {}", raw_flags, path.display());
        deliver(context, flags, &path);
    }
}

fn deliver(context: &StreamContext, flags: StreamFlags, path: &Path) {
    {
        let stopped = context.stopped_roots.lock().expect("stopped roots");
        if stopped.iter().any(|root| path.starts_with(root)) {
            return;
        }
    }

    // The watched root itself moved or vanished; stop reporting for it.
    if flags.contains(StreamFlags::ROOT_CHANGED) {
        context
            .stopped_roots
            .lock()
            .expect("stopped roots")
            .insert(path.to_path_buf());
        context.dispatcher.dispatch(ChangeType::Invalidated, path);
        return;
    }

    if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
        context.dispatcher.dispatch(ChangeType::Overflow, path);
        return;
    }

    // FSEvents tags both sides of a rename with ITEM_RENAMED and never says
    // which is which; the disk state does. Symlinks are not followed so a
    // renamed symlink resolves by its own presence.
    let rename_target_exists =
        flags.contains(StreamFlags::ITEM_RENAMED) && path.symlink_metadata().is_ok();

    for change in map_item_flags(flags, rename_target_exists) {
        context.dispatcher.dispatch(change, path);
    }
}

/// Map item-level FSEvents flags onto the shared vocabulary.
///
/// An entry carrying several flags produces several events, in (Created,
/// Modified, Removed) order so a create-modify-remove burst within one
/// batch keeps its observable causality. `rename_target_exists` resolves an
/// ITEM_RENAMED entry: the new name of a rename still exists and maps to
/// Created, the old name is gone and maps to Removed.
fn map_item_flags(flags: StreamFlags, rename_target_exists: bool) -> Vec<ChangeType> {
    let renamed = flags.contains(StreamFlags::ITEM_RENAMED);
    let mut changes = Vec::new();
    if flags.contains(StreamFlags::ITEM_CREATED) || (renamed && rename_target_exists) {
        changes.push(ChangeType::Created);
    }
    if flags.intersects(
        StreamFlags::ITEM_MODIFIED
            | StreamFlags::INODE_META_MOD
            | StreamFlags::FINDER_INFO_MOD
            | StreamFlags::ITEM_CHANGE_OWNER
            | StreamFlags::ITEM_XATTR_MOD,
    ) {
        changes.push(ChangeType::Modified);
    }
    if flags.contains(StreamFlags::ITEM_REMOVED) || (renamed && !rename_target_exists) {
        changes.push(ChangeType::Removed);
    }
    if changes.is_empty() {
        changes.push(ChangeType::Unknown);
    }
    changes
}
