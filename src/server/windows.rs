//! Windows watch server backed by overlapped `ReadDirectoryChangesW`.
//!
//! The run loop is an alertable `SleepEx` wait; queued user APCs are the
//! wakeup primitive. Each watch point keeps exactly one asynchronous
//! directory read armed; its completion routine runs on the loop thread in
//! alertable state, parses the notification buffer, and re-arms the read.
//!
//! Termination is two-phase: a terminate APC sets the flag and cancels the
//! I/O of every watch point, then the loop keeps sleeping until the
//! `ERROR_OPERATION_ABORTED` completions have drained the registry.

use std::collections::HashMap;
use std::ffi::OsString;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, GetLastError, DUPLICATE_SAME_ACCESS, ERROR_OPERATION_ABORTED,
    HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, QueueUserAPC, SetThreadPriority, SleepEx, INFINITE,
    THREAD_PRIORITY_ABOVE_NORMAL,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

use super::{validate_watch_target, Termination};
use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::event::ChangeType;
use crate::sink::SinkDispatcher;
use crate::{debug_event, log_event};

const EVENT_BUFFER_SIZE: usize = 16 * 1024;

const CREATE_SHARE: u32 = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;
const CREATE_FLAGS: u32 = FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED;
const EVENT_MASK: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE;

/// Paths at or beyond this length need the extended-length prefix.
const MAX_PATH_LEN: usize = 260;

struct SendHandle(HANDLE);
unsafe impl Send for SendHandle {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchStatus {
    Uninitialized,
    Listening,
    FailedToListen(i32),
    NotListening,
    Finished,
}

enum ListenOutcome {
    Listening,
    AlreadyWatching,
    Failed(i32),
}

/// Handshake for `register_paths`: the caller blocks here until the listen
/// APC has published the watch point's status.
struct ListenGate {
    outcome: Mutex<Option<ListenOutcome>>,
    cond: Condvar,
}

impl ListenGate {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn publish(&self, outcome: ListenOutcome) {
        let mut slot = self.outcome.lock().expect("listen gate");
        *slot = Some(outcome);
        self.cond.notify_all();
    }

    fn wait(&self) -> ListenOutcome {
        let slot = self.outcome.lock().expect("listen gate");
        let mut slot = self
            .cond
            .wait_while(slot, |outcome| outcome.is_none())
            .expect("listen gate");
        slot.take().expect("published outcome")
    }
}

/// State owned by the run-loop thread. APC routines and completion
/// routines all execute on that thread, so no locking is needed here.
struct LoopState {
    terminated: bool,
    watch_points: HashMap<PathBuf, Box<WatchPoint>>,
    dispatcher: SinkDispatcher,
}

struct WatchPoint {
    server: *mut LoopState,
    path: PathBuf,
    handle: HANDLE,
    overlapped: OVERLAPPED,
    buffer: Vec<u8>,
    status: WatchStatus,
    closed: bool,
}

impl WatchPoint {
    fn new(server: *mut LoopState, path: PathBuf, handle: HANDLE) -> Self {
        Self {
            server,
            path,
            handle,
            overlapped: unsafe { mem::zeroed() },
            buffer: vec![0u8; EVENT_BUFFER_SIZE],
            status: WatchStatus::Uninitialized,
            closed: false,
        }
    }

    /// Arm the single outstanding asynchronous read for this directory.
    fn listen(&mut self) {
        self.overlapped = unsafe { mem::zeroed() };
        self.overlapped.hEvent = self as *mut WatchPoint as HANDLE;
        let ok = unsafe {
            ReadDirectoryChangesW(
                self.handle,
                self.buffer.as_mut_ptr().cast(),
                EVENT_BUFFER_SIZE as u32,
                1,
                EVENT_MASK,
                ptr::null_mut(),
                &mut self.overlapped,
                Some(handle_event_callback),
            )
        };
        self.status = if ok != 0 {
            WatchStatus::Listening
        } else {
            WatchStatus::FailedToListen(unsafe { GetLastError() } as i32)
        };
    }

    /// Cancel the outstanding read and release the directory handle. The
    /// aborted completion still arrives and reaps the watch point.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        unsafe {
            if CancelIo(self.handle) == 0 {
                tracing::warn!(
                    "[windows] CancelIo failed for {}: {}",
                    self.path.display(),
                    GetLastError()
                );
            }
            if CloseHandle(self.handle) == 0 {
                tracing::warn!(
                    "[windows] CloseHandle failed for {}: {}",
                    self.path.display(),
                    GetLastError()
                );
            }
        }
    }

    /// Process one completed read. Returns whether this watch point is
    /// finished and must be removed from the registry.
    fn handle_event(&mut self, error_code: u32, bytes_transferred: u32) -> bool {
        self.status = WatchStatus::NotListening;

        if error_code == ERROR_OPERATION_ABORTED {
            debug_event!("windows", "finished watching", "{}", self.path.display());
            self.status = WatchStatus::Finished;
            return true;
        }

        let dispatcher = unsafe { &(*self.server).dispatcher };
        if bytes_transferred == 0 {
            // The notification buffer overflowed and the changes are lost;
            // the root must be re-scanned.
            dispatcher.dispatch(ChangeType::Invalidated, &self.path);
        } else {
            self.walk_records(bytes_transferred as usize);
        }

        self.listen();
        if let WatchStatus::FailedToListen(code) = self.status {
            dispatcher.report(&WatchError::WatchFailed {
                path: self.path.clone(),
                code,
            });
            self.status = WatchStatus::Finished;
            return true;
        }
        false
    }

    fn walk_records(&mut self, len: usize) {
        let dispatcher = unsafe { &(*self.server).dispatcher };
        let mut offset = 0usize;
        loop {
            if len - offset < mem::size_of::<FILE_NOTIFY_INFORMATION>() {
                break;
            }
            let record =
                unsafe { &*(self.buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION) };
            let name_len = (record.FileNameLength / 2) as usize;
            let name = unsafe { slice::from_raw_parts(record.FileName.as_ptr(), name_len) };
            let changed = self.path.join(OsString::from_wide(name));

            tracing::trace!(
                "[windows] raw action {:#x} {}",
                record.Action,
                changed.display()
            );
            dispatcher.dispatch(map_action(record.Action), &changed);

            if record.NextEntryOffset == 0 {
                break;
            }
            offset += record.NextEntryOffset as usize;
        }
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            unsafe { CloseHandle(self.handle) };
        }
    }
}

fn map_action(action: u32) -> ChangeType {
    match action {
        FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => ChangeType::Created,
        FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => ChangeType::Removed,
        FILE_ACTION_MODIFIED => ChangeType::Modified,
        _ => ChangeType::Unknown,
    }
}

/// Widen a path for `CreateFileW`, inserting the extended-length prefix
/// when the path would otherwise exceed `MAX_PATH`.
fn to_extended_wide(path: &Path) -> Vec<u16> {
    let display = path.to_string_lossy();
    let needs_prefix = display.len() >= MAX_PATH_LEN && !display.starts_with(r"\\?\");
    let widened: PathBuf = if needs_prefix {
        if let Some(unc) = display.strip_prefix(r"\\") {
            PathBuf::from(format!(r"\\?\UNC\{unc}"))
        } else {
            PathBuf::from(format!(r"\\?\{display}"))
        }
    } else {
        path.to_path_buf()
    };
    widened
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

// APC payloads. Each is boxed by the caller thread and reclaimed by its
// routine on the loop thread.

struct RegisterRequest {
    state: *mut LoopState,
    path: PathBuf,
    handle: HANDLE,
    gate: Arc<ListenGate>,
}

struct UnregisterRequest {
    state: *mut LoopState,
    path: PathBuf,
    reply: Sender<bool>,
}

struct TerminateRequest {
    state: *mut LoopState,
}

unsafe extern "system" fn register_apc(arg: usize) {
    let request = unsafe { Box::from_raw(arg as *mut RegisterRequest) };
    let state = unsafe { &mut *request.state };

    if state.terminated {
        unsafe { CloseHandle(request.handle) };
        request
            .gate
            .publish(ListenOutcome::Failed(ERROR_OPERATION_ABORTED as i32));
        return;
    }
    if state.watch_points.contains_key(&request.path) {
        unsafe { CloseHandle(request.handle) };
        request.gate.publish(ListenOutcome::AlreadyWatching);
        return;
    }

    let mut watch_point = Box::new(WatchPoint::new(
        request.state,
        request.path.clone(),
        request.handle,
    ));
    watch_point.listen();
    match watch_point.status {
        WatchStatus::Listening => {
            debug_event!("windows", "watching", "{}", request.path.display());
            state.watch_points.insert(request.path, watch_point);
            request.gate.publish(ListenOutcome::Listening);
        }
        WatchStatus::FailedToListen(code) => {
            request.gate.publish(ListenOutcome::Failed(code));
        }
        _ => unreachable!("listen publishes Listening or FailedToListen"),
    }
}

unsafe extern "system" fn unregister_apc(arg: usize) {
    let request = unsafe { Box::from_raw(arg as *mut UnregisterRequest) };
    let state = unsafe { &mut *request.state };

    let was_watched = match state.watch_points.get_mut(&request.path) {
        Some(watch_point) => {
            watch_point.close();
            true
        }
        None => false,
    };
    let _ = request.reply.send(was_watched);
}

unsafe extern "system" fn terminate_apc(arg: usize) {
    let request = unsafe { Box::from_raw(arg as *mut TerminateRequest) };
    let state = unsafe { &mut *request.state };

    state.terminated = true;
    for watch_point in state.watch_points.values_mut() {
        watch_point.close();
    }
}

unsafe extern "system" fn handle_event_callback(
    error_code: u32,
    bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    let watch_point = unsafe { (*overlapped).hEvent as *mut WatchPoint };
    let state = unsafe { (*watch_point).server };
    let finished = unsafe { (*watch_point).handle_event(error_code, bytes_transferred) };
    if finished {
        let path = unsafe { (*watch_point).path.clone() };
        unsafe { (*state).watch_points.remove(&path) };
    }
}

pub(crate) struct WindowsServer {
    /// Duplicated real handle of the run-loop thread, target of APCs.
    thread_handle: SendHandle,
    /// Loop-owned state; only dereferenced inside APC routines, which run
    /// on the loop thread.
    state: *mut LoopState,
    termination: Arc<Termination>,
    mutation: Mutex<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

unsafe impl Send for WindowsServer {}
unsafe impl Sync for WindowsServer {}

impl WindowsServer {
    pub(crate) fn start(
        dispatcher: SinkDispatcher,
        _config: &WatcherConfig,
    ) -> Result<Self, WatchError> {
        let (ready_tx, ready_rx) = bounded(1);
        let termination = Arc::new(Termination::new());
        let loop_termination = Arc::clone(&termination);

        let handle = thread::Builder::new()
            .name("vigil-rdcw".to_string())
            .spawn(move || {
                let mut thread_handle: HANDLE = ptr::null_mut();
                let duplicated = unsafe {
                    DuplicateHandle(
                        GetCurrentProcess(),
                        GetCurrentThread(),
                        GetCurrentProcess(),
                        &mut thread_handle,
                        0,
                        0,
                        DUPLICATE_SAME_ACCESS,
                    )
                };
                if duplicated == 0 {
                    let _ = ready_tx.send(Err(WatchError::Internal {
                        code: unsafe { GetLastError() } as i32,
                        context: "duplicate run loop thread handle".to_string(),
                    }));
                    return;
                }
                unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL) };

                let mut state = Box::new(LoopState {
                    terminated: false,
                    watch_points: HashMap::new(),
                    dispatcher,
                });
                let state_ptr: *mut LoopState = &mut *state;
                let _ = ready_tx.send(Ok((SendHandle(thread_handle), state_ptr as usize)));

                debug_event!("windows", "run loop started");
                while !(state.terminated && state.watch_points.is_empty()) {
                    unsafe { SleepEx(INFINITE, 1) };
                }
                debug_event!("windows", "run loop finished");

                drop(state);
                loop_termination.signal();
            })
            .map_err(|err| WatchError::initialization(&err))?;

        let (thread_handle, state_addr) = ready_rx
            .recv()
            .map_err(|_| WatchError::disconnected())?
            .map_err(|err| {
                let _ = handle.join();
                err
            })?;

        Ok(Self {
            thread_handle,
            state: state_addr as *mut LoopState,
            termination,
            mutation: Mutex::new(()),
            join: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn register_paths(&self, paths: &[PathBuf]) -> Result<(), WatchError> {
        let _guard = self.mutation.lock().expect("mutation lock");
        for path in paths {
            validate_watch_target(path)?;
            if self.termination.is_terminated() {
                return Err(WatchError::disconnected());
            }

            let wide = to_extended_wide(path);
            let handle = unsafe {
                CreateFileW(
                    wide.as_ptr(),
                    FILE_LIST_DIRECTORY,
                    CREATE_SHARE,
                    ptr::null(),
                    OPEN_EXISTING,
                    CREATE_FLAGS,
                    ptr::null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(WatchError::WatchFailed {
                    path: path.clone(),
                    code: unsafe { GetLastError() } as i32,
                });
            }

            let gate = Arc::new(ListenGate::new());
            let request = Box::into_raw(Box::new(RegisterRequest {
                state: self.state,
                path: path.clone(),
                handle,
                gate: Arc::clone(&gate),
            }));
            let queued =
                unsafe { QueueUserAPC(Some(register_apc), self.thread_handle.0, request as usize) };
            if queued == 0 {
                unsafe {
                    drop(Box::from_raw(request));
                    CloseHandle(handle);
                }
                return Err(WatchError::Internal {
                    code: unsafe { GetLastError() } as i32,
                    context: "queue register request".to_string(),
                });
            }

            match gate.wait() {
                ListenOutcome::Listening => {
                    log_event!("windows", "watching", "{}", path.display());
                }
                ListenOutcome::AlreadyWatching => {
                    return Err(WatchError::AlreadyWatching { path: path.clone() });
                }
                ListenOutcome::Failed(code) => {
                    return Err(WatchError::WatchFailed {
                        path: path.clone(),
                        code,
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool, WatchError> {
        let _guard = self.mutation.lock().expect("mutation lock");
        let mut all_watched = true;
        for path in paths {
            if self.termination.is_terminated() {
                return Ok(all_watched);
            }
            let (reply_tx, reply_rx) = bounded(1);
            let request = Box::into_raw(Box::new(UnregisterRequest {
                state: self.state,
                path: path.clone(),
                reply: reply_tx,
            }));
            let queued = unsafe {
                QueueUserAPC(Some(unregister_apc), self.thread_handle.0, request as usize)
            };
            if queued == 0 {
                unsafe { drop(Box::from_raw(request)) };
                return Err(WatchError::Internal {
                    code: unsafe { GetLastError() } as i32,
                    context: "queue unregister request".to_string(),
                });
            }
            all_watched &= reply_rx.recv().map_err(|_| WatchError::disconnected())?;
        }
        Ok(all_watched)
    }

    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        {
            let _guard = self.mutation.lock().expect("mutation lock");
            if !self.termination.is_terminated() {
                let request = Box::into_raw(Box::new(TerminateRequest { state: self.state }));
                let queued = unsafe {
                    QueueUserAPC(Some(terminate_apc), self.thread_handle.0, request as usize)
                };
                if queued == 0 {
                    unsafe { drop(Box::from_raw(request)) };
                    tracing::warn!("[windows] failed to queue termination request");
                }
            }
        }
        let drained = self.termination.wait(timeout);
        if drained {
            if let Some(handle) = self.join.lock().expect("thread handle").take() {
                let _ = handle.join();
            }
        }
        drained
    }
}

impl Drop for WindowsServer {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.thread_handle.0) };
    }
}
