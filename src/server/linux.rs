//! Linux watch server backed by inotify.
//!
//! The run loop blocks in `poll(2)` over two file descriptors: the inotify
//! instance and the read end of a self-pipe. Writing a byte to the pipe is
//! the wakeup primitive that makes the loop drain pending mutation commands.
//!
//! inotify watches a single directory level; events under subdirectories of
//! a watched root are not delivered. This is a platform difference, not a
//! bug.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};

use super::{validate_watch_target, ServerCommand, Termination};
use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::event::ChangeType;
use crate::sink::SinkDispatcher;
use crate::{debug_event, log_event};

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::MODIFY
        | WatchMask::ATTRIB
        | WatchMask::CLOSE_WRITE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::ONLYDIR
}

pub(crate) struct LinuxServer {
    commands: Sender<ServerCommand>,
    /// Write end of the self-pipe.
    wake_fd: OwnedFd,
    termination: Arc<Termination>,
    /// Serializes structural changes issued from caller threads.
    mutation: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LinuxServer {
    pub(crate) fn start(
        dispatcher: SinkDispatcher,
        _config: &WatcherConfig,
    ) -> Result<Self, WatchError> {
        let inotify = Inotify::init().map_err(|err| WatchError::initialization(&err))?;
        let (pipe_read, pipe_write) = self_pipe()?;
        let (command_tx, command_rx) = unbounded();
        let termination = Arc::new(Termination::new());

        let (ready_tx, ready_rx) = bounded(1);
        let loop_termination = Arc::clone(&termination);
        let handle = thread::Builder::new()
            .name("vigil-inotify".to_string())
            .spawn(move || {
                let mut run_loop = RunLoop::new(inotify, pipe_read, command_rx, dispatcher);
                let _ = ready_tx.send(());
                run_loop.run();
                loop_termination.signal();
            })
            .map_err(|err| WatchError::initialization(&err))?;
        ready_rx.recv().map_err(|_| WatchError::disconnected())?;

        Ok(Self {
            commands: command_tx,
            wake_fd: pipe_write,
            termination,
            mutation: Mutex::new(()),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn register_paths(&self, paths: &[PathBuf]) -> Result<(), WatchError> {
        let _guard = self.mutation.lock().expect("mutation lock");
        for path in paths {
            validate_watch_target(path)?;
            let (reply_tx, reply_rx) = bounded(1);
            self.commands
                .send(ServerCommand::Register {
                    path: path.clone(),
                    reply: reply_tx,
                })
                .map_err(|_| WatchError::disconnected())?;
            self.wake();
            reply_rx.recv().map_err(|_| WatchError::disconnected())??;
        }
        Ok(())
    }

    /// Idempotent per path. Returns whether all paths were previously
    /// watched.
    pub(crate) fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool, WatchError> {
        let _guard = self.mutation.lock().expect("mutation lock");
        let mut all_watched = true;
        for path in paths {
            let (reply_tx, reply_rx) = bounded(1);
            self.commands
                .send(ServerCommand::Unregister {
                    path: path.clone(),
                    reply: reply_tx,
                })
                .map_err(|_| WatchError::disconnected())?;
            self.wake();
            all_watched &= reply_rx.recv().map_err(|_| WatchError::disconnected())?;
        }
        Ok(all_watched)
    }

    /// Request loop termination and wait up to `timeout` for the drain to
    /// finish. May be called again to extend the wait.
    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        {
            let _guard = self.mutation.lock().expect("mutation lock");
            if !self.termination.is_terminated() {
                let _ = self.commands.send(ServerCommand::Shutdown);
                self.wake();
            }
        }
        let drained = self.termination.wait(timeout);
        if drained {
            if let Some(handle) = self.thread.lock().expect("thread handle").take() {
                let _ = handle.join();
            }
        }
        drained
    }

    fn wake(&self) {
        let byte = [1u8];
        // Best-effort: a full pipe already wakes the loop, and the loop may
        // already be gone.
        let _ = unsafe { libc::write(self.wake_fd.as_raw_fd(), byte.as_ptr().cast(), 1) };
    }
}

fn self_pipe() -> Result<(OwnedFd, OwnedFd), WatchError> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if rc != 0 {
        return Err(WatchError::initialization(&io::Error::last_os_error()));
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// One raw inotify record, detached from the read buffer.
struct RawEvent {
    wd: WatchDescriptor,
    mask: EventMask,
    name: Option<PathBuf>,
}

struct RunLoop {
    inotify: Inotify,
    /// Read end of the self-pipe.
    wake: OwnedFd,
    commands: Receiver<ServerCommand>,
    dispatcher: SinkDispatcher,
    roots: HashMap<PathBuf, WatchDescriptor>,
    descriptors: HashMap<WatchDescriptor, PathBuf>,
    buffer: [u8; 4096],
    shutting_down: bool,
}

impl RunLoop {
    fn new(
        inotify: Inotify,
        wake: OwnedFd,
        commands: Receiver<ServerCommand>,
        dispatcher: SinkDispatcher,
    ) -> Self {
        Self {
            inotify,
            wake,
            commands,
            dispatcher,
            roots: HashMap::new(),
            descriptors: HashMap::new(),
            buffer: [0u8; 4096],
            shutting_down: false,
        }
    }

    fn run(&mut self) {
        debug_event!("linux", "run loop started");

        while !self.shutting_down {
            let (events_ready, wake_ready) = match self.poll() {
                Ok(ready) => ready,
                Err(err) => {
                    self.dispatcher
                        .report(&WatchError::internal("poll", &err));
                    break;
                }
            };
            if events_ready {
                self.drain_events();
            }
            if wake_ready {
                self.drain_wake_pipe();
                self.process_commands();
            }
        }

        // Deliver whatever the kernel queued before the shutdown request,
        // then release the watches.
        self.drain_events();
        for (_, wd) in self.roots.drain() {
            let mut watches = self.inotify.watches();
            let _ = watches.remove(wd);
        }
        self.descriptors.clear();

        debug_event!("linux", "run loop finished");
    }

    fn poll(&mut self) -> io::Result<(bool, bool)> {
        let mut fds = [
            libc::pollfd {
                fd: self.inotify.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let ready = |revents: libc::c_short| {
                revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
            };
            return Ok((ready(fds[0].revents), ready(fds[1].revents)));
        }
    }

    fn drain_wake_pipe(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake.as_raw_fd(),
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                )
            };
            if n < scratch.len() as isize {
                break;
            }
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ServerCommand::Register { path, reply } => {
                    let _ = reply.send(self.register(path));
                }
                ServerCommand::Unregister { path, reply } => {
                    let _ = reply.send(self.unregister(&path));
                }
                ServerCommand::Shutdown => {
                    self.shutting_down = true;
                }
            }
        }
    }

    fn register(&mut self, path: PathBuf) -> Result<(), WatchError> {
        if self.roots.contains_key(&path) {
            return Err(WatchError::AlreadyWatching { path });
        }
        let mut watches = self.inotify.watches();
        match watches.add(&path, watch_mask()) {
            Ok(wd) => {
                debug_event!("linux", "watching", "{}", path.display());
                self.descriptors.insert(wd.clone(), path.clone());
                self.roots.insert(path, wd);
                Ok(())
            }
            Err(err) => Err(WatchError::watch_failed(path, &err)),
        }
    }

    fn unregister(&mut self, path: &Path) -> bool {
        match self.roots.remove(path) {
            Some(wd) => {
                debug_event!("linux", "unwatching", "{}", path.display());
                self.descriptors.remove(&wd);
                let mut watches = self.inotify.watches();
                let _ = watches.remove(wd);
                true
            }
            None => false,
        }
    }

    fn drain_events(&mut self) {
        loop {
            let batch: Vec<RawEvent> = match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => events
                    .map(|event| RawEvent {
                        wd: event.wd,
                        mask: event.mask,
                        name: event.name.map(PathBuf::from),
                    })
                    .collect(),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.dispatcher
                        .report(&WatchError::internal("inotify read", &err));
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            self.deliver_batch(batch);
        }
    }

    fn deliver_batch(&mut self, batch: Vec<RawEvent>) {
        // Descriptors that already produced a MODIFY within this read; a
        // following CLOSE_WRITE for the same descriptor is collapsed.
        let mut modified: HashSet<WatchDescriptor> = HashSet::new();
        for event in batch {
            self.deliver(event, &mut modified);
        }
    }

    fn deliver(&mut self, event: RawEvent, modified: &mut HashSet<WatchDescriptor>) {
        let RawEvent { wd, mask, name } = event;

        if mask.contains(EventMask::Q_OVERFLOW) {
            log_event!("linux", "event queue overflow");
            for root in self.roots.keys() {
                self.dispatcher.dispatch(ChangeType::Overflow, root);
            }
            return;
        }

        let Some(root) = self.descriptors.get(&wd).cloned() else {
            // Stale descriptor: unregistered, or already reaped after a
            // *_SELF event.
            return;
        };

        if mask.contains(EventMask::IGNORED) {
            self.descriptors.remove(&wd);
            self.roots.remove(&root);
            return;
        }

        if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
            // The root itself is gone; emit on the root and reap the watch.
            self.dispatcher.dispatch(ChangeType::Removed, &root);
            self.descriptors.remove(&wd);
            self.roots.remove(&root);
            let mut watches = self.inotify.watches();
            let _ = watches.remove(wd);
            return;
        }

        let path = match name {
            Some(name) => root.join(name),
            None => root.clone(),
        };

        let suppress_close_write = modified.contains(&wd);
        if mask.contains(EventMask::MODIFY) {
            modified.insert(wd);
        }
        if let Some(change) = classify(mask, suppress_close_write) {
            self.dispatcher.dispatch(change, &path);
        }
    }
}

/// Map an inotify event mask onto the shared vocabulary.
///
/// Returns `None` only for a CLOSE_WRITE collapsed into an earlier MODIFY.
fn classify(mask: EventMask, suppress_close_write: bool) -> Option<ChangeType> {
    if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        Some(ChangeType::Created)
    } else if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
        Some(ChangeType::Removed)
    } else if mask.contains(EventMask::MODIFY) {
        Some(ChangeType::Modified)
    } else if mask.contains(EventMask::CLOSE_WRITE) {
        if suppress_close_write {
            None
        } else {
            Some(ChangeType::Modified)
        }
    } else if mask.contains(EventMask::ATTRIB) {
        Some(ChangeType::Modified)
    } else {
        Some(ChangeType::Unknown)
    }
}
