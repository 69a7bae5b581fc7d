//! Fixtures shared by the unit tests.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};

use crate::conn::Connection;
use crate::error::Error;
use crate::io::Wake;
use crate::listener::Listener;
use crate::lock;
use crate::selector::registry::ConnState;
use crate::selector::{Command, SelectorHandle};

/// Listener that records everything it is told.
pub(crate) struct Recording {
    bytes: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    written: AtomicUsize,
    errors: Mutex<Vec<Error>>,
}

impl Recording {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
        })
    }

    /// Everything received so far, in arrival order.
    pub(crate) fn read_bytes(&self) -> Vec<u8> {
        lock(&self.bytes).clone()
    }

    pub(crate) fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Total bytes reported through `on_write`.
    pub(crate) fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    pub(crate) fn error_count(&self) -> usize {
        lock(&self.errors).len()
    }

    pub(crate) fn errors(&self) -> MutexGuard<'_, Vec<Error>> {
        lock(&self.errors)
    }
}

impl Listener for Recording {
    fn on_read(&self, _fd: RawFd, bytes: &[u8]) {
        lock(&self.bytes).extend_from_slice(bytes);
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn on_write(&self, _fd: RawFd, n: usize) {
        self.written.fetch_add(n, Ordering::SeqCst);
    }

    fn on_error(&self, _fd: RawFd, err: Error) {
        lock(&self.errors).push(err);
    }
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(&self) {}
}

/// A handle whose commands land in the returned receiver instead of a
/// poll loop, so tests can assert on re-arms and removals directly.
pub(crate) fn handle_pair() -> (SelectorHandle, Receiver<Command>) {
    let (tx, rx) = unbounded();
    (SelectorHandle::new(tx, Arc::new(NoopWake)), rx)
}

/// Connection state with no listener behind it.
pub(crate) fn conn_state(conn: Connection) -> (Arc<ConnState>, Receiver<Command>) {
    let (handle, rx) = handle_pair();
    let listener: Weak<dyn Listener> = Weak::<Recording>::new();
    let state = Arc::new(ConnState::new(conn, listener, handle, 4096));
    (state, rx)
}

pub(crate) fn conn_state_with_listener(
    conn: Connection,
    listener: &Arc<Recording>,
) -> (Arc<ConnState>, Receiver<Command>) {
    let (handle, rx) = handle_pair();
    let strong: Arc<dyn Listener> = listener.clone();
    let state = Arc::new(ConnState::new(conn, Arc::downgrade(&strong), handle, 4096));
    (state, rx)
}

/// Descriptors from every `EnableRead` queued so far. Other commands
/// are discarded.
pub(crate) fn drain_read_arms(rx: &Receiver<Command>) -> Vec<RawFd> {
    let mut fds = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        if let Command::EnableRead(batch) = cmd {
            fds.extend(batch);
        }
    }
    fds
}

/// Descriptors from every `EnableWrite` queued so far.
pub(crate) fn drain_write_arms(rx: &Receiver<Command>) -> Vec<RawFd> {
    let mut fds = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        if let Command::EnableWrite(batch) = cmd {
            fds.extend(batch);
        }
    }
    fds
}

/// Batches from every `Remove` queued so far.
pub(crate) fn drain_removals(rx: &Receiver<Command>) -> Vec<Vec<RawFd>> {
    let mut batches = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        if let Command::Remove(batch) = cmd {
            batches.push(batch);
        }
    }
    batches
}

/// Polls `pred` until it holds or `timeout` runs out.
pub(crate) fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pred()
}

/// Subscriber for `--nocapture` runs; repeated calls are fine.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
