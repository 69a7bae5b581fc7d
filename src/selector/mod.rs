//! The selector: one poll thread multiplexing many connections.
//!
//! A [`Selector`] is a cheap cloneable handle. Behind it sits a single
//! reactor thread that owns the polling backend and the registration
//! table, plus a pool of connection workers that run listener callbacks.
//! Application threads never touch the backend directly; every operation
//! is a command on a channel, and a waker interrupts the poll call so
//! commands take effect within one tick.
//!
//! Connections are identified by their raw descriptor. A connection is
//! pinned to one worker, so its callbacks run strictly in order, while
//! different connections proceed in parallel.

mod default;
mod reactor;
pub(crate) mod registry;

pub use default::{default_selector, replace_default_selector, reset_default_selector};

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use crate::cfg::SelectorConfig;
use crate::conn::Connection;
use crate::error::{CloseReason, Error};
use crate::io::{Backend, Wake};
use crate::listener::Listener;
use crate::lock;
use crate::workers::WorkerPool;

/// Everything the poll thread can be asked to do.
pub(crate) enum Command {
    Add {
        conn: Connection,
        listener: Weak<dyn Listener>,
        reply: Sender<Result<(), Error>>,
    },
    Remove(Vec<RawFd>),
    Detach {
        fd: RawFd,
        reply: Sender<Option<Connection>>,
    },
    Write {
        fd: RawFd,
        bytes: Vec<u8>,
        reply: Sender<Result<(), Error>>,
    },
    Fail {
        fd: RawFd,
        reason: CloseReason,
        reply: Sender<bool>,
    },
    EnableRead(Vec<RawFd>),
    DisableRead(Vec<RawFd>),
    EnableWrite(Vec<RawFd>),
    DisableWrite(Vec<RawFd>),
    Stop,
}

/// The reactor's doorbell: command sender plus waker, cheap to clone.
/// Every registration holds one so readers and writers can re-arm and
/// remove without going through a [`Selector`].
#[derive(Clone)]
pub(crate) struct SelectorHandle {
    tx: Sender<Command>,
    waker: Arc<dyn Wake>,
}

impl SelectorHandle {
    pub(crate) fn new(tx: Sender<Command>, waker: Arc<dyn Wake>) -> Self {
        Self { tx, waker }
    }

    pub(crate) fn send(&self, cmd: Command) -> bool {
        if self.tx.send(cmd).is_err() {
            return false;
        }
        self.waker.wake();
        true
    }

    pub(crate) fn enable_read(&self, fd: RawFd) {
        self.send(Command::EnableRead(vec![fd]));
    }

    pub(crate) fn enable_write(&self, fd: RawFd) {
        self.send(Command::EnableWrite(vec![fd]));
    }

    pub(crate) fn remove(&self, fd: RawFd) {
        self.send(Command::Remove(vec![fd]));
    }
}

/// What `run` hands to the poll thread. Parked here between `new` and
/// `run`; consumed exactly once.
struct Seed {
    backend: Box<dyn Backend>,
    rx: Receiver<Command>,
}

struct Shared {
    tx: Sender<Command>,
    waker: Arc<dyn Wake>,
    // the poll thread gets its own clones of these two, never an
    // `Arc<Shared>`, so dropping the last Selector can trigger Stop
    running: Arc<AtomicBool>,
    conns: Arc<AtomicUsize>,
    cfg: SelectorConfig,
    backend_name: &'static str,
    seed: Mutex<Option<Seed>>,
    done: Mutex<Option<Receiver<()>>>,
}

impl Shared {
    fn send(&self, cmd: Command) -> bool {
        if self.tx.send(cmd).is_err() {
            return false;
        }
        self.waker.wake();
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // last handle gone; tell the poll thread to wind down. No wait
        // here, the thread finishes on its own.
        if self.running.load(Ordering::SeqCst) {
            let _ = self.tx.send(Command::Stop);
            self.waker.wake();
        }
    }
}

/// Handle to one reactor.
///
/// Clones share the same poll thread. The selector stops when [`stop`]
/// is called or when the last clone drops.
///
/// [`stop`]: Selector::stop
#[derive(Clone)]
pub struct Selector {
    shared: Arc<Shared>,
}

impl Selector {
    /// Builds a selector around `backend`. The poll thread does not
    /// start until [`run`](Selector::run).
    pub fn new(backend: Box<dyn Backend>, cfg: SelectorConfig) -> Self {
        let (tx, rx) = unbounded();
        let waker = backend.waker();
        let backend_name = backend.name();
        Self {
            shared: Arc::new(Shared {
                tx,
                waker,
                running: Arc::new(AtomicBool::new(false)),
                conns: Arc::new(AtomicUsize::new(0)),
                cfg,
                backend_name,
                seed: Mutex::new(Some(Seed { backend, rx })),
                done: Mutex::new(None),
            }),
        }
    }

    /// Spawns the poll thread and the connection workers. Calling it
    /// again is a no-op; a stopped selector stays stopped.
    pub fn run(&self) -> Result<(), Error> {
        let Some(seed) = lock(&self.shared.seed).take() else {
            return Ok(());
        };
        let pool = match WorkerPool::start(
            self.shared.cfg.worker_count(),
            self.shared.cfg.pin_workers,
        ) {
            Ok(pool) => pool,
            Err(err) => {
                // put the seed back so a later run can retry
                *lock(&self.shared.seed) = Some(seed);
                return Err(Error::Backend(err));
            }
        };

        let handle = SelectorHandle::new(self.shared.tx.clone(), self.shared.waker.clone());
        let mut reactor = reactor::Reactor::new(
            seed.backend,
            seed.rx,
            pool,
            handle,
            self.shared.cfg.clone(),
            self.shared.conns.clone(),
        );
        let (done_tx, done_rx) = bounded(1);
        let running = self.shared.running.clone();
        running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("muxio-reactor".to_string())
            .spawn(move || {
                reactor.run();
                running.store(false, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(_) => {
                *lock(&self.shared.done) = Some(done_rx);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(Error::Backend(err))
            }
        }
    }

    /// Signals the poll thread and waits, bounded, for it to finish the
    /// current tick, flush what it can of the already-accepted writes and
    /// shut the workers down. Idempotent; concurrent callers after the
    /// first return immediately.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.tx.send(Command::Stop);
        self.shared.waker.wake();
        if let Some(done) = lock(&self.shared.done).take() {
            // the write-drain grace phase and the worker handshake each
            // get one write wait
            let wait = self.shared.cfg.write_wait * 2 + self.shared.cfg.poll_timeout;
            if done.recv_timeout(wait).is_err() {
                tracing::warn!("poll thread did not stop within {:?}", wait);
            }
        }
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Registered connections right now.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.shared.conns.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.backend_name
    }

    /// Registers `conn` with read armed and write unarmed.
    ///
    /// Only a weak reference to `listener` is kept: keep your own `Arc`
    /// alive for as long as the connection should stay up, or the
    /// registration retires itself. A descriptor that is already
    /// registered is refused with [`Error::AlreadyRegistered`]; the
    /// existing registration and its listener stay untouched, and the
    /// refused handle is discarded without closing the descriptor it
    /// shares with them.
    pub fn add(&self, conn: Connection, listener: Arc<dyn Listener>) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        let (reply, answer) = bounded(1);
        let cmd = Command::Add {
            conn,
            listener: Arc::downgrade(&listener),
            reply,
        };
        if !self.shared.send(cmd) {
            return Err(Error::Stopped);
        }
        match answer.recv_timeout(self.shared.cfg.write_wait) {
            Ok(result) => result,
            Err(_) => Err(Error::Stopped),
        }
    }

    /// Queues `bytes` on the connection's writer and flushes as much as
    /// the socket takes right away; the rest follows on writable events.
    /// `Ok` means the payload reached the writer, not that it reached
    /// the peer. Unknown descriptors get one tick of grace (a racing
    /// `add` may still be in the queue) before
    /// [`Error::WriterUnavailable`].
    pub fn write(&self, fd: RawFd, bytes: impl Into<Vec<u8>>) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        let (reply, answer) = bounded(1);
        let cmd = Command::Write {
            fd,
            bytes: bytes.into(),
            reply,
        };
        if !self.shared.send(cmd) {
            return Err(Error::Stopped);
        }
        match answer.recv_timeout(self.shared.cfg.write_wait) {
            Ok(result) => result,
            Err(_) => Err(Error::WriterUnavailable),
        }
    }

    /// Drops a registration. Idempotent and fire-and-forget: unknown
    /// descriptors are ignored, pending reader/writer work is cancelled,
    /// and the descriptor closes once the last in-flight job lets go of
    /// it. No close notification is delivered.
    pub fn remove(&self, fd: RawFd) {
        self.remove_many(&[fd]);
    }

    /// [`remove`](Selector::remove) for a batch, one command for all.
    pub fn remove_many(&self, fds: &[RawFd]) {
        if !fds.is_empty() {
            self.shared.send(Command::Remove(fds.to_vec()));
        }
    }

    /// Arms read interest. Reads disarm themselves after every readable
    /// event, so this is only needed after an explicit
    /// [`disable_read`](Selector::disable_read).
    pub fn enable_read(&self, fd: RawFd) {
        self.enable_read_many(&[fd]);
    }

    pub fn enable_read_many(&self, fds: &[RawFd]) {
        if !fds.is_empty() {
            self.shared.send(Command::EnableRead(fds.to_vec()));
        }
    }

    /// Disarms read interest; the connection stays registered and error
    /// conditions on it are still detected.
    pub fn disable_read(&self, fd: RawFd) {
        self.disable_read_many(&[fd]);
    }

    pub fn disable_read_many(&self, fds: &[RawFd]) {
        if !fds.is_empty() {
            self.shared.send(Command::DisableRead(fds.to_vec()));
        }
    }

    /// Arms write interest by hand. Rarely needed: flushes arm it
    /// whenever a socket stops taking bytes.
    pub fn enable_write(&self, fd: RawFd) {
        self.enable_write_many(&[fd]);
    }

    pub fn enable_write_many(&self, fds: &[RawFd]) {
        if !fds.is_empty() {
            self.shared.send(Command::EnableWrite(fds.to_vec()));
        }
    }

    pub fn disable_write(&self, fd: RawFd) {
        self.disable_write_many(&[fd]);
    }

    pub fn disable_write_many(&self, fds: &[RawFd]) {
        if !fds.is_empty() {
            self.shared.send(Command::DisableWrite(fds.to_vec()));
        }
    }

    /// Pulls a live connection out without closing it, for moving it to
    /// another selector. In-flight jobs get a bounded window to finish;
    /// queued unflushed writes are dropped with the old registration.
    pub(crate) fn detach(&self, fd: RawFd) -> Option<Connection> {
        if !self.is_running() {
            return None;
        }
        let (reply, answer) = bounded(1);
        if !self.shared.send(Command::Detach { fd, reply }) {
            return None;
        }
        answer
            .recv_timeout(self.shared.cfg.write_wait * 2)
            .ok()
            .flatten()
    }

    /// Routes a deliberate close through the connection's worker so the
    /// notification serializes with its other callbacks. `false` means
    /// the descriptor is unknown here and the caller must finish the
    /// close itself.
    pub(crate) fn fail(&self, fd: RawFd, reason: CloseReason) -> bool {
        if !self.is_running() {
            return false;
        }
        let (reply, answer) = bounded(1);
        if !self.shared.send(Command::Fail { fd, reason, reply }) {
            return false;
        }
        answer
            .recv_timeout(self.shared.cfg.write_wait)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("backend", &self.shared.backend_name)
            .field("running", &self.is_running())
            .field("connections", &self.len())
            .finish()
    }
}
