//! Registration table and per-connection state.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use slab::Slab;

use crate::conn::Connection;
use crate::error::{CloseReason, Error};
use crate::io::backend::{Interest, Token};
use crate::listener::{emit_error, emit_read, emit_write, Listener};
use crate::lock;
use crate::reader::Reader;
use crate::selector::SelectorHandle;
use crate::writer::Writer;

/// Everything the workers need about one registered connection.
///
/// The descriptor lives inside and closes when the last handle drops, so
/// a job that raced with removal can never touch a recycled fd number.
/// `dead` flips once, on removal or failure, and every later job and
/// notification checks it and stays silent.
pub(crate) struct ConnState {
    fd: RawFd,
    io: Mutex<Option<Connection>>,
    dead: AtomicBool,
    jobs: AtomicUsize,
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    listener: Weak<dyn Listener>,
    handle: SelectorHandle,
}

impl ConnState {
    pub(crate) fn new(
        conn: Connection,
        listener: Weak<dyn Listener>,
        handle: SelectorHandle,
        buffer_size: usize,
    ) -> Self {
        Self {
            fd: conn.fd(),
            io: Mutex::new(Some(conn)),
            dead: AtomicBool::new(false),
            jobs: AtomicUsize::new(0),
            reader: Mutex::new(Reader::new(buffer_size)),
            writer: Mutex::new(Writer::new()),
            listener,
            handle,
        }
    }

    #[inline(always)]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Marks the registration dead without any notification.
    pub(crate) fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub(crate) fn begin_job(&self) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_job(&self) {
        self.jobs.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn jobs_in_flight(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }

    /// Hands the descriptor out, for moving a live connection to another
    /// selector. The state stays behind as a dead husk.
    pub(crate) fn take_io(&self) -> Option<Connection> {
        lock(&self.io).take()
    }

    pub(crate) fn handle(&self) -> &SelectorHandle {
        &self.handle
    }

    pub(crate) fn lock_reader(&self) -> MutexGuard<'_, Reader> {
        lock(&self.reader)
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, Writer> {
        lock(&self.writer)
    }

    pub(crate) fn notify_read(&self, bytes: &[u8]) {
        match self.listener.upgrade() {
            Some(listener) => emit_read(&*listener, self.fd, bytes),
            None => self.retire(),
        }
    }

    pub(crate) fn notify_write(&self, n: usize) {
        match self.listener.upgrade() {
            Some(listener) => emit_write(&*listener, self.fd, n),
            None => self.retire(),
        }
    }

    /// Kills the connection and notifies the listener, at most once per
    /// registration. Losers of the race and already-removed registrations
    /// stay silent.
    pub(crate) fn fail(&self, reason: CloseReason) {
        let was_dead = self.dead.swap(true, Ordering::SeqCst);
        if !was_dead {
            if let Some(listener) = self.listener.upgrade() {
                emit_error(&*listener, self.fd, Error::ConnectionClosed(reason));
            }
        }
        self.handle.remove(self.fd);
    }

    /// The listener was collected: pull the registration, silently.
    fn retire(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            tracing::debug!("listener gone for fd {}, retiring", self.fd);
            self.handle.remove(self.fd);
        }
    }
}

pub(crate) struct Registration {
    pub(crate) state: Arc<ConnState>,
    pub(crate) interest: Interest,
}

/// Token and descriptor indexes for the poll loop. Owned by the reactor
/// thread; interest bits in here are the single source of truth for what
/// is armed.
pub(crate) struct Registry {
    slots: Slab<Registration>,
    by_fd: HashMap<RawFd, Token>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Slab::new(),
            by_fd: HashMap::new(),
        }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    pub(crate) fn insert(&mut self, state: Arc<ConnState>, interest: Interest) -> Token {
        let fd = state.fd();
        let token = self.slots.insert(Registration { state, interest });
        self.by_fd.insert(fd, token);
        token
    }

    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut Registration> {
        self.slots.get_mut(token)
    }

    pub(crate) fn state(&self, token: Token) -> Option<Arc<ConnState>> {
        self.slots.get(token).map(|reg| reg.state.clone())
    }

    pub(crate) fn lookup_fd(&self, fd: RawFd) -> Option<(Token, Arc<ConnState>)> {
        let token = *self.by_fd.get(&fd)?;
        Some((token, self.slots.get(token)?.state.clone()))
    }

    pub(crate) fn remove_fd(&mut self, fd: RawFd) -> Option<(Token, Registration)> {
        let token = self.by_fd.remove(&fd)?;
        let reg = self.slots.try_remove(token)?;
        Some((token, reg))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Token, &Registration)> {
        self.slots.iter()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<(Token, Registration)> {
        self.by_fd.clear();
        let slots = std::mem::replace(&mut self.slots, Slab::new());
        slots.into_iter().collect()
    }
}
