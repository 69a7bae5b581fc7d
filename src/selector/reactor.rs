//! The poll loop.
//!
//! One tick: retire writes parked last tick, drain the command channel,
//! retry the parked writes, then poll the backend and dispatch. Events
//! are dispatched before the next command drain, so a token seen in an
//! event always still means the registration it was reported for.
//!
//! The loop never runs listener callbacks itself. Everything user-facing
//! goes through the worker pool, pinned by token, so one slow callback
//! cannot stall polling and a connection's callbacks never overlap.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender};
use crossbeam_utils::Backoff;

use crate::cfg::SelectorConfig;
use crate::conn::Connection;
use crate::error::{CloseReason, Error};
use crate::io::backend::{Backend, Event, Interest, Token};
use crate::io::sys::{fd_is_closed, MAX_EVENTS_RETURNED};
use crate::listener::Listener;
use crate::selector::registry::{ConnState, Registry};
use crate::selector::{Command, SelectorHandle};
use crate::workers::{Job, WorkerPool};

/// A write that raced ahead of its `add`. Kept for exactly one tick.
struct ParkedWrite {
    fd: RawFd,
    bytes: Vec<u8>,
    reply: Sender<Result<(), Error>>,
}

pub(crate) struct Reactor {
    backend: Box<dyn Backend>,
    rx: Receiver<Command>,
    pool: WorkerPool,
    registry: Registry,
    handle: SelectorHandle,
    cfg: SelectorConfig,
    conns: Arc<AtomicUsize>,
    events: Vec<Event>,
    parked: Vec<ParkedWrite>,
    stop: bool,
}

impl Reactor {
    pub(crate) fn new(
        backend: Box<dyn Backend>,
        rx: Receiver<Command>,
        pool: WorkerPool,
        handle: SelectorHandle,
        cfg: SelectorConfig,
        conns: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            backend,
            rx,
            pool,
            registry: Registry::new(),
            handle,
            cfg,
            conns,
            events: Vec::with_capacity(MAX_EVENTS_RETURNED),
            parked: Vec::new(),
            stop: false,
        }
    }

    pub(crate) fn run(&mut self) {
        tracing::debug!("poll loop up on {}", self.backend.name());
        while !self.stop {
            self.tick();
        }
        self.shutdown();
        tracing::debug!("poll loop down");
    }

    fn tick(&mut self) {
        // writes parked last tick come due now; the drain runs first so
        // the add they raced against is already applied when they retry
        let due = std::mem::take(&mut self.parked);
        self.drain_commands();
        for parked in due {
            self.submit_write(parked.fd, parked.bytes, parked.reply, true);
        }
        if self.stop {
            return;
        }
        self.poll_once();
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.handle_command(cmd);
            if self.stop {
                return;
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add {
                conn,
                listener,
                reply,
            } => {
                let _ = reply.send(self.register_conn(conn, listener));
            }
            Command::Remove(fds) => {
                for fd in fds {
                    self.remove_conn(fd);
                }
            }
            Command::Detach { fd, reply } => {
                let _ = reply.send(self.detach(fd));
            }
            Command::Write { fd, bytes, reply } => self.submit_write(fd, bytes, reply, false),
            Command::Fail { fd, reason, reply } => {
                let _ = reply.send(self.fail_fd(fd, reason));
            }
            Command::EnableRead(fds) => self.set_interest(&fds, Some(true), None),
            Command::DisableRead(fds) => self.set_interest(&fds, Some(false), None),
            Command::EnableWrite(fds) => self.set_interest(&fds, None, Some(true)),
            Command::DisableWrite(fds) => self.set_interest(&fds, None, Some(false)),
            Command::Stop => self.stop = true,
        }
    }

    fn register_conn(
        &mut self,
        conn: Connection,
        listener: Weak<dyn Listener>,
    ) -> Result<(), Error> {
        let fd = conn.fd();
        if self.registry.contains(fd) {
            tracing::debug!("fd {} is already registered", fd);
            // a second handle for a registered descriptor can only be an
            // alias of it; discard the handle without closing the
            // descriptor out from under the existing registration
            std::mem::forget(conn);
            return Err(Error::AlreadyRegistered);
        }
        let state = Arc::new(ConnState::new(
            conn,
            listener,
            self.handle.clone(),
            self.cfg.buffer_size,
        ));
        let interest = Interest::readable();
        let token = self.registry.insert(state, interest);
        if let Err(err) = self.backend.register(token, fd, interest) {
            self.registry.remove_fd(fd);
            return Err(Error::Backend(err));
        }
        self.conns.store(self.registry.len(), Ordering::SeqCst);
        tracing::debug!("registered fd {} as token {}", fd, token);
        Ok(())
    }

    fn remove_conn(&mut self, fd: RawFd) {
        let Some((token, reg)) = self.registry.remove_fd(fd) else {
            return;
        };
        reg.state.kill();
        let unsent = reg.state.lock_writer().clear();
        if unsent > 0 {
            tracing::debug!("fd {} dropped {} unsent bytes", fd, unsent);
        }
        if let Err(err) = self.backend.deregister(token, fd) {
            tracing::trace!("deregister fd {}: {}", fd, err);
        }
        self.conns.store(self.registry.len(), Ordering::SeqCst);
        tracing::debug!("removed fd {}", fd);
    }

    /// Non-closing removal. Waits, bounded, for in-flight jobs so no
    /// callback can land after the descriptor changes hands.
    fn detach(&mut self, fd: RawFd) -> Option<Connection> {
        let (token, reg) = self.registry.remove_fd(fd)?;
        reg.state.kill();
        if let Err(err) = self.backend.deregister(token, fd) {
            tracing::trace!("deregister fd {}: {}", fd, err);
        }
        self.conns.store(self.registry.len(), Ordering::SeqCst);

        let deadline = Instant::now() + self.cfg.write_wait;
        let backoff = Backoff::new();
        while reg.state.jobs_in_flight() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!("detach fd {}: jobs still in flight, detaching anyway", fd);
                break;
            }
            backoff.snooze();
        }
        reg.state.take_io()
    }

    fn submit_write(
        &mut self,
        fd: RawFd,
        bytes: Vec<u8>,
        reply: Sender<Result<(), Error>>,
        last_chance: bool,
    ) {
        match self.registry.lookup_fd(fd) {
            Some((token, state)) => {
                state.begin_job();
                self.pool.dispatch(token, Job::Append(state, bytes));
                let _ = reply.send(Ok(()));
            }
            None if !last_chance => {
                tracing::trace!("write to unknown fd {}, parking for one tick", fd);
                self.parked.push(ParkedWrite { fd, bytes, reply });
            }
            None => {
                let _ = reply.send(Err(Error::WriterUnavailable));
            }
        }
    }

    fn fail_fd(&mut self, fd: RawFd, reason: CloseReason) -> bool {
        let Some((token, state)) = self.registry.lookup_fd(fd) else {
            return false;
        };
        state.begin_job();
        self.pool.dispatch(token, Job::Fail(state, reason));
        true
    }

    fn fail_token(&mut self, token: Token, reason: CloseReason) {
        let Some(state) = self.registry.state(token) else {
            return;
        };
        state.begin_job();
        self.pool.dispatch(token, Job::Fail(state, reason));
    }

    fn set_interest(&mut self, fds: &[RawFd], read: Option<bool>, write: Option<bool>) {
        for &fd in fds {
            let Some((token, _)) = self.registry.lookup_fd(fd) else {
                continue;
            };
            let Some(reg) = self.registry.get_mut(token) else {
                continue;
            };
            if reg.state.is_dead() {
                continue;
            }
            let mut interest = reg.interest;
            if let Some(on) = read {
                interest.read = on;
            }
            if let Some(on) = write {
                interest.write = on;
            }
            if interest == reg.interest {
                continue;
            }
            reg.interest = interest;
            if let Err(err) = self.backend.update(token, fd, interest) {
                tracing::warn!("interest update for fd {} failed: {}", fd, err);
                if fd_is_closed(fd) {
                    self.fail_token(token, CloseReason::BadDescriptor);
                }
            }
        }
    }

    fn poll_once(&mut self) {
        self.events.clear();
        if let Err(err) = self.backend.poll(&mut self.events, self.cfg.poll_timeout) {
            tracing::warn!("backend poll failed: {}", err);
            self.sweep_closed();
            return;
        }
        for i in 0..self.events.len() {
            let ev = self.events[i];
            self.dispatch_event(ev);
        }
    }

    fn dispatch_event(&mut self, ev: Event) {
        let Some(reg) = self.registry.get_mut(ev.token) else {
            tracing::trace!("event for stale token {}", ev.token);
            return;
        };
        let state = reg.state.clone();
        if state.is_dead() {
            return;
        }

        // only armed directions count; stale readiness for a direction
        // disarmed since the poll started is dropped here
        let did_read = ev.readable && reg.interest.read;
        let did_write = ev.writable && reg.interest.write;

        if did_read || did_write {
            // disarm what fired before any job runs; the job re-arms
            // explicitly when it wants more
            let mut interest = reg.interest;
            if did_read {
                interest.read = false;
            }
            if did_write {
                interest.write = false;
            }
            reg.interest = interest;
            let fd = state.fd();
            if let Err(err) = self.backend.update(ev.token, fd, interest) {
                tracing::warn!("disarm for fd {} failed: {}", fd, err);
            }
            if did_read {
                state.begin_job();
                self.pool.dispatch(ev.token, Job::Read(state.clone()));
            }
            if did_write {
                state.begin_job();
                self.pool.dispatch(ev.token, Job::Flush(state));
            }
            return;
        }

        // nothing armed fired; a bare error or hangup is a dead peer
        if ev.error || ev.hangup {
            let reason = if ev.error {
                CloseReason::Reset
            } else {
                CloseReason::Eof
            };
            state.begin_job();
            self.pool.dispatch(ev.token, Job::Fail(state, reason));
        }
    }

    /// The backend refused to poll. Check every registration for a
    /// descriptor closed behind our back and fail those; if none is
    /// found, rest one tick so a persistent failure cannot spin.
    fn sweep_closed(&mut self) {
        let mut bad = Vec::new();
        for (token, reg) in self.registry.iter() {
            if !reg.state.is_dead() && fd_is_closed(reg.state.fd()) {
                bad.push(token);
            }
        }
        if bad.is_empty() {
            thread::sleep(self.cfg.poll_timeout);
            return;
        }
        for token in bad {
            tracing::warn!("token {} holds a closed descriptor, failing it", token);
            self.fail_token(token, CloseReason::BadDescriptor);
        }
    }

    fn shutdown(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.late_command(cmd);
        }
        for parked in std::mem::take(&mut self.parked) {
            let _ = parked.reply.send(Err(Error::Stopped));
        }
        self.drain_writes();

        // workers finish their inboxes, then every registration is
        // dropped without notifications
        self.pool.stop(self.cfg.write_wait);
        let mut unsent = 0usize;
        for (token, reg) in self.registry.drain_all() {
            reg.state.kill();
            unsent += reg.state.lock_writer().clear();
            let _ = self.backend.deregister(token, reg.state.fd());
        }
        if unsent > 0 {
            tracing::debug!("stop dropped {} unsent bytes", unsent);
        }
        self.conns.store(0, Ordering::SeqCst);
    }

    /// A command that arrived after stop. Removals, failures and re-arms
    /// still apply so draining connections can finish; anything that
    /// would create new work is refused.
    fn late_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add { reply, .. } => {
                let _ = reply.send(Err(Error::Stopped));
            }
            Command::Write { reply, .. } => {
                let _ = reply.send(Err(Error::Stopped));
            }
            Command::Detach { reply, .. } => {
                let _ = reply.send(None);
            }
            Command::Fail { fd, reason, reply } => {
                let _ = reply.send(self.fail_fd(fd, reason));
            }
            Command::Remove(fds) => {
                for fd in fds {
                    self.remove_conn(fd);
                }
            }
            Command::EnableRead(fds) => self.set_interest(&fds, Some(true), None),
            Command::DisableRead(fds) => self.set_interest(&fds, Some(false), None),
            Command::EnableWrite(fds) => self.set_interest(&fds, None, Some(true)),
            Command::DisableWrite(fds) => self.set_interest(&fds, None, Some(false)),
            Command::Stop => {}
        }
    }

    /// Grace phase for bytes `write` already accepted: keep polling,
    /// bounded by the write wait, until every live connection has run
    /// its queued jobs and drained its writer. Blocked flushes re-arm
    /// through the command channel, so the channel keeps being served.
    fn drain_writes(&mut self) {
        let deadline = Instant::now() + self.cfg.write_wait;
        loop {
            let busy = self
                .registry
                .iter()
                .filter(|(_, reg)| {
                    !reg.state.is_dead()
                        && (reg.state.jobs_in_flight() > 0
                            || !reg.state.lock_writer().is_empty())
                })
                .count();
            if busy == 0 {
                return;
            }
            if Instant::now() >= deadline {
                tracing::debug!("stopping with {} connections still flushing", busy);
                return;
            }
            while let Ok(cmd) = self.rx.try_recv() {
                self.late_command(cmd);
            }
            self.poll_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::time::Duration;

    use crossbeam::channel::{bounded, unbounded};

    use super::*;
    use crate::io::sys::poll_backend;
    use crate::testing;

    fn test_reactor() -> (Reactor, Sender<Command>) {
        let backend = poll_backend().unwrap();
        let (tx, rx) = unbounded();
        let handle = SelectorHandle::new(tx.clone(), backend.waker());
        let pool = WorkerPool::start(1, false).unwrap();
        let cfg = SelectorConfig::default().with_poll_timeout(Duration::from_millis(5));
        let reactor = Reactor::new(
            backend,
            rx,
            pool,
            handle,
            cfg,
            Arc::new(AtomicUsize::new(0)),
        );
        (reactor, tx)
    }

    fn weak_listener(listener: &Arc<testing::Recording>) -> Weak<dyn Listener> {
        let strong: Arc<dyn Listener> = listener.clone();
        Arc::downgrade(&strong)
    }

    #[test]
    fn test_register_rejects_duplicate_fd() {
        let (mut reactor, _tx) = test_reactor();
        let (a, b) = Connection::pair().unwrap();
        let fd = a.fd();
        let listener = testing::Recording::new();

        reactor.register_conn(a, weak_listener(&listener)).unwrap();
        assert_eq!(reactor.registry.len(), 1);

        // an alias for a registered descriptor must be refused and the
        // original registration left alone
        let alias = Connection::new(unsafe { OwnedFd::from_raw_fd(fd) }).unwrap();
        assert!(matches!(
            reactor.register_conn(alias, weak_listener(&listener)),
            Err(Error::AlreadyRegistered)
        ));
        assert_eq!(reactor.registry.len(), 1);

        // the refused alias was not allowed to close the descriptor
        nix::unistd::write(&b, b"still open").unwrap();
        let (_, state) = reactor.registry.lookup_fd(fd).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(nix::unistd::read(state.fd(), &mut buf).unwrap(), 10);
    }

    #[test]
    fn test_parked_write_lands_after_add() {
        let (mut reactor, tx) = test_reactor();
        let (a, b) = Connection::pair().unwrap();
        let fd = a.fd();
        let listener = testing::Recording::new();

        let (reply, answer) = bounded(1);
        tx.send(Command::Write {
            fd,
            bytes: b"early".to_vec(),
            reply,
        })
        .unwrap();
        reactor.tick();
        assert_eq!(reactor.parked.len(), 1);
        assert!(answer.is_empty());

        let (add_reply, add_answer) = bounded(1);
        tx.send(Command::Add {
            conn: a,
            listener: weak_listener(&listener),
            reply: add_reply,
        })
        .unwrap();
        reactor.tick();

        assert!(add_answer.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert!(answer.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert!(reactor.parked.is_empty());
        let mut got = vec![0u8; 16];
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match nix::unistd::read(b.fd(), &mut got) {
                Ok(n) if n > 0 => {
                    assert_eq!(&got[..n], b"early");
                    break;
                }
                _ if std::time::Instant::now() >= deadline => panic!("write never landed"),
                _ => std::thread::sleep(Duration::from_millis(2)),
            }
        }
    }

    #[test]
    fn test_unknown_write_fails_on_second_tick() {
        let (mut reactor, tx) = test_reactor();
        let (reply, answer) = bounded(1);
        tx.send(Command::Write {
            fd: 999_999,
            bytes: b"x".to_vec(),
            reply,
        })
        .unwrap();

        reactor.tick();
        assert!(answer.is_empty());
        reactor.tick();
        assert!(matches!(
            answer.recv_timeout(Duration::from_secs(1)),
            Ok(Err(Error::WriterUnavailable))
        ));
    }

    #[test]
    fn test_stale_and_dead_events_are_discarded() {
        let (mut reactor, _tx) = test_reactor();

        // never-registered token
        reactor.dispatch_event(Event {
            token: 42,
            readable: true,
            writable: false,
            error: false,
            hangup: false,
        });

        // registered but already dead
        let (a, _b) = Connection::pair().unwrap();
        let fd = a.fd();
        let listener = testing::Recording::new();
        reactor.register_conn(a, weak_listener(&listener)).unwrap();
        let (token, state) = reactor.registry.lookup_fd(fd).unwrap();
        state.kill();
        reactor.dispatch_event(Event {
            token,
            readable: true,
            writable: false,
            error: false,
            hangup: false,
        });
        assert_eq!(state.jobs_in_flight(), 0);
        assert_eq!(listener.read_count(), 0);
    }
}
