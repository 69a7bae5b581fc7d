//! One connection, owned end to end.
//!
//! A [`Controller`] ties a [`Connection`] to a selector registration and
//! walks it through `Open -> Closing -> Closed`, exactly once. Reads,
//! write confirmations and errors arrive through an internal forwarding
//! listener and land on whatever recipient [`set_listener`] installed;
//! the recipient can be swapped while traffic flows.
//!
//! Whichever side dies first, the registration is destroyed as a unit:
//! an engine-side failure cascades into the controller, a deliberate
//! [`close`] cascades into the engine, and the recipient hears about it
//! exactly once either way.
//!
//! [`set_listener`]: Controller::set_listener
//! [`close`]: Controller::close

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::conn::Connection;
use crate::error::{CloseReason, Error};
use crate::listener::{emit_error, Listener};
use crate::lock;
use crate::selector::{default_selector, Selector};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle handle for one connection.
pub struct Controller {
    fd: RawFd,
    state: AtomicU8,
    notified: AtomicBool,
    selector: Mutex<Selector>,
    recipient: Mutex<Option<Arc<dyn Listener>>>,
    forwarder: Arc<Forwarder>,
}

/// The listener the selector actually sees. Holds the controller weakly
/// so a dropped controller silently unhooks instead of leaking.
struct Forwarder {
    ctrl: Weak<Controller>,
}

impl Listener for Forwarder {
    fn on_read(&self, fd: RawFd, bytes: &[u8]) {
        let Some(ctrl) = self.ctrl.upgrade() else {
            return;
        };
        let recipient = lock(&ctrl.recipient).clone();
        if let Some(listener) = recipient {
            listener.on_read(fd, bytes);
        }
    }

    fn on_write(&self, fd: RawFd, n: usize) {
        let Some(ctrl) = self.ctrl.upgrade() else {
            return;
        };
        let recipient = lock(&ctrl.recipient).clone();
        if let Some(listener) = recipient {
            listener.on_write(fd, n);
        }
    }

    fn on_error(&self, _fd: RawFd, err: Error) {
        if let Some(ctrl) = self.ctrl.upgrade() {
            ctrl.finish(err);
        }
    }
}

impl Controller {
    /// Takes ownership of `conn` and registers it. `None` lands on the
    /// process-wide [`default_selector`].
    ///
    /// The controller starts with no recipient: traffic is accepted and
    /// dropped until [`set_listener`](Controller::set_listener) installs
    /// one.
    pub fn open(conn: Connection, selector: Option<&Selector>) -> Result<Arc<Self>, Error> {
        let selector = match selector {
            Some(selector) => selector.clone(),
            None => default_selector()?,
        };
        let fd = conn.fd();
        let ctrl = Arc::new_cyclic(|weak| Controller {
            fd,
            state: AtomicU8::new(OPEN),
            notified: AtomicBool::new(false),
            selector: Mutex::new(selector.clone()),
            recipient: Mutex::new(None),
            forwarder: Arc::new(Forwarder { ctrl: weak.clone() }),
        });
        if let Err(err) = selector.add(conn, ctrl.forwarder.clone()) {
            // never registered; make sure drop has nothing left to do
            ctrl.state.store(CLOSED, Ordering::SeqCst);
            ctrl.notified.store(true, Ordering::SeqCst);
            return Err(err);
        }
        tracing::debug!("controller opened fd {}", fd);
        Ok(ctrl)
    }

    /// Replaces the downstream recipient. Callbacks already running see
    /// the old one; everything after sees the new one.
    pub fn set_listener(&self, recipient: Arc<dyn Listener>) {
        *lock(&self.recipient) = Some(recipient);
    }

    /// Queues `bytes` behind everything already queued. On a closing or
    /// closed controller this is a logged no-op, not an error: the close
    /// notification already told the recipient everything it needs.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), Error> {
        if self.state.load(Ordering::SeqCst) != OPEN {
            tracing::debug!("send on fd {} ignored, controller is closed", self.fd);
            return Ok(());
        }
        let selector = lock(&self.selector).clone();
        selector.write(self.fd, bytes)
    }

    /// Closes the connection. Idempotent; the recipient gets exactly one
    /// `on_error` with [`CloseReason::Requested`], serialized with the
    /// connection's other callbacks.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::debug!("closing fd {}", self.fd);
        let selector = lock(&self.selector).clone();
        if !selector.fail(self.fd, CloseReason::Requested) {
            // nothing registered to deliver it for us
            self.finish(Error::ConnectionClosed(CloseReason::Requested));
        }
    }

    /// Moves the live connection to `selector`. In-flight callbacks get
    /// a bounded window to finish first; bytes still queued on the old
    /// writer do not follow the descriptor.
    pub fn select(&self, selector: &Selector) -> Result<(), Error> {
        if self.state.load(Ordering::SeqCst) != OPEN {
            return Err(Error::ConnectionClosed(CloseReason::Requested));
        }
        let old = lock(&self.selector).clone();
        let Some(conn) = old.detach(self.fd) else {
            // the registration vanished under us; reflect that
            self.finish(Error::ConnectionClosed(CloseReason::BadDescriptor));
            return Err(Error::ConnectionClosed(CloseReason::BadDescriptor));
        };
        match selector.add(conn, self.forwarder.clone()) {
            Ok(()) => {
                *lock(&self.selector) = selector.clone();
                tracing::debug!("fd {} moved selectors", self.fd);
                Ok(())
            }
            Err(err) => {
                // the descriptor was consumed by the failed add
                self.finish(Error::ConnectionClosed(CloseReason::BadDescriptor));
                Err(err)
            }
        }
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Terminal bookkeeping: mark closed and notify the recipient, at
    /// most once for the whole controller lifetime.
    fn finish(&self, err: Error) {
        self.state.store(CLOSED, Ordering::SeqCst);
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        let recipient = lock(&self.recipient).clone();
        if let Some(listener) = recipient {
            emit_error(&*listener, self.fd, err);
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::SeqCst) {
            OPEN => "open",
            CLOSING => "closing",
            _ => "closed",
        };
        f.debug_struct("Controller")
            .field("fd", &self.fd)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use nix::errno::Errno;
    use nix::unistd;

    use super::*;
    use crate::cfg::SelectorConfig;
    use crate::io::sys::poll_backend;
    use crate::testing;

    fn fresh_selector() -> Selector {
        testing::init_tracing();
        let cfg = SelectorConfig::default()
            .with_poll_timeout(Duration::from_millis(5))
            .with_workers(1)
            .with_write_wait(Duration::from_secs(2));
        let selector = Selector::new(poll_backend().unwrap(), cfg);
        selector.run().unwrap();
        selector
    }

    fn read_until(conn: &Connection, want: usize) -> Vec<u8> {
        let mut got = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.len() < want && Instant::now() < deadline {
            match unistd::read(conn.fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(Errno::EAGAIN) => thread::sleep(Duration::from_millis(2)),
                Err(Errno::EINTR) => {}
                Err(errno) => panic!("peer read failed: {errno}"),
            }
        }
        got
    }

    fn saw_eof(conn: &Connection) -> bool {
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match unistd::read(conn.fd(), &mut buf) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(Errno::EAGAIN) => thread::sleep(Duration::from_millis(2)),
                Err(_) => return true,
            }
        }
        false
    }

    #[test]
    fn test_echo_round_trip() {
        let selector = fresh_selector();
        let (local, remote) = Connection::pair().unwrap();
        let ctrl = Controller::open(local, Some(&selector)).unwrap();
        let recipient = testing::Recording::new();
        ctrl.set_listener(recipient.clone());

        unistd::write(&remote, b"ping").unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            recipient.read_bytes() == b"ping"
        }));

        ctrl.send(&b"pong"[..]).unwrap();
        assert_eq!(read_until(&remote, 4), b"pong");
        assert!(testing::wait_until(Duration::from_secs(2), || {
            recipient.written() == 4
        }));
        assert!(!ctrl.is_closed());
        selector.stop();
    }

    #[test]
    fn test_ping_pong_between_controllers() {
        use crate::listener::CallbackListener;

        let selector = fresh_selector();
        let (left, right) = Connection::pair().unwrap();
        let a = Controller::open(left, Some(&selector)).unwrap();
        let b = Controller::open(right, Some(&selector)).unwrap();

        let at_a = testing::Recording::new();
        a.set_listener(at_a.clone());

        // b answers the full ping with a pong, from inside its callback
        let pinged = Arc::new(Mutex::new(Vec::new()));
        let seen = pinged.clone();
        let replier = Arc::downgrade(&b);
        b.set_listener(Arc::new(CallbackListener::new().with_read(move |_, bytes| {
            let mut seen = lock(&seen);
            seen.extend_from_slice(bytes);
            if seen.as_slice() == b"ping" {
                if let Some(ctrl) = replier.upgrade() {
                    ctrl.send(&b"pong"[..]).unwrap();
                }
            }
        })));

        a.send(&b"ping"[..]).unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            at_a.read_bytes() == b"pong"
        }));
        assert_eq!(lock(&pinged).as_slice(), b"ping");
        assert_eq!(at_a.error_count(), 0);
        selector.stop();
    }

    #[test]
    fn test_close_notifies_once_and_send_becomes_noop() {
        let selector = fresh_selector();
        let (local, remote) = Connection::pair().unwrap();
        let ctrl = Controller::open(local, Some(&selector)).unwrap();
        let recipient = testing::Recording::new();
        ctrl.set_listener(recipient.clone());

        ctrl.close();
        ctrl.close();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            ctrl.is_closed() && recipient.error_count() == 1
        }));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(recipient.error_count(), 1);
        assert!(matches!(
            recipient.errors().as_slice(),
            [Error::ConnectionClosed(CloseReason::Requested)]
        ));

        // sending into a closed controller is accepted and dropped
        assert!(ctrl.send(&b"too late"[..]).is_ok());
        assert!(saw_eof(&remote));
        assert_eq!(recipient.error_count(), 1);
        selector.stop();
    }

    #[test]
    fn test_remote_close_cascades() {
        let selector = fresh_selector();
        let (local, remote) = Connection::pair().unwrap();
        let ctrl = Controller::open(local, Some(&selector)).unwrap();
        let recipient = testing::Recording::new();
        ctrl.set_listener(recipient.clone());

        drop(remote);
        assert!(testing::wait_until(Duration::from_secs(2), || {
            ctrl.is_closed() && recipient.error_count() == 1
        }));
        assert!(matches!(
            recipient.errors().as_slice(),
            [Error::ConnectionClosed(CloseReason::Eof)]
        ));
        assert!(testing::wait_until(Duration::from_secs(2), || {
            selector.is_empty()
        }));
        selector.stop();
    }

    #[test]
    fn test_select_moves_connection() {
        let first = fresh_selector();
        let second = fresh_selector();
        let (local, remote) = Connection::pair().unwrap();
        let ctrl = Controller::open(local, Some(&first)).unwrap();
        let recipient = testing::Recording::new();
        ctrl.set_listener(recipient.clone());
        assert!(testing::wait_until(Duration::from_secs(2), || {
            first.len() == 1
        }));

        ctrl.select(&second).unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            first.is_empty() && second.len() == 1
        }));

        // traffic flows through the new selector in both directions
        unistd::write(&remote, b"moved").unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            recipient.read_bytes() == b"moved"
        }));
        ctrl.send(&b"back"[..]).unwrap();
        assert_eq!(read_until(&remote, 4), b"back");

        first.stop();
        second.stop();
    }

    #[test]
    fn test_set_listener_swaps_recipient() {
        let selector = fresh_selector();
        let (local, remote) = Connection::pair().unwrap();
        let ctrl = Controller::open(local, Some(&selector)).unwrap();
        let first = testing::Recording::new();
        ctrl.set_listener(first.clone());

        unistd::write(&remote, b"one").unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            first.read_bytes() == b"one"
        }));

        let second = testing::Recording::new();
        ctrl.set_listener(second.clone());
        unistd::write(&remote, b"two").unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            second.read_bytes() == b"two"
        }));
        assert_eq!(first.read_bytes(), b"one");
        selector.stop();
    }

    #[test]
    fn test_dropping_controller_tears_down_quietly() {
        let selector = fresh_selector();
        let (local, remote) = Connection::pair().unwrap();
        let recipient = testing::Recording::new();
        {
            let ctrl = Controller::open(local, Some(&selector)).unwrap();
            ctrl.set_listener(recipient.clone());
            assert!(testing::wait_until(Duration::from_secs(2), || {
                selector.len() == 1
            }));
        }
        assert!(testing::wait_until(Duration::from_secs(2), || {
            selector.is_empty()
        }));
        // nobody held the controller, so nobody gets notified
        assert!(saw_eof(&remote));
        assert_eq!(recipient.error_count(), 0);
        selector.stop();
    }
}
