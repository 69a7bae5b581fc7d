//! The contract every polling mechanism implements.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one registration inside a backend. Tokens are slab keys
/// assigned by the selector and stay unique for the life of the
/// registration.
pub type Token = usize;

/// Interrupts a blocked [`Backend::poll`] call from another thread.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

/// The directions a registration is currently armed for.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    /// The arming every fresh registration starts with.
    pub const fn readable() -> Self {
        Self { read: true, write: false }
    }

    pub const fn none() -> Self {
        Self { read: false, write: false }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

/// One readiness report.
///
/// `readable`/`writable` only fire for armed directions. `error` and
/// `hangup` surface for every registration, armed or not, so dead peers
/// are detected even while a connection is fully disarmed.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// A level-triggered polling mechanism driving one selector.
///
/// All methods run on the selector's poll thread except the handle
/// returned by [`Backend::waker`], which is the one cross-thread entry
/// point. Implementations translate explicit interest updates into
/// whatever the underlying facility needs; an armed direction that did
/// not fire must stay armed without any re-registration.
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Adds a descriptor. `token` tags every later event for it.
    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Replaces the armed directions of an existing registration.
    fn update(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Forgets a descriptor. No events for `token` may be reported after
    /// this returns.
    fn deregister(&mut self, token: Token, fd: RawFd) -> io::Result<()>;

    /// Blocks up to `timeout` and appends readiness reports to `events`.
    /// A wake call cuts the wait short; an interrupted wait reports
    /// nothing. Returning `Ok` with no events is a normal timeout.
    fn poll(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()>;

    /// Handle other threads use to interrupt [`Backend::poll`].
    fn waker(&self) -> Arc<dyn Wake>;
}
