//! Unix backends.
//!
//! Four implementations of [`Backend`]: `poll(2)` as the portable
//! reference, epoll on Linux, kqueue on the BSD family, and one built on
//! the mio library. [`platform_backend`] picks the native facility for
//! the platform.

use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};

use crate::error::Error;
use crate::io::backend::{Backend, Token};

mod mio;
mod poll;
mod waker;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;

pub(crate) use waker::WakePipe;

/// Token value reserved for the internal wake channel. Never reported.
pub(crate) const WAKE_TOKEN: Token = usize::MAX;

/// Event buffer capacity shared by all backends.
pub(crate) const MAX_EVENTS_RETURNED: usize = 256;

/// The `poll(2)` backend. Works on every unix.
pub fn poll_backend() -> Result<Box<dyn Backend>, Error> {
    Ok(Box::new(poll::PollBackend::new()?))
}

/// The epoll backend.
#[cfg(target_os = "linux")]
pub fn epoll_backend() -> Result<Box<dyn Backend>, Error> {
    Ok(Box::new(epoll::EpollBackend::new()?))
}

/// The kqueue backend.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub fn kqueue_backend() -> Result<Box<dyn Backend>, Error> {
    Ok(Box::new(kqueue::KqueueBackend::new()?))
}

/// Backend driven by the mio polling library.
pub fn mio_backend() -> Result<Box<dyn Backend>, Error> {
    Ok(Box::new(mio::MioBackend::new()?))
}

/// The native facility for this platform: epoll on Linux, kqueue on the
/// BSD family, `poll(2)` elsewhere.
pub fn platform_backend() -> Result<Box<dyn Backend>, Error> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            epoll_backend()
        } else if #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))] {
            kqueue_backend()
        } else {
            poll_backend()
        }
    }
}

/// Whether `fd` no longer names an open descriptor. Used to sweep
/// registrations whose descriptor was closed behind the selector's back
/// after the backend starts failing.
pub(crate) fn fd_is_closed(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) == -1 && Errno::last() == Errno::EBADF }
}

/// `send` that never raises `SIGPIPE`. On apple platforms the socket
/// carries `SO_NOSIGPIPE` instead, set when the [`Connection`] is built.
///
/// [`Connection`]: crate::conn::Connection
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub(crate) fn send_noblock(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    socket::send(fd, buf, MsgFlags::MSG_NOSIGNAL)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn send_noblock(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    socket::send(fd, buf, MsgFlags::empty())
}
