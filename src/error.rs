//! Errors surfaced by selector calls and [`Listener::on_error`].
//!
//! Would-block conditions never appear here. The read and write paths
//! consume `EAGAIN` internally and re-arm interest instead of reporting it.
//!
//! [`Listener::on_error`]: crate::listener::Listener::on_error

use std::{fmt, io};

use nix::errno::Errno;

/// Why a connection stopped being usable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer shut down its end and every buffered byte was delivered.
    Eof,
    /// The connection was reset by the peer.
    Reset,
    /// A write hit a connection whose read side is gone.
    BrokenPipe,
    /// The descriptor is no longer valid.
    BadDescriptor,
    /// The close was requested locally.
    Requested,
    /// Any other fatal I/O condition.
    Io(io::ErrorKind),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "end of stream"),
            CloseReason::Reset => write!(f, "connection reset"),
            CloseReason::BrokenPipe => write!(f, "broken pipe"),
            CloseReason::BadDescriptor => write!(f, "bad descriptor"),
            CloseReason::Requested => write!(f, "closed locally"),
            CloseReason::Io(kind) => write!(f, "io failure: {kind}"),
        }
    }
}

/// Everything a selector or controller call can fail with.
#[derive(Debug)]
pub enum Error {
    /// The descriptor is already registered with this selector.
    AlreadyRegistered,
    /// No write path could accept the payload within the bounded wait.
    WriterUnavailable,
    /// The connection is closed. Carries why.
    ConnectionClosed(CloseReason),
    /// The polling backend failed to set up or operate.
    Backend(io::Error),
    /// The selector is not running.
    Stopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyRegistered => write!(f, "descriptor already registered"),
            Error::WriterUnavailable => write!(f, "no writer available for descriptor"),
            Error::ConnectionClosed(reason) => write!(f, "connection closed: {reason}"),
            Error::Backend(err) => write!(f, "backend failure: {err}"),
            Error::Stopped => write!(f, "selector is not running"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Backend(err)
    }
}

/// Maps a fatal errno from a read or write to the reason handed to
/// [`Listener::on_error`]. `EAGAIN` must be filtered out before this point.
///
/// [`Listener::on_error`]: crate::listener::Listener::on_error
pub(crate) fn close_reason(errno: Errno) -> CloseReason {
    match errno {
        Errno::ECONNRESET | Errno::ECONNABORTED => CloseReason::Reset,
        Errno::EPIPE | Errno::ESHUTDOWN => CloseReason::BrokenPipe,
        Errno::EBADF => CloseReason::BadDescriptor,
        other => CloseReason::Io(io::Error::from(other).kind()),
    }
}
