//! Connection handles owned by the engine.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::{fmt, io};

use socket2::{Domain, Socket, Type};

/// A non-blocking stream descriptor.
///
/// The selector takes ownership on `add` and closes the descriptor when the
/// registration is dropped, so the raw fd stays valid for exactly as long
/// as the registration lives. Callers keep the [`RawFd`] as the key for
/// writes, interest changes and removal.
///
/// Any type convertible to [`OwnedFd`] can be wrapped, which covers
/// `std::net::TcpStream`, `std::os::unix::net::UnixStream` and friends.
pub struct Connection {
    fd: OwnedFd,
}

impl Connection {
    /// Wraps an already open descriptor and switches it to non-blocking
    /// mode. Blocking descriptors handed to a selector would stall the
    /// drain loops, so this is not optional.
    pub fn new(fd: impl Into<OwnedFd>) -> io::Result<Self> {
        let socket = Socket::from(fd.into());
        socket.set_nonblocking(true)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_nosigpipe(true)?;
        Ok(Self { fd: socket.into() })
    }

    /// A connected pair of non-blocking unix stream sockets. One end is
    /// typically registered while the other is driven by the peer side of
    /// a bridge or a test.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        for socket in [&a, &b] {
            socket.set_nonblocking(true)?;
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            socket.set_nosigpipe(true)?;
        }
        Ok((Self { fd: a.into() }, Self { fd: b.into() }))
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<Connection> for OwnedFd {
    fn from(conn: Connection) -> OwnedFd {
        conn.fd
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("fd", &self.fd()).finish()
    }
}
