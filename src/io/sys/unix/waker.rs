//! Self-pipe wake channel for the syscall backends.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::unistd;
use socket2::{Domain, Socket, Type};

use crate::io::backend::Wake;
use crate::io::sys::unix::send_noblock;

/// Read half of the wake channel, owned by the backend. The backend arms
/// it like any other descriptor under [`WAKE_TOKEN`] and drains it when
/// it fires.
///
/// Built on a socketpair rather than a pipe so a wake sent after the read
/// half is gone fails with `EPIPE` instead of raising a signal.
///
/// [`WAKE_TOKEN`]: crate::io::sys::unix::WAKE_TOKEN
pub(crate) struct WakePipe {
    rd: OwnedFd,
    waker: Arc<PipeWaker>,
}

struct PipeWaker {
    tx: OwnedFd,
}

impl Wake for PipeWaker {
    fn wake(&self) {
        // a full buffer means wake-ups are already pending, and a gone
        // reader means the poll loop has stopped; both are fine to drop
        let _ = send_noblock(self.tx.as_raw_fd(), &[1]);
    }
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let (rd, tx) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        for socket in [&rd, &tx] {
            socket.set_nonblocking(true)?;
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            socket.set_nosigpipe(true)?;
        }
        Ok(Self {
            rd: rd.into(),
            waker: Arc::new(PipeWaker { tx: tx.into() }),
        })
    }

    #[inline(always)]
    pub(crate) fn fd(&self) -> RawFd {
        self.rd.as_raw_fd()
    }

    pub(crate) fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }

    /// Swallows every pending wake byte.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        while matches!(unistd::read(self.rd.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
    }
}
