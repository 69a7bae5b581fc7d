//! `poll(2)` backend.

use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::io::backend::{Backend, Event, Interest, Token, Wake};
use crate::io::sys::unix::{WakePipe, WAKE_TOKEN};

/// The portable reference backend. The whole descriptor table is rebuilt
/// for every call, which caps it at small registration counts but keeps
/// it runnable on any unix.
///
/// Disarmed registrations are still submitted with an empty event mask:
/// `POLLERR`, `POLLHUP` and `POLLNVAL` are unmaskable, which is exactly
/// what delivers error detection for idle connections.
pub(crate) struct PollBackend {
    entries: HashMap<Token, (RawFd, Interest)>,
    wake: WakePipe,
}

impl PollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            entries: HashMap::new(),
            wake: WakePipe::new()?,
        })
    }

    fn flags(interest: Interest) -> PollFlags {
        let mut flags = PollFlags::empty();
        if interest.read {
            flags |= PollFlags::POLLIN;
        }
        if interest.write {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.entries.insert(token, (fd, interest));
        Ok(())
    }

    fn update(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.entries.insert(token, (fd, interest));
        Ok(())
    }

    fn deregister(&mut self, token: Token, _fd: RawFd) -> io::Result<()> {
        self.entries.remove(&token);
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()> {
        let mut fds = Vec::with_capacity(self.entries.len() + 1);
        let mut tokens = Vec::with_capacity(self.entries.len() + 1);

        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(self.wake.fd()) },
            PollFlags::POLLIN,
        ));
        tokens.push(WAKE_TOKEN);

        for (&token, &(fd, interest)) in &self.entries {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                Self::flags(interest),
            ));
            tokens.push(token);
        }

        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(err) => return Err(io::Error::from(err)),
        }

        for i in 0..fds.len() {
            let revents = fds[i].revents().unwrap_or_else(PollFlags::empty);
            if revents.is_empty() {
                continue;
            }
            if tokens[i] == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }
            events.push(Event {
                token: tokens[i],
                readable: revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI),
                writable: revents.contains(PollFlags::POLLOUT),
                error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
                hangup: revents.contains(PollFlags::POLLHUP),
            });
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.wake.waker()
    }
}
