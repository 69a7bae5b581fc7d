//! epoll backend.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::io::backend::{Backend, Event, Interest, Token, Wake};
use crate::io::sys::unix::{WakePipe, MAX_EVENTS_RETURNED, WAKE_TOKEN};

/// Level-triggered epoll. Interest changes are one `EPOLL_CTL_MOD` each,
/// so a direction that did not fire stays armed with no extra syscall.
/// `EPOLLERR` and `EPOLLHUP` are unmaskable, which covers error detection
/// for fully disarmed registrations.
pub(crate) struct EpollBackend {
    epoll: Epoll,
    events: [EpollEvent; MAX_EVENTS_RETURNED],
    wake: WakePipe,
}

impl EpollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let wake = WakePipe::new()?;
        epoll.add(
            unsafe { BorrowedFd::borrow_raw(wake.fd()) },
            EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN as u64),
        )?;

        Ok(Self {
            epoll,
            events: [EpollEvent::empty(); MAX_EVENTS_RETURNED],
            wake,
        })
    }

    fn flags(interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.epoll
            .add(
                unsafe { BorrowedFd::borrow_raw(fd) },
                EpollEvent::new(Self::flags(interest), token as u64),
            )
            .map_err(io::Error::from)
    }

    fn update(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.epoll
            .modify(
                unsafe { BorrowedFd::borrow_raw(fd) },
                &mut EpollEvent::new(Self::flags(interest), token as u64),
            )
            .map_err(io::Error::from)
    }

    fn deregister(&mut self, _token: Token, fd: RawFd) -> io::Result<()> {
        self.epoll
            .delete(unsafe { BorrowedFd::borrow_raw(fd) })
            .map_err(io::Error::from)
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()> {
        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let timeout = EpollTimeout::try_from(ms).unwrap_or(EpollTimeout::ZERO);
        let n = match self.epoll.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(()),
            Err(err) => return Err(io::Error::from(err)),
        };

        for i in 0..n {
            let event = &self.events[i];
            let token = event.data() as usize;
            if token == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }
            let flags = event.events();
            events.push(Event {
                token,
                readable: flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.contains(EpollFlags::EPOLLERR),
                hangup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
            });
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.wake.waker()
    }
}
