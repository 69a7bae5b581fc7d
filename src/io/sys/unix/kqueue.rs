//! kqueue backend.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};

use crate::io::backend::{Backend, Event, Interest, Token, Wake};
use crate::io::sys::unix::{WakePipe, MAX_EVENTS_RETURNED, WAKE_TOKEN};

/// kqueue keeps one filter per direction, toggled with `EV_ENABLE` and
/// `EV_DISABLE`. `EV_ADD` doubles as modify, so registration and interest
/// updates submit the same change pair.
///
/// Unlike poll and epoll, a disabled filter reports nothing at all. A
/// peer that dies while a connection is fully disarmed is therefore
/// detected when a direction re-arms or the next write fails, not
/// immediately.
pub(crate) struct KqueueBackend {
    kq: Kqueue,
    events: [KEvent; MAX_EVENTS_RETURNED],
    wake: WakePipe,
}

impl KqueueBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = Kqueue::new()?;
        let wake = WakePipe::new()?;
        let backend = Self {
            kq,
            events: [empty_kevent(); MAX_EVENTS_RETURNED],
            wake,
        };
        backend.submit(&[filter_change(
            backend.wake.fd(),
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE,
            WAKE_TOKEN,
        )])?;
        Ok(backend)
    }

    fn submit(&self, changes: &[KEvent]) -> io::Result<()> {
        // an empty eventlist makes kevent apply the changelist and report
        // failures through errno instead of inline EV_ERROR records
        self.kq
            .kevent(changes, &mut [], None)
            .map(drop)
            .map_err(io::Error::from)
    }

    fn interest_changes(fd: RawFd, token: Token, interest: Interest) -> [KEvent; 2] {
        [
            filter_change(
                fd,
                EventFilter::EVFILT_READ,
                EventFlag::EV_ADD | toggle(interest.read),
                token,
            ),
            filter_change(
                fd,
                EventFilter::EVFILT_WRITE,
                EventFlag::EV_ADD | toggle(interest.write),
                token,
            ),
        ]
    }
}

fn toggle(armed: bool) -> EventFlag {
    if armed {
        EventFlag::EV_ENABLE
    } else {
        EventFlag::EV_DISABLE
    }
}

fn filter_change(fd: RawFd, filter: EventFilter, flags: EventFlag, token: Token) -> KEvent {
    KEvent::new(
        fd as libc::uintptr_t,
        filter,
        flags,
        FilterFlag::empty(),
        0,
        token as libc::intptr_t,
    )
}

fn empty_kevent() -> KEvent {
    filter_change(0, EventFilter::EVFILT_READ, EventFlag::empty(), 0)
}

fn timespec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs().min(i64::MAX as u64) as libc::time_t,
        tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.submit(&Self::interest_changes(fd, token, interest))
    }

    fn update(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.submit(&Self::interest_changes(fd, token, interest))
    }

    fn deregister(&mut self, token: Token, fd: RawFd) -> io::Result<()> {
        // a closed descriptor drops its filters on its own
        let changes = [
            filter_change(fd, EventFilter::EVFILT_READ, EventFlag::EV_DELETE, token),
            filter_change(fd, EventFilter::EVFILT_WRITE, EventFlag::EV_DELETE, token),
        ];
        match self.submit(&changes) {
            Ok(()) => Ok(()),
            Err(err) if matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()> {
        let n = match self.kq.kevent(&[], &mut self.events, Some(timespec(timeout))) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(()),
            Err(err) => return Err(io::Error::from(err)),
        };

        for i in 0..n {
            let event = &self.events[i];
            let token = event.udata() as usize;
            if token == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }
            let filter = event.filter();
            let flags = event.flags();
            events.push(Event {
                token,
                readable: filter == Ok(EventFilter::EVFILT_READ),
                writable: filter == Ok(EventFilter::EVFILT_WRITE),
                error: flags.contains(EventFlag::EV_ERROR),
                hangup: flags.contains(EventFlag::EV_EOF),
            });
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.wake.waker()
    }
}
