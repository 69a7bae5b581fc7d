//! Backend on top of the mio polling library.

use std::collections::HashSet;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use ::mio::unix::SourceFd;
use ::mio::{Events, Poll, Registry};

use crate::io::backend::{Backend, Event, Interest, Token, Wake};
use crate::io::sys::unix::{MAX_EVENTS_RETURNED, WAKE_TOKEN};

/// mio delivers edge-triggered notifications, so this backend leans on
/// two properties to honor the level-triggered contract: the read path
/// drains until `EAGAIN` before re-arming, and re-arming goes through
/// `reregister`/`register`, which replays readiness that is still
/// pending. mio also rejects empty interest sets, so a fully disarmed
/// registration is deregistered and tracked here until a direction comes
/// back.
///
/// Like kqueue, a fully disarmed registration reports nothing, including
/// peer hangups, until a direction re-arms.
pub(crate) struct MioBackend {
    poll: Poll,
    events: Events,
    registered: HashSet<Token>,
    waker: Arc<MioWaker>,
}

struct MioWaker(::mio::Waker);

impl Wake for MioWaker {
    fn wake(&self) {
        let _ = self.0.wake();
    }
}

impl MioBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = ::mio::Waker::new(poll.registry(), ::mio::Token(WAKE_TOKEN))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS_RETURNED),
            registered: HashSet::new(),
            waker: Arc::new(MioWaker(waker)),
        })
    }

    fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    fn interests(interest: Interest) -> Option<::mio::Interest> {
        match (interest.read, interest.write) {
            (true, true) => Some(::mio::Interest::READABLE | ::mio::Interest::WRITABLE),
            (true, false) => Some(::mio::Interest::READABLE),
            (false, true) => Some(::mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl Backend for MioBackend {
    fn name(&self) -> &'static str {
        "mio"
    }

    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        match Self::interests(interest) {
            Some(interests) => {
                self.registry()
                    .register(&mut SourceFd(&fd), ::mio::Token(token), interests)?;
                self.registered.insert(token);
            }
            None => {
                self.registered.remove(&token);
            }
        }
        Ok(())
    }

    fn update(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        match (Self::interests(interest), self.registered.contains(&token)) {
            (Some(interests), true) => {
                self.registry()
                    .reregister(&mut SourceFd(&fd), ::mio::Token(token), interests)?;
            }
            (Some(interests), false) => {
                self.registry()
                    .register(&mut SourceFd(&fd), ::mio::Token(token), interests)?;
                self.registered.insert(token);
            }
            (None, true) => {
                self.registry().deregister(&mut SourceFd(&fd))?;
                self.registered.remove(&token);
            }
            (None, false) => {}
        }
        Ok(())
    }

    fn deregister(&mut self, token: Token, fd: RawFd) -> io::Result<()> {
        if self.registered.remove(&token) {
            self.registry().deregister(&mut SourceFd(&fd))?;
        }
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            let token = event.token().0;
            if token == WAKE_TOKEN {
                continue;
            }
            events.push(Event {
                token,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            });
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }
}
