//! Write side of a registration.

use std::collections::VecDeque;
#[cfg(test)]
use std::time::{Duration, Instant};

#[cfg(test)]
use crossbeam_utils::Backoff;
use nix::errno::Errno;

use crate::error::{close_reason, CloseReason};
use crate::io::sys::send_noblock;
use crate::selector::registry::ConnState;

/// One queued payload with a cursor over what the kernel has taken.
struct WriteBuf {
    bytes: Vec<u8>,
    pos: usize,
}

impl WriteBuf {
    fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }

    #[inline(always)]
    fn remaining(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    #[inline(always)]
    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// Ordered write queue for one connection.
///
/// A flush pushes the front payload at the kernel until everything is
/// gone or the socket stops taking bytes. A partial write leaves the
/// exact unwritten suffix at the front, so no byte is ever dropped,
/// duplicated or reordered. Blocked flushes arm write interest and the
/// next writable event picks the suffix back up.
///
/// # Note
///
/// `flush` never runs listener callbacks. It reports what happened and
/// the calling worker notifies after releasing the writer lock, so the
/// poll thread can always take this lock without waiting on user code.
pub(crate) struct Writer {
    queue: VecDeque<WriteBuf>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, bytes: Vec<u8>) {
        self.queue.push_back(WriteBuf::new(bytes));
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes queued and not yet accepted by the kernel.
    pub(crate) fn pending(&self) -> usize {
        self.queue.iter().map(|buf| buf.remaining().len()).sum()
    }

    /// Drops everything still queued and reports the byte count that
    /// never made it out. Removal and shutdown call this so a torn-down
    /// connection never flushes stale bytes.
    pub(crate) fn clear(&mut self) -> usize {
        let unsent = self.pending();
        self.queue.clear();
        unsent
    }

    /// One flush pass. Returns the byte count the kernel accepted plus
    /// the close reason if the socket is beyond saving; a fatal pass
    /// discards the queue.
    pub(crate) fn flush(&mut self, state: &ConnState) -> (usize, Option<CloseReason>) {
        let mut wrote = 0usize;
        loop {
            if state.is_dead() {
                return (wrote, None);
            }
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            if front.is_done() {
                self.queue.pop_front();
                continue;
            }
            match send_noblock(state.fd(), front.remaining()) {
                Ok(0) => {
                    state.handle().enable_write(state.fd());
                    break;
                }
                Ok(n) => {
                    wrote += n;
                    front.pos += n;
                    if front.is_done() {
                        self.queue.pop_front();
                    } else {
                        // kernel took a prefix; keep the suffix queued and
                        // wait for the next writable event
                        state.handle().enable_write(state.fd());
                        break;
                    }
                }
                Err(Errno::EAGAIN) => {
                    state.handle().enable_write(state.fd());
                    break;
                }
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    self.queue.clear();
                    return (wrote, Some(close_reason(errno)));
                }
            }
        }
        (wrote, None)
    }
}

/// Waits up to `wait` for the connection's queue to drain. Returns
/// `false` on death or timeout; a dead connection discarded its queue
/// rather than delivering it, so an empty queue does not count there.
/// Checks between backoff snoozes instead of holding the writer lock,
/// so flush passes keep landing meanwhile.
#[cfg(test)]
pub(crate) fn await_empty(state: &ConnState, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    let backoff = Backoff::new();
    loop {
        if state.is_dead() {
            return false;
        }
        if state.lock_writer().is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        backoff.snooze();
    }
}
