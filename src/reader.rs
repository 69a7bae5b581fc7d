//! Read side of a registration.

use nix::errno::Errno;
use nix::unistd;

use crate::error::{close_reason, CloseReason};
use crate::selector::registry::ConnState;

/// Drains a readable connection into a fixed buffer and forwards each
/// chunk as it lands.
///
/// A full buffer means the kernel probably has more, so the loop keeps
/// going. A short read or `EAGAIN` means the socket is drained for now:
/// re-arm read interest and stop. Zero bytes is the peer's goodbye.
pub(crate) struct Reader {
    buf: Vec<u8>,
}

impl Reader {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            buf: vec![0; buffer_size.max(1)],
        }
    }

    pub(crate) fn drain(&mut self, state: &ConnState) {
        loop {
            if state.is_dead() {
                return;
            }
            match unistd::read(state.fd(), &mut self.buf) {
                Ok(0) => {
                    state.fail(CloseReason::Eof);
                    return;
                }
                Ok(n) => {
                    state.notify_read(&self.buf[..n]);
                    if n < self.buf.len() {
                        state.handle().enable_read(state.fd());
                        return;
                    }
                }
                Err(Errno::EAGAIN) => {
                    state.handle().enable_read(state.fd());
                    return;
                }
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    state.fail(close_reason(errno));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd;

    use super::*;
    use crate::conn::Connection;
    use crate::error::Error;
    use crate::testing;

    #[test]
    fn test_forwards_chunks_and_rearms() {
        let (a, b) = Connection::pair().unwrap();
        let fd = a.fd();
        let listener = testing::Recording::new();
        let (state, rx) = testing::conn_state_with_listener(a, &listener);

        unistd::write(&b, b"hello").unwrap();
        Reader::new(4096).drain(&state);

        assert_eq!(listener.read_bytes(), b"hello");
        assert_eq!(testing::drain_read_arms(&rx), vec![fd]);
        assert_eq!(listener.error_count(), 0);
    }

    #[test]
    fn test_full_buffer_keeps_draining() {
        let (a, b) = Connection::pair().unwrap();
        let listener = testing::Recording::new();
        let (state, rx) = testing::conn_state_with_listener(a, &listener);

        unistd::write(&b, b"0123456789").unwrap();
        Reader::new(4).drain(&state);

        // three reads: 4 + 4 + 2, forwarded in order
        assert_eq!(listener.read_bytes(), b"0123456789");
        assert_eq!(listener.read_count(), 3);
        assert_eq!(testing::drain_read_arms(&rx).len(), 1);
    }

    #[test]
    fn test_would_block_rearms_silently() {
        let (a, _b) = Connection::pair().unwrap();
        let fd = a.fd();
        let listener = testing::Recording::new();
        let (state, rx) = testing::conn_state_with_listener(a, &listener);

        Reader::new(4096).drain(&state);

        assert_eq!(listener.read_count(), 0);
        assert_eq!(testing::drain_read_arms(&rx), vec![fd]);
    }

    #[test]
    fn test_eof_fails_connection() {
        let (a, b) = Connection::pair().unwrap();
        let listener = testing::Recording::new();
        let (state, rx) = testing::conn_state_with_listener(a, &listener);

        drop(b);
        Reader::new(4096).drain(&state);

        assert_eq!(listener.error_count(), 1);
        assert!(matches!(
            listener.errors().as_slice(),
            [Error::ConnectionClosed(CloseReason::Eof)]
        ));
        assert!(state.is_dead());
        assert!(!testing::drain_removals(&rx).is_empty());

        // a later drain on the dead state stays silent
        Reader::new(4096).drain(&state);
        assert_eq!(listener.error_count(), 1);
    }

    #[test]
    fn test_data_before_eof_is_delivered() {
        let (a, b) = Connection::pair().unwrap();
        let listener = testing::Recording::new();
        let (state, _rx) = testing::conn_state_with_listener(a, &listener);

        unistd::write(&b, b"last words").unwrap();
        drop(b);

        // first dispatch delivers the buffered bytes and re-arms
        let mut reader = Reader::new(4096);
        reader.drain(&state);
        assert_eq!(listener.read_bytes(), b"last words");
        assert_eq!(listener.error_count(), 0);

        // the next dispatch finds the end of stream
        reader.drain(&state);
        assert_eq!(listener.error_count(), 1);
    }
}
