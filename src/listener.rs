//! Connection event callbacks.

use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::Error;

/// Receives the events of one registered connection.
///
/// Callbacks run on the selector's worker threads. Calls for the same
/// connection never overlap; calls for different connections may run in
/// parallel. The selector holds listeners weakly: dropping the last strong
/// reference silently retires the registration.
///
/// # Note
///
/// A panicking callback is caught and logged. It never unwinds into the
/// poll loop or a worker.
pub trait Listener: Send + Sync {
    /// Bytes arrived. The slice is only valid for the duration of the call.
    fn on_read(&self, fd: RawFd, bytes: &[u8]);

    /// A flush made progress. `n` is the byte count the kernel accepted.
    fn on_write(&self, fd: RawFd, n: usize);

    /// The connection died. Fired at most once per registration.
    fn on_error(&self, fd: RawFd, err: Error);
}

/// A [`Listener`] assembled from closures. Unset callbacks ignore their
/// events.
///
/// The builders are named `with_*` so they cannot shadow the trait's
/// `on_*` methods on a value of this type.
///
/// ```
/// use muxio::listener::CallbackListener;
///
/// let listener = CallbackListener::new()
///     .with_read(|fd, bytes| println!("fd {fd} got {} bytes", bytes.len()))
///     .with_error(|fd, err| eprintln!("fd {fd}: {err}"));
/// # let _ = listener;
/// ```
#[derive(Default)]
pub struct CallbackListener {
    read: Option<Box<dyn Fn(RawFd, &[u8]) + Send + Sync>>,
    write: Option<Box<dyn Fn(RawFd, usize) + Send + Sync>>,
    error: Option<Box<dyn Fn(RawFd, Error) + Send + Sync>>,
}

impl CallbackListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read(mut self, f: impl Fn(RawFd, &[u8]) + Send + Sync + 'static) -> Self {
        self.read = Some(Box::new(f));
        self
    }

    pub fn with_write(mut self, f: impl Fn(RawFd, usize) + Send + Sync + 'static) -> Self {
        self.write = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(RawFd, Error) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl Listener for CallbackListener {
    fn on_read(&self, fd: RawFd, bytes: &[u8]) {
        if let Some(f) = &self.read {
            f(fd, bytes);
        }
    }

    fn on_write(&self, fd: RawFd, n: usize) {
        if let Some(f) = &self.write {
            f(fd, n);
        }
    }

    fn on_error(&self, fd: RawFd, err: Error) {
        if let Some(f) = &self.error {
            f(fd, err);
        }
    }
}

pub(crate) fn emit_read(listener: &dyn Listener, fd: RawFd, bytes: &[u8]) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_read(fd, bytes))).is_err() {
        tracing::warn!("on_read panicked for fd {}", fd);
    }
}

pub(crate) fn emit_write(listener: &dyn Listener, fd: RawFd, n: usize) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_write(fd, n))).is_err() {
        tracing::warn!("on_write panicked for fd {}", fd);
    }
}

pub(crate) fn emit_error(listener: &dyn Listener, fd: RawFd, err: Error) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_error(fd, err))).is_err() {
        tracing::warn!("on_error panicked for fd {}", fd);
    }
}
