//! # muxio
//!
//! A reactor-style non-blocking I/O engine: one poll thread multiplexes
//! readiness across many stream connections, and per-connection read and
//! write actors deliver ordered, backpressure-aware bytes to listener
//! callbacks.
//!
//! This crate provides:
//! - **[`Selector`]**: the reactor core; owns the registration table,
//!   runs the poll loop on a dedicated thread and dispatches readiness
//!   to a pool of connection workers
//! - **Polling backends**: `poll(2)`, epoll, kqueue and the mio library
//!   behind one [`Backend`](io::Backend) contract, picked at
//!   construction ([`io::sys::platform_backend`] chooses the native one)
//! - **[`Controller`]**: one connection as a single lifecycle unit with
//!   cascading close semantics
//! - **[`Listener`]**: the callback triple (`on_read`, `on_write`,
//!   `on_error`) consumers implement
//!
//! ```no_run
//! use std::sync::Arc;
//! use muxio::{CallbackListener, Connection, Controller};
//!
//! # fn main() -> Result<(), muxio::Error> {
//! let (local, _remote) = Connection::pair()?;
//! let ctrl = Controller::open(local, None)?;
//! ctrl.set_listener(Arc::new(CallbackListener::new().with_read(
//!     |fd, bytes| println!("fd {fd}: {} bytes", bytes.len()),
//! )));
//! ctrl.send(&b"hello"[..])?;
//! # Ok(())
//! # }
//! ```

pub mod cfg;
pub mod conn;
pub mod controller;
pub mod error;
pub mod io;
pub mod listener;
pub mod selector;

mod reader;
mod workers;
mod writer;

#[cfg(test)]
mod testing;

pub use cfg::SelectorConfig;
pub use conn::Connection;
pub use controller::Controller;
pub use error::{CloseReason, Error};
pub use listener::{CallbackListener, Listener};
pub use selector::{
    default_selector, replace_default_selector, reset_default_selector, Selector,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex lock that rides through poisoning. The only code that can
/// panic under the engine's locks runs inside `catch_unwind`, so a
/// poisoned lock never guards a half-written update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
