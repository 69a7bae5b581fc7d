//! Polling backends and the readiness plumbing under the selector.

pub mod backend;
pub mod sys;

pub use backend::{Backend, Event, Interest, Token, Wake};
