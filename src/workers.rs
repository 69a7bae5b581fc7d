//! Callback workers.
//!
//! Every connection is pinned to one worker by token, so its listener
//! callbacks run strictly one after another without a lock around user
//! code. Different connections land on different workers and run in
//! parallel.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::CloseReason;
use crate::io::Token;
use crate::selector::registry::ConnState;

/// Unit of work for a pinned worker.
pub(crate) enum Job {
    /// Drain the socket and hand the bytes to the listener.
    Read(Arc<ConnState>),
    /// The socket went writable; push queued bytes at it.
    Flush(Arc<ConnState>),
    /// Queue a payload and try to write it right away.
    Append(Arc<ConnState>, Vec<u8>),
    /// Tear the connection down and tell the listener why.
    Fail(Arc<ConnState>, CloseReason),
    /// Drain out; ack when the worker is gone.
    Stop(Sender<()>),
}

pub(crate) struct WorkerPool {
    inboxes: Vec<Sender<Job>>,
}

impl WorkerPool {
    pub(crate) fn start(count: usize, pin: bool) -> io::Result<Self> {
        let count = count.max(1);
        let cores = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut inboxes = Vec::with_capacity(count);
        for i in 0..count {
            let (tx, rx) = unbounded();
            let core = cores.get(i % cores.len().max(1)).copied();
            thread::Builder::new()
                .name(format!("muxio-conn-{i}"))
                .spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    worker_loop(rx);
                })?;
            inboxes.push(tx);
        }
        Ok(Self { inboxes })
    }

    /// Routes by token so one connection always hits the same worker.
    #[inline(always)]
    pub(crate) fn dispatch(&self, token: Token, job: Job) {
        let _ = self.inboxes[token % self.inboxes.len()].send(job);
    }

    /// Asks every worker to drain and waits up to `wait` for each ack.
    pub(crate) fn stop(&self, wait: Duration) {
        let mut acks = Vec::with_capacity(self.inboxes.len());
        for inbox in &self.inboxes {
            let (tx, rx) = crossbeam::channel::bounded(1);
            if inbox.send(Job::Stop(tx)).is_ok() {
                acks.push(rx);
            }
        }
        for ack in acks {
            if ack.recv_timeout(wait).is_err() {
                tracing::warn!("connection worker did not stop in {:?}", wait);
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Read(state) => {
                state.lock_reader().drain(&state);
                state.end_job();
            }
            Job::Flush(state) => {
                let (wrote, fatal) = state.lock_writer().flush(&state);
                finish_write(&state, wrote, fatal);
                state.end_job();
            }
            Job::Append(state, bytes) => {
                let (wrote, fatal) = {
                    let mut writer = state.lock_writer();
                    writer.push(bytes);
                    writer.flush(&state)
                };
                finish_write(&state, wrote, fatal);
                state.end_job();
            }
            Job::Fail(state, reason) => {
                state.fail(reason);
                state.end_job();
            }
            Job::Stop(ack) => {
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// Callbacks happen here, after the writer lock is gone.
fn finish_write(state: &ConnState, wrote: usize, fatal: Option<CloseReason>) {
    if wrote > 0 && !state.is_dead() {
        state.notify_write(wrote);
    }
    if let Some(reason) = fatal {
        state.fail(reason);
    }
}
