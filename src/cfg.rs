//! Selector tuning knobs.

use std::time::Duration;

/// Configuration for one [`Selector`](crate::selector::Selector).
///
/// The defaults suit interactive workloads: a short poll timeout keeps
/// command latency low, and the 4 KiB read buffer matches the drain loop's
/// short-read heuristic (a full buffer means more data is likely waiting).
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Upper bound for one blocking poll call. Wake-ups cut it short.
    pub poll_timeout: Duration,
    /// Read buffer capacity per connection.
    pub buffer_size: usize,
    /// Worker threads running connection callbacks. `0` means one per core.
    pub workers: usize,
    /// Pin workers to cores, round-robin.
    pub pin_workers: bool,
    /// How long `add` and `write` wait for the poll loop to answer; also
    /// the grace period for flushing accepted writes during stop.
    pub write_wait: Duration,
}

impl SelectorConfig {
    pub const fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            buffer_size: 4096,
            workers: 0,
            pin_workers: false,
            write_wait: Duration::from_secs(1),
        }
    }

    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub const fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub const fn with_pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub const fn with_write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    /// Resolves `workers == 0` to the machine's core count.
    pub(crate) fn worker_count(&self) -> usize {
        if self.workers != 0 {
            return self.workers;
        }
        core_affinity::get_core_ids()
            .map(|ids| ids.len())
            .unwrap_or(1)
            .max(1)
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig::default()
    }
}
