//! The process-wide default selector.
//!
//! Built lazily on the platform backend; racing first callers all get
//! the same instance. The instance is replaceable and resettable, and an
//! old instance is always stopped before a new one becomes visible.

use std::sync::Mutex;

use crate::cfg::SelectorConfig;
use crate::error::Error;
use crate::io::sys::platform_backend;
use crate::lock;
use crate::selector::Selector;

static DEFAULT: Mutex<Option<Selector>> = Mutex::new(None);

/// The shared default selector, started on first use.
///
/// A stopped default (someone called [`Selector::stop`] on a clone, or
/// [`reset_default_selector`]) is replaced by a fresh one on the next
/// call.
pub fn default_selector() -> Result<Selector, Error> {
    let mut slot = lock(&DEFAULT);
    if let Some(selector) = slot.as_ref() {
        if selector.is_running() {
            return Ok(selector.clone());
        }
    }
    let selector = Selector::new(platform_backend()?, SelectorConfig::default());
    selector.run()?;
    tracing::debug!("default selector up on {}", selector.backend_name());
    *slot = Some(selector.clone());
    Ok(selector)
}

/// Swaps the default selector for the one `build` produces. The old
/// instance is stopped first, and nobody observes the new one before it
/// is running.
pub fn replace_default_selector<F>(build: F) -> Result<Selector, Error>
where
    F: FnOnce() -> Result<Selector, Error>,
{
    let mut slot = lock(&DEFAULT);
    if let Some(old) = slot.take() {
        old.stop();
    }
    let selector = build()?;
    selector.run()?;
    *slot = Some(selector.clone());
    Ok(selector)
}

/// Stops and forgets the default selector. The next
/// [`default_selector`] call builds a fresh one.
pub fn reset_default_selector() {
    let mut slot = lock(&DEFAULT);
    if let Some(old) = slot.take() {
        old.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::unistd;

    use super::*;
    use crate::cfg::SelectorConfig;
    use crate::conn::Connection;
    use crate::controller::Controller;
    use crate::io::sys::poll_backend;
    use crate::testing;

    // one test drives the whole lifecycle: the default is process-wide
    // state, and parallel test threads must not fight over it
    #[test]
    fn test_default_selector_lifecycle() {
        testing::init_tracing();
        reset_default_selector();

        // racing callers share one instance
        let first = default_selector().unwrap();
        let second = default_selector().unwrap();
        let (a, _keep) = Connection::pair().unwrap();
        let listener = testing::Recording::new();
        first.add(a, listener.clone()).unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            second.len() == 1
        }));

        // a controller opened with no selector lands on the default
        let (local, remote) = Connection::pair().unwrap();
        let ctrl = Controller::open(local, None).unwrap();
        let recipient = testing::Recording::new();
        ctrl.set_listener(recipient.clone());
        assert!(testing::wait_until(Duration::from_secs(2), || {
            first.len() == 2
        }));
        unistd::write(&remote, b"via default").unwrap();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            recipient.read_bytes() == b"via default"
        }));

        // replacement stops the old instance before the new one shows
        let replaced = replace_default_selector(|| {
            let cfg = SelectorConfig::default().with_poll_timeout(Duration::from_millis(5));
            Ok(Selector::new(poll_backend()?, cfg))
        })
        .unwrap();
        assert!(!first.is_running());
        assert!(replaced.is_running());
        let through = default_selector().unwrap();
        assert!(through.is_running());
        assert_eq!(through.len(), 0);

        // the controller's selector died with the swap; it can still be
        // closed without anyone panicking
        ctrl.close();
        assert!(testing::wait_until(Duration::from_secs(2), || {
            ctrl.is_closed()
        }));

        reset_default_selector();
        assert!(!replaced.is_running());
    }
}
