//! Cooperative cancellation.
//!
//! A [`StopSource`] owns a one-shot stop signal; [`StopToken`] clones are
//! handed to provider calls and background loops, which poll
//! [`StopToken::is_stopped`] or park in [`StopToken::wait_for`]. Stops are
//! monotonic: once fired a source never resets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

/// Owning side of a stop signal.
#[derive(Clone, Debug, Default)]
pub struct StopSource {
    shared: Arc<Shared>,
}

/// Pollable side of a stop signal.
#[derive(Clone, Debug)]
pub struct StopToken {
    shared: Arc<Shared>,
}

impl StopSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fire the signal and wake every parked waiter.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _guard = self.shared.lock.lock();
        self.shared.signal.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`, returning early (true) if stopped.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut guard = self.shared.lock.lock();
        if self.is_stopped() {
            return true;
        }
        self.shared.signal.wait_for(&mut guard, timeout);
        self.is_stopped()
    }
}

#[cfg(test)]
mod test {
    use super::StopSource;
    use std::time::Duration;

    #[test]
    fn token_observes_stop() {
        let source = StopSource::new();
        let token = source.token();
        assert!(!token.is_stopped());
        source.stop();
        assert!(token.is_stopped());
        assert!(source.is_stopped());
    }

    #[test]
    fn wait_returns_early_on_stop() {
        let source = StopSource::new();
        let token = source.token();
        let handle = std::thread::spawn(move || token.wait_for(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        source.stop();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_times_out_without_stop() {
        let source = StopSource::new();
        assert!(!source.token().wait_for(Duration::from_millis(10)));
    }
}
