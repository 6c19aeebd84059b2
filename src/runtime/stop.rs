//! Cooperative stop signal for pipeline threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// A cancellation flag that threads can poll or block on.
///
/// Cloning shares the same signal. `cancel` is sticky: once raised, every
/// current and future wait returns immediately.
#[derive(Debug, Default)]
pub struct StopSignal {
    shared: Arc<SharedState>,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Release);

        // Wake every thread parked on the condition variable.
        let _guard = self.shared.mutex.lock().unwrap();
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Block until cancelled.
    pub fn wait_cancellation(&self) {
        let mut guard = self.shared.mutex.lock().unwrap();
        while !self.cancelled() {
            guard = self.shared.condvar.wait(guard).unwrap();
        }
    }

    /// Block until cancelled or `timeout` elapses. Returns whether the
    /// signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.shared.mutex.lock().unwrap();
        if self.cancelled() {
            return true;
        }
        let (_guard, _result) = self.shared.condvar.wait_timeout(guard, timeout).unwrap();
        self.cancelled()
    }
}

impl Clone for StopSignal {
    fn clone(&self) -> StopSignal {
        StopSignal {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_is_sticky() {
        let signal = StopSignal::new();
        assert!(!signal.cancelled());
        signal.cancel();
        assert!(signal.cancelled());
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wakes_blocked_thread() {
        let signal = StopSignal::new();
        let observer = signal.clone();
        let handle = thread::spawn(move || {
            observer.wait_cancellation();
            true
        });
        thread::sleep(Duration::from_millis(20));
        signal.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_timeout_without_cancel() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
    }
}
