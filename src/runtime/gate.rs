//! Condition-variable gate for reader back-pressure
//!
//! The synchronized pacing mode blocks the reader thread whenever the
//! writer reports that neither of its inputs will accept more data. The
//! gate is a condition-variable-guarded boolean: the writer side flips
//! `should_wait` under the lock and signals; the reader side parks on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::stop::StopSignal;

/// Shared wait flag between one producer and the component applying
/// back-pressure.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    should_wait: Mutex<bool>,
    condvar: Condvar,
    times_blocked: AtomicU64,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the wait flag. Clearing it wakes every parked waiter.
    pub fn set_should_wait(&self, wait: bool) {
        let mut flag = self.should_wait.lock().unwrap();
        if *flag != wait {
            *flag = wait;
            if !wait {
                self.condvar.notify_all();
            }
        }
    }

    pub fn should_wait(&self) -> bool {
        *self.should_wait.lock().unwrap()
    }

    /// Park until the flag clears, cancellation is raised, or each
    /// `recheck_interval` elapses (the caller re-evaluates readiness and
    /// comes back). Returns `true` if the gate actually blocked.
    pub fn wait_while_blocked(&self, stop: &StopSignal, recheck_interval: Duration) -> bool {
        let mut blocked = false;
        let mut flag = self.should_wait.lock().unwrap();
        while *flag && !stop.cancelled() {
            if !blocked {
                blocked = true;
                self.times_blocked.fetch_add(1, Ordering::Relaxed);
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(flag, recheck_interval)
                .unwrap();
            flag = guard;
            if result.timed_out() {
                // Give the caller a turn to refresh writer readiness.
                break;
            }
        }
        blocked
    }

    /// How many times a waiter actually parked on this gate.
    pub fn times_blocked(&self) -> u64 {
        self.times_blocked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_clear_flag_passes_through() {
        let gate = ReadinessGate::new();
        let stop = StopSignal::new();
        assert!(!gate.wait_while_blocked(&stop, Duration::from_millis(50)));
        assert_eq!(gate.times_blocked(), 0);
    }

    #[test]
    fn test_blocked_waiter_released_by_clear() {
        let gate = Arc::new(ReadinessGate::new());
        gate.set_should_wait(true);

        let waiter_gate = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            let stop = StopSignal::new();
            waiter_gate.wait_while_blocked(&stop, Duration::from_secs(5))
        });

        thread::sleep(Duration::from_millis(20));
        gate.set_should_wait(false);
        assert!(handle.join().unwrap());
        assert_eq!(gate.times_blocked(), 1);
    }

    #[test]
    fn test_cancelled_signal_never_parks() {
        let gate = ReadinessGate::new();
        gate.set_should_wait(true);
        let stop = StopSignal::new();
        stop.cancel();
        assert!(!gate.wait_while_blocked(&stop, Duration::from_secs(5)));
    }

    #[test]
    fn test_recheck_interval_returns_control() {
        // A caller loops around the gate so it can refresh writer
        // readiness; each timed-out park returns instead of spinning.
        let gate = Arc::new(ReadinessGate::new());
        gate.set_should_wait(true);
        let stop = StopSignal::new();

        let waiter_gate = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            let mut turns = 0;
            while waiter_gate.should_wait() && !stop.cancelled() {
                waiter_gate.wait_while_blocked(&stop, Duration::from_millis(5));
                turns += 1;
                if turns > 200 {
                    break;
                }
            }
            turns
        });

        thread::sleep(Duration::from_millis(30));
        gate.set_should_wait(false);
        let turns = handle.join().unwrap();
        assert!(turns >= 1);
        assert!(gate.times_blocked() >= 1);
    }
}
