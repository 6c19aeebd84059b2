//! Display refresh sources
//!
//! The player's tap runs once per vertical blank. Hosts with a native
//! vsync callback adapt it to [`DisplayLink`]; everyone else (including
//! the tests) uses [`IntervalDisplayLink`], a thread that fires at a fixed
//! rate and keeps its cadence by sleeping only the remainder of each
//! period.

use log::info;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::runtime::stop::StopSignal;

/// A source of display-refresh ticks.
pub trait DisplayLink: Send {
    /// Begin firing `callback` once per refresh until stopped.
    fn start(&mut self, callback: Box<dyn FnMut() + Send>);

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Timer-driven refresh source.
pub struct IntervalDisplayLink {
    period: Duration,
    stop: Option<StopSignal>,
    worker: Option<JoinHandle<()>>,
}

impl IntervalDisplayLink {
    pub fn new(refresh_rate: f64) -> Self {
        let refresh_rate = refresh_rate.max(1.0);
        Self {
            period: Duration::from_secs_f64(1.0 / refresh_rate),
            stop: None,
            worker: None,
        }
    }
}

impl DisplayLink for IntervalDisplayLink {
    fn start(&mut self, mut callback: Box<dyn FnMut() + Send>) {
        if self.worker.is_some() {
            return;
        }
        let stop = StopSignal::new();
        let observer = stop.clone();
        let period = self.period;
        let worker = thread::Builder::new()
            .name("reelflow-display-link".into())
            .spawn(move || {
                info!("display link started at {:?} period", period);
                loop {
                    if observer.cancelled() {
                        break;
                    }
                    let tick_start = Instant::now();
                    callback();
                    let remaining = period.saturating_sub(tick_start.elapsed());
                    if !remaining.is_zero() && observer.wait_timeout(remaining) {
                        break;
                    }
                }
                info!("display link stopped");
            })
            .expect("failed to spawn display link thread");
        self.stop = Some(stop);
        self.worker = Some(worker);
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for IntervalDisplayLink {
    fn drop(&mut self) {
        DisplayLink::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fires_repeatedly_until_stopped() {
        let counter = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&counter);

        let mut link = IntervalDisplayLink::new(200.0);
        link.start(Box::new(move || {
            observed.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(link.is_running());

        thread::sleep(Duration::from_millis(60));
        link.stop();
        assert!(!link.is_running());

        let fired = counter.load(Ordering::Relaxed);
        assert!(fired >= 3, "only {} ticks fired", fired);

        // No more ticks after stop.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::Relaxed), fired);
    }

    #[test]
    fn test_double_start_is_ignored() {
        let mut link = IntervalDisplayLink::new(100.0);
        link.start(Box::new(|| {}));
        link.start(Box::new(|| panic!("second callback must not run")));
        thread::sleep(Duration::from_millis(30));
        link.stop();
    }
}
