//! Serial work queues
//!
//! Each queue owns one worker thread and runs submitted jobs in order.
//! Synchronous submission from the queue's own thread runs inline (the
//! queue-key check), so code that is already on the image-processing queue
//! can call helpers that also serialize on it without deadlocking.

use log::warn;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

static NEXT_QUEUE_KEY: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_QUEUE_KEY: Cell<usize> = const { Cell::new(0) };
}

struct QueueShared {
    label: &'static str,
    key: usize,
    sender: Mutex<Option<Sender<Job>>>,
}

/// A serial queue backed by one dedicated worker thread.
///
/// Cloning shares the queue. Dropping the last handle closes the job
/// channel and lets the worker drain and exit.
#[derive(Clone)]
pub struct SerialQueue {
    shared: Arc<QueueShared>,
}

impl SerialQueue {
    pub fn new(label: &'static str) -> Self {
        let key = NEXT_QUEUE_KEY.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = channel::<Job>();

        let builder = thread::Builder::new().name(label.to_string());
        let spawn_result = builder.spawn(move || {
            CURRENT_QUEUE_KEY.with(|current| current.set(key));
            while let Ok(job) = receiver.recv() {
                job();
            }
        });
        if let Err(error) = spawn_result {
            warn!("SerialQueue[{}]: worker spawn failed: {}", label, error);
        }

        Self {
            shared: Arc::new(QueueShared {
                label,
                key,
                sender: Mutex::new(Some(sender)),
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        self.shared.label
    }

    /// Whether the calling thread is this queue's worker.
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE_KEY.with(|current| current.get()) == self.shared.key
    }

    /// Submit a job without waiting for it.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            job();
            return;
        }
        let sender = self.shared.sender.lock().unwrap();
        match sender.as_ref().map(|s| s.send(Box::new(job))) {
            Some(Ok(())) => {}
            _ => warn!("SerialQueue[{}]: job dropped after shutdown", self.shared.label),
        }
    }

    /// Submit a job and block until it has run, returning its result.
    ///
    /// Runs inline when already on the queue; this is the re-entrancy
    /// escape that keeps nested serialized calls from deadlocking.
    pub fn run_sync<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> R {
        if self.is_current() {
            return job();
        }
        let (result_tx, result_rx) = channel();
        self.enqueue(move || {
            // Receiver may have given up; nothing to do about it here.
            let _ = result_tx.send(job());
        });
        match result_rx.recv() {
            Ok(result) => result,
            Err(_) => panic!(
                "SerialQueue[{}]: worker gone while a sync job was pending",
                self.shared.label
            ),
        }
    }

    /// Stop accepting jobs. Already-queued jobs still run.
    pub fn shutdown(&self) {
        self.shared.sender.lock().unwrap().take();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.shared.label)
            .field("key", &self.shared.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let queue = SerialQueue::new("test-order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let seen = Arc::clone(&seen);
            queue.enqueue(move || seen.lock().unwrap().push(i));
        }
        let done: Vec<i32> = queue.run_sync({
            let seen = Arc::clone(&seen);
            move || seen.lock().unwrap().clone()
        });
        assert_eq!(done, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_sync_returns_value() {
        let queue = SerialQueue::new("test-sync");
        let answer = queue.run_sync(|| 6 * 7);
        assert_eq!(answer, 42);
    }

    #[test]
    fn test_reentrant_sync_runs_inline() {
        let queue = SerialQueue::new("test-reentrant");
        let inner = queue.clone();
        // Without the queue-key check this would deadlock.
        let nested = queue.run_sync(move || inner.run_sync(|| 5));
        assert_eq!(nested, 5);
    }

    #[test]
    fn test_is_current_only_on_worker() {
        let queue = SerialQueue::new("test-current");
        assert!(!queue.is_current());
        let observed = queue.run_sync({
            let queue = queue.clone();
            move || queue.is_current()
        });
        assert!(observed);
    }

    #[test]
    fn test_shutdown_drains_pending_jobs() {
        let queue = SerialQueue::new("test-shutdown");
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            queue.enqueue(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.shutdown();
        // Worker drains what was queued before shutdown.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
