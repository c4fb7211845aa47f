//! Live counters of a scheduling session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Point-in-time view of [`ScanCounters`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSnapshot {
    /// Workers launched so far.
    pub launched: usize,
    /// Workers currently running.
    pub scheduled: usize,
    /// Workers finished, successfully or not.
    pub completed: usize,
    /// Workers that finished with an error.
    pub failed: usize,
    /// Highest number of workers ever running at once.
    pub peak_in_flight: usize,
    /// Completions per second since the counters were last reset.
    pub count_per_second: f64,
}

/// Counters updated by every worker invocation.
///
/// Lock-free; each field is an independent atomic so observers may see
/// counters from slightly different instants.
#[derive(Debug)]
pub struct ScanCounters {
    started: Mutex<Instant>,
    launched: AtomicUsize,
    scheduled: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for ScanCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanCounters {
    /// Creates zeroed counters with the clock starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Instant::now()),
            launched: AtomicUsize::new(0),
            scheduled: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Zeroes every counter and restarts the clock.
    ///
    /// Must not race with workers still reporting into the counters.
    pub fn reset(&self) {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        for counter in [
            &self.launched,
            &self.scheduled,
            &self.completed,
            &self.failed,
            &self.peak_in_flight,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Records that a worker was handed to the runtime.
    pub fn on_launched(&self) {
        self.launched.fetch_add(1, Ordering::SeqCst);
    }

    /// Records that a worker started running.
    pub fn on_scheduled(&self) {
        let now = self.scheduled.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    /// Records that a worker finished.
    pub fn on_completed(&self, success: bool) {
        self.scheduled.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        if !success {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Time since the counters were created or last reset.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Returns the current counter values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> ScanSnapshot {
        let completed = self.completed.load(Ordering::SeqCst);
        let secs = self.elapsed().as_secs_f64();
        ScanSnapshot {
            launched: self.launched.load(Ordering::SeqCst),
            scheduled: self.scheduled.load(Ordering::SeqCst),
            completed,
            failed: self.failed.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            count_per_second: if secs > 0.0 {
                completed as f64 / secs
            } else {
                0.0
            },
        }
    }
}
