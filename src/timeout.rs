//! Racing an operation against a deadline with exactly-once resolution.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Maximum time a guarded operation may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    duration_nanos: u64,
}

impl Deadline {
    /// Creates a deadline from nanoseconds.
    #[must_use]
    pub const fn from_nanos(duration_nanos: u64) -> Self {
        Self { duration_nanos }
    }

    /// Creates a deadline from a duration, saturating at `u64::MAX` nanos.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        Self::from_nanos(duration.as_nanos().try_into().unwrap_or(u64::MAX))
    }

    /// Returns the deadline as a duration.
    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

/// Single-assignment result slot shared by the racers.
type Slot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T>>>>>;

/// Fills the slot if nobody has yet. Returns whether this call won.
fn resolve<T>(slot: &Slot<T>, result: Result<T>) -> bool {
    let sender = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    sender.is_some_and(|tx| tx.send(result).is_ok())
}

/// An operation raced against a timer.
///
/// Both racers run as spawned tasks. Whichever finishes first fills the
/// result slot; the other's completion is a no-op. After a timeout the
/// operation is abandoned but keeps running unless it watches its own
/// cancellation signal. The timer stops as soon as the task resolves some
/// other way, or when the task is dropped.
#[derive(Debug)]
pub struct TimeoutTask<T> {
    slot: Slot<T>,
    rx: tokio::sync::Mutex<Option<oneshot::Receiver<Result<T>>>>,
    timer: JoinHandle<()>,
}

impl<T: Send + 'static> TimeoutTask<T> {
    /// Starts `operation` and a timer for `deadline`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F>(deadline: impl Into<Deadline>, operation: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let deadline = deadline.into();
        let (tx, rx) = oneshot::channel();
        let slot: Slot<T> = Arc::new(Mutex::new(Some(tx)));

        let timer_slot = Arc::clone(&slot);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline.as_duration()).await;
            if resolve(&timer_slot, Err(Error::Timeout)) {
                log::debug!("Operation timed out after {:?}", deadline.as_duration());
            }
        });

        let op_slot = Arc::clone(&slot);
        let stop_timer = timer.abort_handle();
        tokio::spawn(async move {
            let result = operation.await;
            if resolve(&op_slot, result) {
                stop_timer.abort();
            }
        });

        Self {
            slot,
            rx: tokio::sync::Mutex::new(Some(rx)),
            timer,
        }
    }

    /// Resolves a pending wait with [`Error::Cancelled`], including a
    /// [`value`](Self::value) call already waiting in another task.
    ///
    /// Has no effect if the task already resolved.
    pub fn cancel(&self) {
        if resolve(&self.slot, Err(Error::Cancelled)) {
            self.timer.abort();
        }
    }

    /// Waits for whichever racer finished first.
    ///
    /// The result is handed out once; later calls return
    /// [`Error::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the deadline won, [`Error::Cancelled`]
    /// if [`cancel`](Self::cancel) won, or the operation's own error.
    pub async fn value(&self) -> Result<T> {
        let mut rx = self.rx.lock().await;
        let Some(pending) = rx.as_mut() else {
            return Err(Error::Cancelled);
        };
        let result = pending.await.unwrap_or(Err(Error::Cancelled));
        *rx = None;
        result
    }
}

impl<T> Drop for TimeoutTask<T> {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Runs `operation` under `deadline`.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the deadline elapses first, otherwise the
/// operation's own result.
pub async fn run_with_deadline<T, F>(deadline: impl Into<Deadline>, operation: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    TimeoutTask::new(deadline, operation).value().await
}
