//! Bounded concurrent execution of independent work items.
//!
//! Three policies share one primitive (launch a worker task, drain its
//! result):
//!
//! - [`Policy::Sequential`] runs one item at a time and stops at the first
//!   failure.
//! - [`Policy::Unbounded`] launches everything at once.
//! - [`Policy::SlidingWindow`] keeps exactly `batch_size` workers in flight,
//!   launching the next item each time one finishes.
//!
//! Every item yields exactly one [`ItemResult`]; items that never ran are
//! reported as [`Error::Cancelled`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::stats::{ScanCounters, ScanSnapshot};

/// One independently schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<P> {
    /// Caller-assigned id, expected to be unique within one run.
    pub id: u64,
    /// Opaque input handed to the worker.
    pub payload: P,
}

impl<P> WorkItem<P> {
    /// Creates a work item.
    pub const fn new(id: u64, payload: P) -> Self {
        Self { id, payload }
    }
}

/// Outcome of one work item.
#[derive(Debug, Clone)]
pub struct ItemResult<T> {
    /// Id of the item this result belongs to.
    pub id: u64,
    /// Value or classified error.
    pub result: Result<T>,
}

/// Concurrency policy of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// One item at a time, in order; the first failure stops dispatch.
    Sequential,
    /// All items launched immediately; results arrive in completion order.
    Unbounded,
    /// At most `batch_size` items in flight, refilled on each completion.
    SlidingWindow {
        /// Concurrency ceiling.
        batch_size: usize,
    },
}

/// Decrements the in-flight counter when the worker ends, even if aborted.
struct InFlightGuard {
    counters: Arc<ScanCounters>,
    success: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counters.on_completed(self.success);
    }
}

async fn invoke<P, T, W, Fut>(
    counters: Arc<ScanCounters>,
    worker: Arc<W>,
    item: WorkItem<P>,
    token: CancellationToken,
) -> (u64, Result<T>)
where
    W: Fn(WorkItem<P>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let id = item.id;
    counters.on_scheduled();
    let mut guard = InFlightGuard {
        counters,
        success: false,
    };
    let result = if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        (*worker)(item, token).await
    };
    guard.success = result.is_ok();
    (id, result)
}

/// Maps a failed join to the error reported for its item.
fn join_error(id: u64, err: &JoinError) -> Error {
    if err.is_cancelled() {
        Error::Cancelled
    } else {
        log::error!("Worker for item {id} panicked: {err}");
        Error::Download(format!("worker for item {id} panicked"))
    }
}

/// Runs work items under a [`Policy`] within one cancellable session.
#[derive(Debug)]
pub struct Scheduler {
    policy: Policy,
    counters: Arc<ScanCounters>,
    token: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler with its own session token.
    #[must_use]
    pub fn new(policy: Policy) -> Self {
        Self::with_token(policy, CancellationToken::new())
    }

    /// Creates a scheduler whose session is a child of `parent`.
    #[must_use]
    pub fn with_token(policy: Policy, parent: CancellationToken) -> Self {
        Self {
            policy,
            counters: Arc::new(ScanCounters::new()),
            token: parent.child_token(),
        }
    }

    /// Creates a sliding-window scheduler sized from `config`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(Policy::SlidingWindow {
            batch_size: config.effective_batch_size(),
        })
    }

    /// Returns the policy in use.
    #[must_use]
    pub const fn policy(&self) -> Policy {
        self.policy
    }

    /// Returns the session token. Workers receive children of it.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels the session and, with it, every worker it spawned.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the counters of the current or most recent run.
    #[must_use]
    pub fn stats(&self) -> ScanSnapshot {
        self.counters.snapshot()
    }

    /// Runs every item through `worker` and returns one result per item.
    ///
    /// Workers run as spawned tasks and each receives a child of the session
    /// token. A failing item never aborts its siblings except under
    /// [`Policy::Sequential`].
    ///
    /// Counters start from zero on every call, so runs on one scheduler
    /// should not overlap.
    pub async fn run<P, T, W, Fut>(&self, items: Vec<WorkItem<P>>, worker: W) -> Vec<ItemResult<T>>
    where
        P: Send + 'static,
        T: Send + 'static,
        W: Fn(WorkItem<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let worker = Arc::new(worker);
        self.counters.reset();
        log::debug!("Running {} item(s) with {:?}", items.len(), self.policy);
        match self.policy {
            Policy::Sequential => self.run_sequential(items, &worker).await,
            Policy::Unbounded => {
                let window = items.len();
                self.run_windowed(items, &worker, window).await
            }
            Policy::SlidingWindow { batch_size } => {
                self.run_windowed(items, &worker, batch_size).await
            }
        }
    }

    fn spawn_args<W>(&self, worker: &Arc<W>) -> (Arc<ScanCounters>, Arc<W>, CancellationToken) {
        self.counters.on_launched();
        (
            Arc::clone(&self.counters),
            Arc::clone(worker),
            self.token.child_token(),
        )
    }

    async fn run_sequential<P, T, W, Fut>(
        &self,
        items: Vec<WorkItem<P>>,
        worker: &Arc<W>,
    ) -> Vec<ItemResult<T>>
    where
        P: Send + 'static,
        T: Send + 'static,
        W: Fn(WorkItem<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut results = Vec::with_capacity(items.len());
        let mut items = items.into_iter();

        for item in items.by_ref() {
            let id = item.id;
            if self.token.is_cancelled() {
                results.push(ItemResult {
                    id,
                    result: Err(Error::Cancelled),
                });
                break;
            }

            let (counters, worker, token) = self.spawn_args(worker);
            let handle = tokio::spawn(invoke(counters, worker, item, token));
            let result = self.join_one(id, handle).await;
            let failed = result.is_err();
            results.push(ItemResult { id, result });
            if failed {
                log::debug!("Item {id} failed, stopping sequential run");
                break;
            }
        }

        results.extend(items.map(|item| ItemResult {
            id: item.id,
            result: Err(Error::Cancelled),
        }));
        results
    }

    fn launch<P, T, W, Fut>(
        &self,
        join_set: &mut JoinSet<(u64, Result<T>)>,
        worker: &Arc<W>,
        item: WorkItem<P>,
    ) where
        P: Send + 'static,
        T: Send + 'static,
        W: Fn(WorkItem<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (counters, worker, token) = self.spawn_args(worker);
        join_set.spawn(invoke(counters, worker, item, token));
    }

    async fn join_one<T>(&self, id: u64, mut handle: JoinHandle<(u64, Result<T>)>) -> Result<T> {
        tokio::select! {
            joined = &mut handle => match joined {
                Ok((_, result)) => result,
                Err(e) => Err(join_error(id, &e)),
            },
            () = self.token.cancelled() => {
                handle.abort();
                let _ = handle.await;
                Err(Error::Cancelled)
            }
        }
    }

    async fn run_windowed<P, T, W, Fut>(
        &self,
        items: Vec<WorkItem<P>>,
        worker: &Arc<W>,
        window: usize,
    ) -> Vec<ItemResult<T>>
    where
        P: Send + 'static,
        T: Send + 'static,
        W: Fn(WorkItem<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut results = Vec::with_capacity(items.len());
        let mut pending = items.into_iter();
        let mut outstanding = HashSet::new();
        let mut join_set = JoinSet::new();

        for item in pending.by_ref().take(window.max(1)) {
            outstanding.insert(item.id);
            self.launch(&mut join_set, worker, item);
        }

        loop {
            let joined = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((id, result)) => {
                    outstanding.remove(&id);
                    results.push(ItemResult { id, result });
                }
                Err(e) => log::error!("Worker task failed: {e}"),
            }

            if let Some(item) = pending.next() {
                outstanding.insert(item.id);
                self.launch(&mut join_set, worker, item);
            }
        }

        if self.token.is_cancelled() {
            join_set.abort_all();
        }
        while let Some(joined) = join_set.join_next().await {
            if let Ok((id, result)) = joined {
                outstanding.remove(&id);
                results.push(ItemResult { id, result });
            }
        }

        let cancelled = self.token.is_cancelled();
        results.extend(outstanding.into_iter().map(|id| ItemResult {
            id,
            result: Err(if cancelled {
                Error::Cancelled
            } else {
                Error::Download(format!("worker for item {id} panicked"))
            }),
        }));
        results.extend(pending.map(|item| ItemResult {
            id: item.id,
            result: Err(Error::Cancelled),
        }));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn items(n: u64) -> Vec<WorkItem<u64>> {
        (0..n).map(|i| WorkItem::new(i, i * 10)).collect()
    }

    fn sorted<T>(mut results: Vec<ItemResult<T>>) -> Vec<ItemResult<T>> {
        results.sort_by_key(|r| r.id);
        results
    }

    /// Polls `f` until it holds, sleeping briefly between attempts.
    async fn wait_until(f: impl Fn() -> bool) {
        for _ in 0..5_000 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn sequential_preserves_order() {
        let scheduler = Scheduler::new(Policy::Sequential);
        let results = scheduler
            .run(items(5), |item, _| async move { Ok(item.payload + 1) })
            .await;

        let ids: Vec<_> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(*results[4].result.as_ref().unwrap(), 41);
        assert_eq!(scheduler.stats().peak_in_flight, 1);
    }

    #[tokio::test]
    async fn sequential_stops_at_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let scheduler = Scheduler::new(Policy::Sequential);
        let results = scheduler
            .run(items(5), move |item, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if item.id == 2 {
                        Err(Error::Transport { status: 500 })
                    } else {
                        Ok(item.id)
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 5);
        assert!(matches!(results[2].result, Err(Error::Transport { status: 500 })));
        assert!(results[3].result.as_ref().unwrap_err().is_cancelled());
        assert!(results[4].result.as_ref().unwrap_err().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_interrupts_a_sequential_run() {
        let scheduler = Arc::new(Scheduler::new(Policy::Sequential));

        let run = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .run(items(5), |item, _token| async move {
                        if item.id == 1 {
                            // Ignores its token; only an abort ends it.
                            futures::future::pending::<()>().await;
                        }
                        Ok(item.id)
                    })
                    .await
            })
        };

        wait_until(|| {
            let stats = scheduler.stats();
            stats.launched == 2 && stats.scheduled == 1
        })
        .await;
        scheduler.cancel();
        let results = run.await.unwrap();

        let ids: Vec<_> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(*results[0].result.as_ref().unwrap(), 0);
        assert!(results[1..].iter().all(|r| r.result.as_ref().unwrap_err().is_cancelled()));
        let stats = scheduler.stats();
        assert_eq!(stats.launched, 2);
        assert_eq!(stats.scheduled, 0);
    }

    #[tokio::test]
    async fn stats_cover_the_latest_run_only() {
        let scheduler = Scheduler::new(Policy::SlidingWindow { batch_size: 2 });
        scheduler
            .run(items(6), |item, _| async move { Ok(item.id) })
            .await;
        assert_eq!(scheduler.stats().completed, 6);

        scheduler
            .run(items(3), |item, _| async move {
                if item.id == 0 {
                    Err(Error::Transport { status: 500 })
                } else {
                    Ok(item.id)
                }
            })
            .await;
        let stats = scheduler.stats();
        assert_eq!(stats.launched, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unbounded_launches_everything_at_once() {
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = Arc::new(Scheduler::new(Policy::Unbounded));

        let run = {
            let scheduler = Arc::clone(&scheduler);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                scheduler
                    .run(items(8), move |item, _| {
                        let gate = Arc::clone(&gate);
                        async move {
                            let _permit = gate.acquire().await;
                            Ok(item.id)
                        }
                    })
                    .await
            })
        };

        wait_until(|| scheduler.stats().scheduled == 8).await;
        gate.add_permits(8);
        let results = sorted(run.await.unwrap());
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.result.is_ok()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sliding_window_refills_one_per_completion() {
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = Arc::new(Scheduler::new(Policy::SlidingWindow { batch_size: 4 }));

        let run = {
            let scheduler = Arc::clone(&scheduler);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                scheduler
                    .run(items(20), move |item, _| {
                        let gate = Arc::clone(&gate);
                        async move {
                            if let Ok(permit) = gate.acquire().await {
                                permit.forget();
                            }
                            Ok(item.id)
                        }
                    })
                    .await
            })
        };

        wait_until(|| scheduler.stats().scheduled == 4).await;
        assert_eq!(scheduler.stats().launched, 4);

        gate.add_permits(1);
        wait_until(|| scheduler.stats().completed == 1).await;
        wait_until(|| scheduler.stats().launched == 5).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.stats().launched, 5);

        gate.add_permits(19);
        let results = sorted(run.await.unwrap());

        let stats = scheduler.stats();
        assert_eq!(stats.launched, 20);
        assert_eq!(stats.completed, 20);
        assert_eq!(stats.scheduled, 0);
        assert!(stats.peak_in_flight <= 4);
        let ids: Vec<_> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failures_do_not_abort_siblings() {
        let scheduler = Scheduler::new(Policy::SlidingWindow { batch_size: 3 });
        let results = sorted(
            scheduler
                .run(items(10), |item, _| async move {
                    tokio::time::sleep(Duration::from_millis(item.id % 3)).await;
                    if item.id % 10 == 9 {
                        Err(Error::Corrupt(format!("item {}", item.id)))
                    } else {
                        Ok(item.id)
                    }
                })
                .await,
        );

        assert_eq!(results.len(), 10);
        assert!(matches!(results[9].result, Err(Error::Corrupt(_))));
        assert_eq!(results.iter().filter(|r| r.result.is_ok()).count(), 9);
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_worker_is_reported_for_its_item_only() {
        let scheduler = Scheduler::new(Policy::SlidingWindow { batch_size: 2 });
        let results = sorted(
            scheduler
                .run(items(4), |item, _| async move {
                    assert_ne!(item.id, 1, "boom");
                    Ok(item.id)
                })
                .await,
        );

        assert_eq!(results.len(), 4);
        assert!(matches!(results[1].result, Err(Error::Download(_))));
        assert!(results.iter().filter(|r| r.id != 1).all(|r| r.result.is_ok()));
        assert_eq!(scheduler.stats().scheduled, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_reaches_every_worker() {
        let scheduler = Arc::new(Scheduler::new(Policy::SlidingWindow { batch_size: 3 }));
        let observed = Arc::new(AtomicUsize::new(0));

        let run = {
            let scheduler = Arc::clone(&scheduler);
            let observed = Arc::clone(&observed);
            tokio::spawn(async move {
                scheduler
                    .run(items(10), move |_item, token| {
                        let observed = Arc::clone(&observed);
                        async move {
                            token.cancelled().await;
                            observed.fetch_add(1, Ordering::SeqCst);
                            Err::<u64, _>(Error::Cancelled)
                        }
                    })
                    .await
            })
        };

        wait_until(|| scheduler.stats().scheduled == 3).await;
        scheduler.cancel();
        let results = run.await.unwrap();

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.result.as_ref().unwrap_err().is_cancelled()));
        assert_eq!(scheduler.stats().launched, 3);
        assert_eq!(scheduler.stats().scheduled, 0);
    }

    #[tokio::test]
    async fn parent_token_cancels_session() {
        let parent = CancellationToken::new();
        let scheduler = Scheduler::with_token(Policy::Unbounded, parent.clone());
        parent.cancel();
        assert!(scheduler.token().is_cancelled());

        let results = scheduler
            .run(items(3), |item, _| async move { Ok(item.id) })
            .await;
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn from_config_uses_effective_batch_size() {
        let config = EngineConfig::default().with_batch_size(0);
        assert_eq!(
            Scheduler::from_config(&config).policy(),
            Policy::SlidingWindow { batch_size: 4 }
        );
        let config = EngineConfig::default().with_batch_size(9);
        assert_eq!(
            Scheduler::from_config(&config).policy(),
            Policy::SlidingWindow { batch_size: 9 }
        );
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        for policy in [
            Policy::Sequential,
            Policy::Unbounded,
            Policy::SlidingWindow { batch_size: 4 },
        ] {
            let scheduler = Scheduler::new(policy);
            let results = scheduler
                .run(Vec::<WorkItem<()>>::new(), |_, _| async { Ok(()) })
                .await;
            assert!(results.is_empty());
            assert_eq!(scheduler.stats().launched, 0);
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn sliding_window_launches_each_item_once(n in 0u64..40, batch in 1usize..8) {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(4)
                    .enable_all()
                    .build()
                    .unwrap();
                let (results, stats) = runtime.block_on(async {
                    let scheduler = Scheduler::new(Policy::SlidingWindow { batch_size: batch });
                    let results = scheduler
                        .run(items(n), |item, _| async move {
                            tokio::task::yield_now().await;
                            Ok(item.id)
                        })
                        .await;
                    (results, scheduler.stats())
                });

                prop_assert_eq!(results.len() as u64, n);
                prop_assert_eq!(stats.launched as u64, n);
                prop_assert_eq!(stats.completed as u64, n);
                prop_assert!(stats.peak_in_flight <= batch);
                let mut ids: Vec<_> = results.iter().map(|r| r.id).collect();
                ids.sort_unstable();
                prop_assert_eq!(ids, (0..n).collect::<Vec<_>>());
            }
        }
    }
}
