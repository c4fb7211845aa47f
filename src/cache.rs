//! Two-tier (memory, then blob store) cache with single-flight loading.
//!
//! A [`CacheCoordinator`] answers `get(key)` from memory, then from its
//! [`BlobStore`], and finally from a [`Loader`]. Concurrent misses on the same
//! key share one in-flight load, and its result, success or failure, is
//! delivered to every waiter. A failed load does not poison the key: the next
//! `get` starts a fresh one.
//!
//! All bookkeeping (memory map, store index, in-flight table) lives behind a
//! single mutex that is never held across I/O. Store writes and removals are
//! serialized by a second, async lock; a load only writes back while it still
//! owns the key's in-flight entry, so `put`, `remove` and `clear` always win
//! over a load they raced with.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::{Error, Result};
use crate::fetch::{Fetcher, fetch_all};
use crate::fs::BlobStore;
use crate::timeout::{Deadline, run_with_deadline};

/// Source of values for keys that are neither in memory nor stored.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Produces the value of `key`.
    async fn load(&self, key: &str) -> Result<Bytes>;
}

/// [`Loader`] that downloads each key from a [`Fetcher`], treating the key as
/// the fetch identifier.
#[derive(Debug)]
pub struct FetchLoader<F> {
    fetcher: Arc<F>,
    deadline: Option<Deadline>,
}

impl<F> FetchLoader<F> {
    /// Wraps a fetcher.
    #[must_use]
    pub const fn new(fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            deadline: None,
        }
    }

    /// Fails loads that take longer than `deadline` with [`Error::Timeout`].
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[async_trait]
impl<F: Fetcher + 'static> Loader for FetchLoader<F> {
    async fn load(&self, key: &str) -> Result<Bytes> {
        let Some(deadline) = self.deadline else {
            return fetch_all(self.fetcher.as_ref(), key).await;
        };
        let fetcher = Arc::clone(&self.fetcher);
        let key = key.to_string();
        run_with_deadline(deadline, async move { fetch_all(fetcher.as_ref(), &key).await }).await
    }
}

/// Hit and miss counters of a [`CacheCoordinator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Gets answered from memory.
    pub memory_hits: u64,
    /// Loads answered by the blob store.
    pub disk_hits: u64,
    /// Loads that had to call the loader.
    pub fetches: u64,
    /// Gets that joined a load already in flight.
    pub joined: u64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    fetches: AtomicU64,
    joined: AtomicU64,
}

type SharedLoad = Shared<BoxFuture<'static, Result<Bytes>>>;

#[derive(Default)]
struct CacheState {
    memory: HashMap<String, Bytes>,
    stored: HashSet<String>,
    /// Loads in flight, tagged with a generation so a settled load only
    /// touches the cache while its own entry is still there.
    in_flight: HashMap<String, (u64, SharedLoad)>,
    next_generation: u64,
}

impl CacheState {
    fn owns(&self, key: &str, generation: u64) -> bool {
        matches!(self.in_flight.get(key), Some((g, _)) if *g == generation)
    }
}

struct Inner {
    store: Arc<dyn BlobStore>,
    loader: Option<Arc<dyn Loader>>,
    state: Mutex<CacheState>,
    /// Held across every store write or removal.
    writes: Arc<tokio::sync::Mutex<()>>,
    counters: Arc<Counters>,
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One in-flight load. It lives inside the in-flight table, so it only keeps
/// a weak reference back to the coordinator.
struct LoadJob {
    owner: Weak<Inner>,
    store: Arc<dyn BlobStore>,
    loader: Option<Arc<dyn Loader>>,
    writes: Arc<tokio::sync::Mutex<()>>,
    counters: Arc<Counters>,
    key: String,
    generation: u64,
}

impl LoadJob {
    fn new(inner: &Arc<Inner>, key: &str, generation: u64) -> Self {
        Self {
            owner: Arc::downgrade(inner),
            store: Arc::clone(&inner.store),
            loader: inner.loader.clone(),
            writes: Arc::clone(&inner.writes),
            counters: Arc::clone(&inner.counters),
            key: key.to_string(),
            generation,
        }
    }

    /// Runs `f` on the cache state, or returns `None` once the coordinator
    /// is gone.
    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> Option<R> {
        let inner = self.owner.upgrade()?;
        let mut state = inner.state();
        Some(f(&mut state))
    }

    fn is_current(&self) -> bool {
        self.with_state(|state| state.owns(&self.key, self.generation))
            .unwrap_or(false)
    }

    /// Loads the value, then promotes it to memory and releases the
    /// in-flight slot unless the key was invalidated meanwhile.
    async fn run(self) -> Result<Bytes> {
        let result = self.load().await;
        self.with_state(|state| {
            if state.owns(&self.key, self.generation) {
                state.in_flight.remove(&self.key);
                if let Ok(data) = &result {
                    state.memory.insert(self.key.clone(), data.clone());
                }
            }
        });
        result
    }

    /// Reads the key from the store if indexed, otherwise from the loader.
    async fn load(&self) -> Result<Bytes> {
        let key = self.key.as_str();
        let indexed = self
            .with_state(|state| state.stored.contains(key))
            .unwrap_or(false);
        if indexed {
            match self.store.read(key).await {
                Ok(data) => {
                    self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Cache disk hit: {key}");
                    return Ok(data);
                }
                Err(Error::NotFound(_)) => {
                    log::warn!("Cache index listed {key} but the store has no such blob");
                    self.with_state(|state| state.stored.remove(key));
                }
                Err(e) => return Err(e),
            }
        }

        let Some(loader) = &self.loader else {
            return Err(Error::NotFound(key.to_string()));
        };
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        log::debug!("Cache miss, loading: {key}");
        let data = loader.load(key).await?;
        self.write_back(&data).await;
        Ok(data)
    }

    async fn write_back(&self, data: &Bytes) {
        let key = self.key.as_str();
        let _writing = self.writes.lock().await;
        if !self.is_current() {
            log::debug!("Load of {key} was superseded, not persisting it");
            return;
        }
        match self.store.write(key, data).await {
            Ok(()) => {
                self.with_state(|state| state.stored.insert(key.to_string()));
            }
            Err(e) => log::warn!("Failed to persist {key}: {e}"),
        }
    }
}

/// Shared handle to a two-tier cache. Cloning is cheap.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CacheCoordinator {
    /// Opens a cache over `store` with no loader; misses are
    /// [`Error::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub async fn open(store: Arc<dyn BlobStore>) -> Result<Self> {
        Self::build(store, None).await
    }

    /// Opens a cache over `store` that fills misses from `loader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub async fn open_with_loader(
        store: Arc<dyn BlobStore>,
        loader: Arc<dyn Loader>,
    ) -> Result<Self> {
        Self::build(store, Some(loader)).await
    }

    async fn build(store: Arc<dyn BlobStore>, loader: Option<Arc<dyn Loader>>) -> Result<Self> {
        let stored: HashSet<String> = store.list().await?.into_iter().collect();
        log::debug!("Cache opened with {} stored entries", stored.len());
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                loader,
                state: Mutex::new(CacheState {
                    stored,
                    ..CacheState::default()
                }),
                writes: Arc::new(tokio::sync::Mutex::new(())),
                counters: Arc::new(Counters::default()),
            }),
        })
    }

    /// Returns the value of `key`, loading it at most once no matter how
    /// many callers ask concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key is not cached and there is no
    /// loader, or the error of the shared load.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let counters = &self.inner.counters;
        let load = {
            let mut state = self.inner.state();
            if let Some(data) = state.memory.get(key) {
                counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(data.clone());
            }
            if let Some((_, load)) = state.in_flight.get(key) {
                counters.joined.fetch_add(1, Ordering::Relaxed);
                load.clone()
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                let load = LoadJob::new(&self.inner, key, generation)
                    .run()
                    .boxed()
                    .shared();
                state
                    .in_flight
                    .insert(key.to_string(), (generation, load.clone()));
                load
            }
        };
        load.await
    }

    /// Stores `data` under `key` in both tiers.
    ///
    /// A load of `key` still in flight is detached: its waiters get its
    /// result, but it no longer updates either tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob store write fails; memory is left
    /// untouched in that case.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let _writing = self.inner.writes.lock().await;
        self.inner.store.write(key, &data).await?;
        let mut state = self.inner.state();
        state.in_flight.remove(key);
        state.stored.insert(key.to_string());
        state.memory.insert(key.to_string(), data);
        Ok(())
    }

    /// Drops `key` from both tiers.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be removed from the store.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let _writing = self.inner.writes.lock().await;
        {
            let mut state = self.inner.state();
            state.memory.remove(key);
            state.stored.remove(key);
            state.in_flight.remove(key);
        }
        self.inner.store.remove(key).await
    }

    /// Empties memory, the index and the blob store.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while listing or removing stored blobs;
    /// memory is cleared regardless.
    pub async fn clear(&self) -> Result<()> {
        let _writing = self.inner.writes.lock().await;
        {
            let mut state = self.inner.state();
            state.memory.clear();
            state.stored.clear();
            state.in_flight.clear();
        }
        for name in self.inner.store.list().await? {
            self.inner.store.remove(&name).await?;
        }
        log::debug!("Cache cleared");
        Ok(())
    }

    /// Whether `key` is held in memory or indexed in the store.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let state = self.inner.state();
        state.memory.contains_key(key) || state.stored.contains(key)
    }

    /// Current hit and miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            memory_hits: counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: counters.disk_hits.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            joined: counters.joined.load(Ordering::Relaxed),
        }
    }
}
