use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;

use crate::config::CacheConfig;

use super::cache_error::{CacheEntry, CacheError};
use super::cache_key::CacheKey;
use super::singleflight::{self, BuildSlot, Claim, ErasedPayload, SingleFlightGroup};

/// A page model in the ready state, together with its expiry bookkeeping.
pub(super) struct StoredEntry {
    /// The published payload. Immutable once stored; callers receive shared clones.
    pub(super) payload: ErasedPayload,
    /// When the build that produced this entry completed.
    pub(super) created_at: Instant,
    /// `created_at` plus the ttl in effect for the build.
    pub(super) expires_at: Instant,
    /// Last cache hit; recency for capacity eviction.
    pub(super) last_access: Instant,
}

pub(super) type EntryMap = Arc<Mutex<HashMap<CacheKey, StoredEntry>>>;

/// Per-call options for [`PageCache::compute_memoized`].
#[derive(Clone, Copy, Debug)]
pub struct ComputeOptions {
    /// Serve a stored, non-expired entry if there is one.
    ///
    /// When `false`, the lookup is skipped and the page is rebuilt, but the fresh result
    /// is still stored and published to concurrent callers of the same key.
    pub use_cache: bool,
    /// Overrides [`CacheConfig::default_ttl`] for the entry built by this call.
    pub ttl: Option<Duration>,
    /// Overrides [`CacheConfig::wait_timeout`] for this call.
    pub wait_timeout: Option<Duration>,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        ComputeOptions {
            use_cache: true,
            ttl: None,
            wait_timeout: None,
        }
    }
}

/// Caches assembled page models, keyed by [`CacheKey`].
///
/// Serves stored results within their ttl, and coalesces concurrent builds of the same
/// key onto a single computation whose outcome every caller shares. Cloning is cheap and
/// yields a handle to the same cache; handlers receive a clone instead of reaching for a
/// process global.
#[derive(Clone)]
pub struct PageCache {
    config: CacheConfig,

    /// All entries in the ready state.
    pub(super) entries: EntryMap,

    /// Used for deduplicating page builds.
    inflight: Arc<SingleFlightGroup>,
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("PageCache")
            .field("config", &self.config)
            .field("entries", &entries)
            .field("in-flight builds", &self.inflight.len())
            .finish()
    }
}

impl PageCache {
    pub fn new(config: CacheConfig) -> Self {
        PageCache {
            config,
            entries: Default::default(),
            inflight: Arc::new(SingleFlightGroup::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of entries currently in the ready state.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drops all stored entries. In-flight builds are unaffected.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Computes a page with the default [`ComputeOptions`].
    pub async fn compute<T, F, Fut>(&self, key: CacheKey, builder: F) -> CacheEntry<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        self.compute_memoized(key, ComputeOptions::default(), builder)
            .await
    }

    /// Computes a page by loading it from the cache or building it.
    ///
    /// The actual computation is deduplicated between concurrent callers of the same key:
    /// exactly one builder runs, everyone else cooperatively waits for its result. The
    /// builder is spawned as an independent task, so a caller that stops waiting (drop,
    /// [`ComputeOptions::wait_timeout`]) never cancels the build for the others, and
    /// builds of distinct keys run fully in parallel.
    ///
    /// # Errors
    ///
    /// A failing or panicking builder yields [`CacheError::BuildFailed`] for every
    /// coalesced caller. Failures are never stored, so the next call after the failure
    /// starts a fresh build. Requesting a key as a different type than it was stored
    /// under yields [`CacheError::TypeMismatch`].
    pub async fn compute_memoized<T, F, Fut>(
        &self,
        key: CacheKey,
        options: ComputeOptions,
        builder: F,
    ) -> CacheEntry<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        metric!(counter("pagecache.access") += 1);

        if options.use_cache && self.config.enabled {
            if let Some(payload) = self.lookup(&key) {
                metric!(counter("pagecache.memory.hit") += 1);
                return downcast(&key, payload);
            }
        }

        let handle = match self.inflight.try_claim(&key) {
            Claim::InFlight(handle) => {
                // A concurrent page build was coalesced.
                metric!(counter("pagecache.channel.hit") += 1);
                handle
            }
            Claim::Claimed { slot, handle } => {
                metric!(counter("pagecache.channel.miss") += 1);
                self.spawn_build(key.clone(), options.ttl, builder, slot);
                handle
            }
        };

        let limit = options.wait_timeout.or(self.config.wait_timeout);
        let payload = singleflight::wait(handle, limit).await?;
        downcast(&key, payload)
    }

    /// Looks `key` up in the store, removing it if it is past its deadline.
    fn lookup(&self, key: &CacheKey) -> Option<ErasedPayload> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                Some(entry.payload.clone())
            }
            Some(_) => {
                // An expired entry is a miss; drop it eagerly so neither this caller nor
                // the sweep can serve it again.
                entries.remove(key);
                metric!(counter("pagecache.memory.expired") += 1);
                None
            }
            None => None,
        }
    }

    /// Spawns the builder for a freshly claimed key as a separate task.
    ///
    /// The task stores a successful result before publishing it, so a caller either joins
    /// the in-flight channel or finds the entry in the store. On failure nothing is
    /// stored and the claim is released, with the error going out to every waiter.
    fn spawn_build<T, F, Fut>(&self, key: CacheKey, ttl: Option<Duration>, builder: F, slot: BuildSlot)
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        tracing::trace!(%key, "spawning page build");
        metric!(counter("pagecache.computation") += 1);

        let cache = self.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let result = match AssertUnwindSafe(builder()).catch_unwind().await {
                Ok(entry) => entry.map(|payload| Arc::new(payload) as ErasedPayload),
                Err(panic) => {
                    let error = CacheError::from_panic(&*panic);
                    tracing::error!(%key, %error, "page builder panicked");
                    Err(error)
                }
            };
            metric!(timer("pagecache.computation.duration") = start.elapsed());

            if let Ok(payload) = &result {
                cache.store(key, payload.clone(), ttl);
            }
            slot.publish(result);
        });
    }

    /// Inserts a freshly built payload into the store.
    fn store(&self, key: CacheKey, payload: ErasedPayload, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = Instant::now();
        let entry = StoredEntry {
            payload,
            created_at: now,
            expires_at: now + ttl,
            last_access: now,
        };
        self.entries.lock().insert(key, entry);
    }

    #[cfg(test)]
    pub(crate) fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }
}

/// Recovers the typed payload from its erased form.
fn downcast<T: Any + Send + Sync>(key: &CacheKey, payload: ErasedPayload) -> CacheEntry<Arc<T>> {
    payload.downcast().map_err(|_| {
        // Two call sites disagree about the page model behind this key.
        tracing::error!(
            %key,
            expected = std::any::type_name::<T>(),
            "page cache payload type mismatch"
        );
        CacheError::TypeMismatch
    })
}
