use std::time::Instant;

use futures::channel::oneshot;
use tokio::time::MissedTickBehavior;

use super::cache_key::CacheKey;
use super::memory::PageCache;

/// How many entries a sweep inspects per acquisition of the store lock.
///
/// Keeps a sweep over a large store from starving concurrent lookups.
const SWEEP_BATCH: usize = 128;

/// Controls the background maintenance loop of a [`PageCache`].
///
/// Dropping the handle stops the loop as well; [`stop`](Self::stop) additionally waits
/// for it to finish.
pub struct MaintenanceHandle {
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stops the maintenance loop and waits for it to terminate.
    ///
    /// Builds that are still in flight at this point are left to their own devices; the
    /// process is expected to be on its way out.
    pub async fn stop(self) {
        self.shutdown.send(()).ok();
        self.task.await.ok();
    }
}

impl PageCache {
    /// Launches the periodic maintenance sweep for this cache.
    ///
    /// Runs until the returned [`MaintenanceHandle`] is stopped or dropped. Must be
    /// called from within a tokio runtime.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let cache = self.clone();
        let (shutdown, mut rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config().sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = interval.tick() => cache.sweep(Instant::now()),
                }
            }
            tracing::debug!("page cache maintenance loop terminated");
        });

        MaintenanceHandle { shutdown, task }
    }

    /// One maintenance pass over the store.
    ///
    /// Removes entries whose deadline has passed and, if a capacity limit is configured,
    /// evicts the least recently used entries beyond it. Only ready entries are
    /// candidates; in-flight builds live in the coalescing map and are structurally out
    /// of reach. The store lock is held per batch, never across the whole pass.
    pub(crate) fn sweep(&self, now: Instant) {
        let snapshot: Vec<(CacheKey, Instant)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.expires_at))
                .collect()
        };

        let mut expired = 0usize;
        for batch in snapshot.chunks(SWEEP_BATCH) {
            let mut entries = self.entries.lock();
            for (key, seen_deadline) in batch {
                let Some(entry) = entries.get(key) else {
                    continue;
                };
                // The entry may have been rebuilt since the snapshot was taken; only
                // remove it if the deadline we saw still stands.
                if entry.expires_at <= now && entry.expires_at == *seen_deadline {
                    entries.remove(key);
                    expired += 1;
                }
            }
        }

        let evicted = match self.config().max_entries {
            Some(max_entries) => self.enforce_capacity(max_entries),
            None => 0,
        };

        let remaining = self.entry_count();
        metric!(counter("pagecache.sweep.expired") += expired as i64);
        metric!(counter("pagecache.sweep.evicted") += evicted as i64);
        metric!(gauge("pagecache.entries") = remaining as u64);
        if expired > 0 || evicted > 0 {
            tracing::debug!(expired, evicted, remaining, "page cache sweep");
        }
    }

    /// Evicts the least recently used entries beyond `max_entries`.
    ///
    /// Recency is `last_access`, with `created_at` breaking ties among entries that were
    /// never served after their build.
    fn enforce_capacity(&self, max_entries: usize) -> usize {
        let mut recency: Vec<(CacheKey, Instant, Instant)> = {
            let entries = self.entries.lock();
            if entries.len() <= max_entries {
                return 0;
            }
            entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.last_access, entry.created_at))
                .collect()
        };

        recency.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));
        let excess = recency.len().saturating_sub(max_entries);

        let mut evicted = 0usize;
        for batch in recency[..excess].chunks(SWEEP_BATCH) {
            let mut entries = self.entries.lock();
            for (key, seen_access, _) in batch {
                let Some(entry) = entries.get(key) else {
                    continue;
                };
                // Skip entries that were served again after the snapshot; they are no
                // longer the least recently used.
                if entry.last_access == *seen_access {
                    entries.remove(key);
                    evicted += 1;
                }
            }
        }
        evicted
    }
}
