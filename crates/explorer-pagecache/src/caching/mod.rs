//! # Explorer page caching infrastructure
//!
//! Assembling a page of the explorer frontend is expensive: it involves database scans,
//! chain-state lookups and participation-rate computations, and the same logical page is
//! typically requested by many clients at once. This module contains the cache those
//! requests share, our central [`CacheError`] type, and an explanation of how all this
//! works.
//!
//! ## Cache layers
//!
//! The cache is a single in-memory layer with two cooperating parts:
//!
//! - A store of ready page models, keyed by [`CacheKey`], each carrying a deadline
//!   derived from the configured ttl. Entries past their deadline count as misses and
//!   are never served.
//! - A request-coalescing layer (the single-flight group) that guarantees at most one
//!   build per key is in flight. Concurrent callers of a
//!   cold key join the running build and all receive its outcome, which prevents a
//!   cache stampede: without it, every concurrent miss would re-run the expensive
//!   query exactly when load is highest.
//!
//! A request goes through the following steps:
//! - First, the store is consulted. A ready, non-expired entry is returned as-is.
//! - On miss, the caller either claims the key and spawns the page builder, or joins
//!   the build another caller already has in flight.
//! - The freshly built page is stored and published to all waiters at once.
//!
//! Build failures are published to every waiter but never stored, so the next request
//! retries from scratch (no negative caching).
//!
//! ## Maintenance
//!
//! A background loop ([`PageCache::spawn_maintenance`]) periodically removes expired
//! entries and enforces the configured capacity by evicting the least recently used
//! entries. In-flight builds are never touched by maintenance.
//!
//! ### Metrics
//!
//! The following metrics are collected:
//!
//! - `pagecache.access`: All accesses.
//! - `pagecache.memory.hit`: Accesses served from the store.
//! - `pagecache.memory.expired`: Entries dropped because they were found expired.
//! - `pagecache.channel.hit`: Accesses coalesced onto an in-flight build.
//! - `pagecache.channel.miss`: Accesses that claimed a key and spawned a build.
//! - `pagecache.computation`: Builder runs, with `pagecache.computation.duration`
//!   timing them.
//! - `pagecache.sweep.expired` / `pagecache.sweep.evicted`: Sweep removals, and
//!   `pagecache.entries` gauging the store size after each sweep.
//!
//! ## [`CacheEntry`] / [`CacheError`]
//!
//! The caching layer primarily deals with [`CacheEntry`]s, which are just an alias for a
//! [`Result`] around a [`CacheError`]. Builders return them, and the same values flow to
//! every coalesced caller, which is why [`CacheError`] is `Clone` and carries rendered
//! messages rather than error sources.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is an opaque string derived from the route identity and all filter
//! and pagination parameters, built through the [`CacheKeyBuilder`]. Care must be taken
//! that the input is stable, as unstable keys defeat both caching and coalescing.

mod cache_error;
mod cache_key;
mod cleanup;
mod memory;
mod singleflight;
#[cfg(test)]
mod tests;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use cleanup::MaintenanceHandle;
pub use memory::{ComputeOptions, PageCache};
