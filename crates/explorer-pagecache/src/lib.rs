//! A concurrency-safe page-result cache for the explorer frontend.
//!
//! HTTP handlers assemble page-specific view models out of database scans and chain-state
//! lookups. That work is expensive and highly concurrent, so handlers run it through the
//! [`PageCache`]: stored results are served within their ttl, concurrent builds of the
//! same page are coalesced onto a single computation, and a background sweep keeps the
//! store bounded. See the [`caching`] module documentation for the full picture.
//!
//! ```no_run
//! use explorer_pagecache::{CacheConfig, CacheError, CacheKey, PageCache};
//!
//! # async fn example() -> Result<(), CacheError> {
//! let cache = PageCache::new(CacheConfig::default());
//! let maintenance = cache.spawn_maintenance();
//!
//! let key = CacheKey::builder("slashings").segment(1).segment(50).build();
//! let page = cache
//!     .compute(key, || async {
//!         // database scans, chain-state lookups, …
//!         Ok("assembled page model".to_owned())
//!     })
//!     .await?;
//! assert_eq!(page.as_str(), "assembled page model");
//!
//! maintenance.stop().await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
mod utils;


pub use caching::{
    CacheEntry, CacheError, CacheKey, CacheKeyBuilder, ComputeOptions, MaintenanceHandle,
    PageCache,
};
pub use config::CacheConfig;
