use std::fmt::{self, Write};
use std::sync::Arc;

/// Identifies one cacheable page computation.
///
/// Handlers derive the key from the route identity plus every filter and pagination
/// parameter, in a canonical order, following the pattern
/// `"<page-name>:<param1>:…:<paramN>"`. Two requests that produce the same view model must
/// produce the same key, and two requests that differ in any parameter must not.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    key: Arc<str>,
}

impl CacheKey {
    /// Create a [`CacheKeyBuilder`] for the given page name.
    pub fn builder(page: &str) -> CacheKeyBuilder {
        debug_assert!(!page.is_empty(), "cache keys must not be empty");
        CacheKeyBuilder {
            key: page.to_owned(),
        }
    }

    /// Returns the full key string.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<Arc<str>>) -> Self {
        CacheKey { key: key.into() }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// A builder for [`CacheKey`]s.
///
/// Parameters are appended with [`segment`](Self::segment) in the order the route defines
/// them; empty parameters still occupy a segment so that distinct filter combinations can
/// never collide. The builder also implements [`std::fmt::Write`] for free-form suffixes.
///
/// **NOTE**: The input must be stable. The same logical page has to produce the same key on
/// every request, as it would otherwise defeat both caching and build coalescing.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    key: String,
}

impl CacheKeyBuilder {
    /// Appends one `:`-separated parameter.
    pub fn segment(mut self, value: impl fmt::Display) -> Self {
        write!(self.key, ":{value}").expect("writing to a string is infallible");
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        CacheKey {
            key: self.key.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.key.write_str(s)
    }
}
