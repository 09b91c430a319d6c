use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while building or serving a cached page.
///
/// One build outcome is shared between every caller coalesced onto the same key, which is
/// why this type is `Clone` and carries rendered messages rather than source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The page builder itself failed.
    ///
    /// The attached string contains the builder's error. Failures are never stored: the key
    /// is released and the next request starts a fresh build.
    #[error("page build failed: {0}")]
    BuildFailed(String),
    /// The stored payload is not of the type the caller asked for.
    ///
    /// Two call sites disagree about the page model behind a key. This is a programming
    /// error, not a runtime condition, and is logged accordingly.
    #[error("cached payload does not match the requested page model")]
    TypeMismatch,
    /// The caller's bounded wait for an in-flight build elapsed.
    ///
    /// The build itself keeps running and will publish its result to everyone else.
    #[error("timed out waiting for in-flight page build after {0:?}")]
    WaitTimeout(Duration),
    /// The in-flight build was abandoned before it published a result.
    #[error("page build was cancelled")]
    Cancelled,
}

impl CacheError {
    /// Renders an arbitrary builder error into a [`BuildFailed`](Self::BuildFailed).
    #[track_caller]
    pub fn build_failed<E: std::fmt::Display>(err: E) -> Self {
        CacheError::BuildFailed(err.to_string())
    }

    /// Renders the payload of a panicking page builder into a
    /// [`BuildFailed`](Self::BuildFailed).
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "unknown panic payload"
        };
        CacheError::BuildFailed(format!("page builder panicked: {message}"))
    }
}

/// An entry in the page cache, containing either `Ok(T)` or the reason why the page could
/// not be built.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
