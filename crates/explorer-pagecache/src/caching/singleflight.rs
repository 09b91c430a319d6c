use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;

use crate::utils::CallOnDrop;

use super::cache_error::{CacheEntry, CacheError};
use super::cache_key::CacheKey;

/// A type-erased page payload as it is stored and published.
pub(crate) type ErasedPayload = Arc<dyn Any + Send + Sync>;

type ComputationChannel = Shared<oneshot::Receiver<CacheEntry<ErasedPayload>>>;
type ComputationMap = Arc<Mutex<BTreeMap<CacheKey, ComputationChannel>>>;

/// A handle to an in-flight page build that can be awaited by any number of followers.
pub(crate) type WaitHandle = ComputationChannel;

/// Ensures at most one page build runs per key.
///
/// An entry in the internal map *is* the "building" state of a key: it is inserted when a
/// caller claims the key and removed when the build publishes or is abandoned, so map
/// uniqueness is the at-most-one-builder invariant.
pub(crate) struct SingleFlightGroup {
    current_computations: ComputationMap,
}

/// The outcome of [`SingleFlightGroup::try_claim`].
pub(crate) enum Claim {
    /// The caller owns the build for this key and must publish through the slot.
    Claimed { slot: BuildSlot, handle: WaitHandle },
    /// Another task is already building this key.
    InFlight(WaitHandle),
}

/// The owning side of a claimed key.
///
/// Publishing consumes the slot. Dropping it without publishing (builder panic, task
/// abort) still releases the key and resolves all waiters with
/// [`CacheError::Cancelled`], so a failed build can never leave the key stuck.
pub(crate) struct BuildSlot {
    sender: oneshot::Sender<CacheEntry<ErasedPayload>>,
    release: CallOnDrop,
}

impl SingleFlightGroup {
    pub fn new() -> Self {
        SingleFlightGroup {
            current_computations: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Atomically claims `key`, or joins the build already in flight for it.
    pub fn try_claim(&self, key: &CacheKey) -> Claim {
        let mut current_computations = self.current_computations.lock();

        if let Some(channel) = current_computations.get(key) {
            return Claim::InFlight(channel.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        current_computations.insert(key.clone(), channel.clone());

        let release = {
            let key = key.clone();
            let current_computations = Arc::clone(&self.current_computations);
            CallOnDrop::new(move || {
                current_computations.lock().remove(&key);
            })
        };

        Claim::Claimed {
            slot: BuildSlot { sender, release },
            handle: channel,
        }
    }

    /// Number of builds currently in flight.
    ///
    /// Best-effort: reports zero instead of blocking on a contended lock.
    pub fn len(&self) -> usize {
        self.current_computations
            .try_lock()
            .map(|current| current.len())
            .unwrap_or_default()
    }
}

impl BuildSlot {
    /// Publishes the build outcome to all waiters, exactly once.
    ///
    /// The claim is released before the result is sent, so a concurrent caller either
    /// joins a channel that will still receive data, or finds no claim and starts a
    /// fresh build.
    pub fn publish(self, result: CacheEntry<ErasedPayload>) {
        let BuildSlot { sender, release } = self;
        drop(release);
        sender.send(result).ok();
    }
}

/// Awaits the in-flight build behind `handle`.
///
/// All waiters observe the same published outcome, in no particular order. A `limit`
/// bounds only this caller's wait; the build runs on regardless.
pub(crate) async fn wait(handle: WaitHandle, limit: Option<Duration>) -> CacheEntry<ErasedPayload> {
    let outcome = async move {
        match handle.await {
            Ok(entry) => entry,
            // The owning build was dropped before it could publish.
            Err(oneshot::Canceled) => Err(CacheError::Cancelled),
        }
    };

    match limit {
        Some(limit) => tokio::time::timeout(limit, outcome)
            .await
            .unwrap_or(Err(CacheError::WaitTimeout(limit))),
        None => outcome.await,
    }
}
