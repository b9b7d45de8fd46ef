//! A refresh-ahead cache holding a single value.
//!
//! This is the keyed cache boiled down to one slot: the same freshness state machine and the same
//! single-flight background refresh, but with no key index, no recency order and no eviction.
//! Typical uses are a service token or a parsed remote configuration - one expensive thing that
//! should be recomputed from time to time without anyone waiting for it.
use crate::clock::Clock;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// The cached value and its expiry instants, replaced as one unit.
///
/// `value` is None until the first successful computation; both expiries start at zero so that
/// the very first lookup takes the synchronous path.
struct Slot<T> {
    value: Option<T>,
    expire_refresh: i64,
    expire_rotten: i64,
}

/// How a lookup classified the slot based on the current instant.
enum Freshness {
    Fresh,
    Stale,
}

/// A cache for a single value which serves it stale while refreshing it in the background.
///
/// Works exactly like [KeyValueCache](crate::cache::KeyValueCache), minus keys and eviction: the
/// value is served as is within `refresh_timeout` of its computation, served stale (with at most
/// one background recomputation in flight) until `rotten_timeout` has elapsed and recomputed
/// synchronously thereafter.
///
/// # Example
/// ```
/// use larder::cache::ValueCache;
/// use larder::clock::ScriptedClock;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let cache = ValueCache::new(Arc::new(ScriptedClock::new([0, 2])), 5, 30);
///
/// // The first lookup computes the value...
/// assert_eq!(cache.get(|| async { Ok(42) }).await?, 42);
///
/// // ...within the refresh timeout it is served from memory.
/// assert_eq!(cache.get(|| async { anyhow::bail!("must not be called") }).await?, 42);
/// # Ok(())
/// # }
/// ```
pub struct ValueCache<T> {
    clock: Arc<dyn Clock>,
    slot: Arc<Mutex<Slot<T>>>,
    refresh_permit: Arc<Semaphore>,
    timeout_refresh: i64,
    timeout_rotten: i64,
    on_refresh: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T: Clone + Send + 'static> ValueCache<T> {
    /// Creates an empty cache with the given timeouts, both in seconds.
    ///
    /// The caller must pick `rotten_timeout >= refresh_timeout`, otherwise the stale window
    /// would be empty or ill-formed.
    pub fn new(clock: Arc<dyn Clock>, refresh_timeout: i64, rotten_timeout: i64) -> Self {
        ValueCache {
            clock,
            slot: Arc::new(Mutex::new(Slot {
                value: None,
                expire_refresh: 0,
                expire_rotten: 0,
            })),
            refresh_permit: Arc::new(Semaphore::new(1)),
            timeout_refresh: refresh_timeout,
            timeout_rotten: rotten_timeout,
            on_refresh: None,
        }
    }

    /// Installs a callback which is invoked once per completed synchronous computation and once
    /// per successful background refresh.
    ///
    /// This is an observation point, mostly used by tests to await background refreshes
    /// deterministically. It has to be installed before the cache is shared.
    pub fn set_refresh_hook(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_refresh = Some(Arc::new(hook));
    }

    /// Returns the cached value, computing it via `getter` if need be.
    ///
    /// A fresh value is returned as is. A stale value is returned immediately as well; if no
    /// other refresh is in flight, `getter` is dispatched as a detached background task which
    /// swaps in the new value once it succeeds. A rotten (or never computed) value is recomputed
    /// synchronously under the cache's exclusive section.
    ///
    /// # Errors
    /// Fails if and only if a synchronous computation was required and the getter failed; the
    /// error passes through untouched and the slot keeps whatever it held before. Background
    /// refresh failures are logged and dropped; the next stale lookup retries.
    pub async fn get<F, Fut>(&self, getter: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let now = self.clock.now();

        let classified = {
            let slot = self.slot.lock().await;
            match &slot.value {
                Some(value) if now < slot.expire_refresh => {
                    Some((Freshness::Fresh, value.clone()))
                }
                Some(value) if now < slot.expire_rotten => Some((Freshness::Stale, value.clone())),
                _ => None,
            }
        };

        match classified {
            Some((Freshness::Fresh, value)) => Ok(value),
            Some((Freshness::Stale, value)) => {
                if let Ok(permit) = self.refresh_permit.clone().try_acquire_owned() {
                    let slot = self.slot.clone();
                    let on_refresh = self.on_refresh.clone();
                    let timeout_refresh = self.timeout_refresh;
                    let timeout_rotten = self.timeout_rotten;

                    crate::spawn!(async move {
                        // Dropped on every exit path - a leaked permit would starve all
                        // future refreshes of this cache.
                        let _permit = permit;

                        match getter().await {
                            Err(error) => {
                                log::debug!(
                                    "Background refresh failed, keeping the stale value: {}",
                                    error
                                );
                            }
                            Ok(value) => {
                                {
                                    let mut slot = slot.lock().await;
                                    slot.value = Some(value);
                                    slot.expire_refresh = now + timeout_refresh;
                                    slot.expire_rotten = now + timeout_rotten;
                                }
                                if let Some(on_refresh) = on_refresh {
                                    on_refresh();
                                }
                            }
                        }
                    });
                }

                Ok(value)
            }
            None => {
                let mut slot = self.slot.lock().await;

                let value = getter().await?;

                slot.value = Some(value.clone());
                slot.expire_refresh = now + self.timeout_refresh;
                slot.expire_rotten = now + self.timeout_rotten;
                drop(slot);

                if let Some(on_refresh) = &self.on_refresh {
                    on_refresh();
                }

                Ok(value)
            }
        }
    }
}
