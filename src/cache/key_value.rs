//! A bounded, string-keyed refresh-ahead cache with LRU eviction.
//!
//! See the [module docs](crate::cache) for the freshness state machine. On top of it, this cache
//! maintains two index structures: a doubly linked list which keeps all keys in recency order
//! (head = least recently used = eviction candidate) and a concurrency-safe key index which maps
//! each key to its entry and list node for O(1) lookups. The invariant between them is simple: a
//! key is present in the key index if and only if it is linked in the list.
//!
//! # Locking
//! The list and the capacity bookkeeping are only ever touched under the cache's single exclusive
//! section (a [tokio mutex](tokio::sync::Mutex), as the synchronous recompute path holds it across
//! the getter). The key index carries its own short-lived lock per operation and is the only
//! structure accessed outside the exclusive section - notably by background refresh tasks. Each
//! entry's value and expiry instants live behind a per-entry lock and are only ever replaced as
//! one unit, so no lookup can observe a half-updated entry.
//!
//! Background refreshes are gated by a single cache-wide permit, not one permit per key. This
//! bounds the background-refresh concurrency of a cache instance to one, which is a deliberate
//! policy: a cache fronting a struggling backend should not be able to pile up unbounded
//! background work. Entries whose refresh lost the race simply stay stale until a later lookup
//! retriggers it.
use crate::cache::linked_list::{LinkedList, NodeId};
use crate::cache::sync_map::SyncMap;
use crate::clock::Clock;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

/// The value of an entry along with its two expiry instants.
///
/// The three fields are always replaced together; they never change individually.
struct EntryState<T> {
    value: T,
    expire_refresh: i64,
    expire_rotten: i64,
}

/// An entry shared between the key index and background refresh tasks.
///
/// A refresh task updates the entry it captured even if the entry has been evicted in the
/// meantime; the update is then simply invisible.
type SharedEntry<T> = Arc<Mutex<EntryState<T>>>;

/// The value stored in the key index: the entry plus its current list position.
///
/// The list node itself carries only the key, so that evicting the list head can remove the
/// matching key index entry.
struct Handle<T> {
    node: NodeId,
    entry: SharedEntry<T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            node: self.node,
            entry: self.entry.clone(),
        }
    }
}

/// How a lookup classified an entry based on the current instant.
enum Freshness {
    Fresh,
    Stale,
}

/// A bounded string-keyed cache which serves stale values while refreshing them in the background.
///
/// Values are computed by the getter passed to [get](KeyValueCache::get) and cached for
/// `rotten_timeout`. Within the first `refresh_timeout` of that window they are served as is;
/// for the rest of the window they are still served immediately while a single background task
/// recomputes them. Once full, the cache evicts the least recently used entry.
///
/// The cache is meant to be shared, e.g. as an `Arc<KeyValueCache<T>>`, and used concurrently.
///
/// # Example
/// ```
/// use larder::cache::KeyValueCache;
/// use larder::clock::ScriptedClock;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let cache = KeyValueCache::new(
///     Arc::new(ScriptedClock::new([0, 2])),
///     16,
///     Duration::from_secs(5),
///     Duration::from_secs(30),
/// );
///
/// // The first lookup for a key computes the value...
/// assert_eq!(cache.get("a", || async { Ok(1) }).await?, 1);
///
/// // ...lookups within the refresh timeout serve it from memory.
/// assert_eq!(
///     cache.get("a", || async { anyhow::bail!("must not be called") }).await?,
///     1
/// );
/// # Ok(())
/// # }
/// ```
pub struct KeyValueCache<T> {
    clock: Arc<dyn Clock>,
    index: SyncMap<Handle<T>>,
    entries: Mutex<LinkedList<String>>,
    capacity: usize,
    refresh_permit: Arc<Semaphore>,
    timeout_refresh: i64,
    timeout_rotten: i64,
    on_refresh: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T: Clone + Send + 'static> KeyValueCache<T> {
    /// Creates a cache holding up to `capacity` entries.
    ///
    /// A value is served without side effects for `refresh_timeout` after its computation, served
    /// stale (while being refreshed in the background) until `rotten_timeout` has elapsed and
    /// recomputed synchronously thereafter. The caller must pick `rotten_timeout >=
    /// refresh_timeout`, otherwise the stale window would be empty or ill-formed.
    ///
    /// Timeouts are truncated to full seconds, matching the resolution of the [Clock].
    pub fn new(
        clock: Arc<dyn Clock>,
        capacity: usize,
        refresh_timeout: Duration,
        rotten_timeout: Duration,
    ) -> Self {
        KeyValueCache {
            clock,
            index: SyncMap::new(),
            entries: Mutex::new(LinkedList::new()),
            capacity,
            refresh_permit: Arc::new(Semaphore::new(1)),
            timeout_refresh: refresh_timeout.as_secs() as i64,
            timeout_rotten: rotten_timeout.as_secs() as i64,
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

    /// Returns the value cached for the given key, computing it via `getter` if need be.
    ///
    /// Exactly one clock reading determines the freshness of the entry:
    /// * **fresh**: the cached value is returned and the entry becomes the most recently used.
    /// * **stale**: the cached value is returned immediately; if no other refresh is in flight,
    ///   `getter` is dispatched as a detached background task which swaps in the new value (with
    ///   expiries based on the instant read above) once it succeeds.
    /// * **rotten** (or unknown key): `getter` runs synchronously under the cache's exclusive
    ///   section and its result is cached and returned.
    ///
    /// # Errors
    /// Fails if and only if a synchronous computation was required and the getter failed. The
    /// error is passed through untouched and nothing in the cache changes: a previously cached
    /// entry keeps its value and expiries, so the next lookup retries. Background refresh
    /// failures are never surfaced here; they are logged and dropped, leaving the entry to be
    /// retried on a later stale lookup.
    pub async fn get<F, Fut>(&self, key: &str, getter: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let now = self.clock.now();
        let existing = self.index.get(key);

        if let Some(handle) = &existing {
            let classified = {
                let state = handle.entry.lock().await;
                if now < state.expire_refresh {
                    Some((Freshness::Fresh, state.value.clone()))
                } else if now < state.expire_rotten {
                    Some((Freshness::Stale, state.value.clone()))
                } else {
                    None
                }
            };

            match classified {
                Some((Freshness::Fresh, value)) => {
                    self.touch(key, handle).await;
                    return Ok(value);
                }
                Some((Freshness::Stale, value)) => {
                    if let Ok(permit) = self.refresh_permit.clone().try_acquire_owned() {
                        let entry = handle.entry.clone();
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
                                        let mut state = entry.lock().await;
                                        state.value = value;
                                        state.expire_refresh = now + timeout_refresh;
                                        state.expire_rotten = now + timeout_rotten;
                                    }
                                    if let Some(on_refresh) = on_refresh {
                                        on_refresh();
                                    }
                                }
                            }
                        });
                    }

                    self.touch(key, handle).await;
                    return Ok(value);
                }
                None => {
                    // Rotten - recompute synchronously below.
                }
            }
        }

        let mut entries = self.entries.lock().await;

        let value = getter().await?;

        // Detach the node being replaced. We re-read the index as the entry might have been
        // replaced or evicted while we waited for the exclusive section.
        if let Some(current) = self.index.get(key) {
            let _ = entries.remove(current.node);
        }

        // Evict the least recently used entry before inserting, so that the capacity is never
        // exceeded. A replaced entry was already detached above, in which case there is room
        // and nothing is evicted.
        if entries.len() >= self.capacity {
            if let Some(first) = entries.first() {
                if let Some(victim) = entries.remove(first) {
                    self.index.delete(&victim);
                }
            }
        }

        let entry = Arc::new(Mutex::new(EntryState {
            value: value.clone(),
            expire_refresh: now + self.timeout_refresh,
            expire_rotten: now + self.timeout_rotten,
        }));
        let node = entries.append_last(key.to_owned());
        self.index.set(key.to_owned(), Handle { node, entry });

        if let Some(on_refresh) = &self.on_refresh {
            on_refresh();
        }

        Ok(value)
    }

    /// Moves the given entry to the most recently used position.
    ///
    /// A lookup which observed a usable value always touches the entry, so recency order stays
    /// causally consistent with what callers were served. The handle can be stale if the lookup
    /// raced with an eviction or another touch of the same key; recency is then already up to
    /// date (or moot) and nothing happens.
    async fn touch(&self, key: &str, handle: &Handle<T>) {
        let mut entries = self.entries.lock().await;
        if let Some(linked_key) = entries.remove(handle.node) {
            let node = entries.append_last(linked_key);
            self.index.set(
                key.to_owned(),
                Handle {
                    node,
                    entry: handle.entry.clone(),
                },
            );
        }
    }

    /// Returns all cached keys, ordered from least to most recently used.
    ///
    /// Mainly useful for diagnostics and tests.
    pub async fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries.iter().cloned().collect()
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Determines if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.len() == 0
    }

    /// Returns the maximal number of entries this cache will hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes all entries.
    ///
    /// An in-flight background refresh keeps running; its result lands in the detached entry and
    /// is simply never served.
    pub async fn flush(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::KeyValueCache;
    use crate::clock::ScriptedClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    /// Produces a fresh getter which yields 1, 2, 3, ... across invocations.
    macro_rules! counting_getter {
        ($counter:expr) => {{
            let counter = $counter.clone();
            move || async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
        }};
    }

    /// Produces a getter which counts its invocation and then fails.
    macro_rules! failing_getter {
        ($counter:expr) => {{
            let counter = $counter.clone();
            move || async move {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("simulated backend outage")
            }
        }};
    }

    /// Builds a cache (refresh 5s, rotten 30s) whose refresh hook signals the returned channel.
    fn observed_cache(
        instants: impl IntoIterator<Item = i64>,
        capacity: usize,
    ) -> (KeyValueCache<usize>, UnboundedReceiver<()>) {
        let (tx, rx) = unbounded_channel();
        let mut cache = KeyValueCache::new(
            Arc::new(ScriptedClock::new(instants)),
            capacity,
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        cache.set_refresh_hook(move || {
            let _ = tx.send(());
        });

        (cache, rx)
    }

    #[test]
    fn fresh_stale_and_rotten_windows_behave_as_specified() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0, 0, 10, 10, 60], 2);

            // t=0: unknown key, computed synchronously...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;

            // t=0: fresh, served from memory without touching the getter...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            assert_eq!(counter.load(Ordering::SeqCst), 1);

            // t=10: stale, the old value is served while a background refresh runs...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;

            // t=10: the refreshed value is fresh again, as its expiries are based on t=10...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 2);
            assert_eq!(counter.load(Ordering::SeqCst), 2);

            // t=60: rotten, recomputed synchronously.
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 3);
            let _ = refreshed.recv().await;
        });
    }

    #[test]
    fn stale_lookups_collapse_into_a_single_refresh() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0, 10, 10, 10, 10], 2);

            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;

            // t=10: the first stale lookup claims the refresh permit...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);

            // ...so further stale lookups may not even invoke their getter. (The spawned
            // refresh cannot have run yet, as this test never yields to it.)
            let must_not_run = || async { panic!("a second refresh was started") };
            assert_eq!(cache.get("a", must_not_run).await.unwrap(), 1);
            let must_not_run = || async { panic!("a third refresh was started") };
            assert_eq!(cache.get("a", must_not_run).await.unwrap(), 1);

            // Once the refresh completed, the new value is served.
            let _ = refreshed.recv().await;
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 2);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn stale_lookups_move_the_entry_to_the_most_recently_used_position() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0, 0, 10, 10, 10], 2);

            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;
            assert_eq!(cache.get("b", counting_getter!(counter)).await.unwrap(), 2);
            let _ = refreshed.recv().await;

            // t=10: both entries are stale. Serving "b" touches it and claims the refresh
            // permit; serving "a" touches it as well even though the permit is taken...
            assert_eq!(cache.get("b", || async { Ok(99) }).await.unwrap(), 2);
            assert_eq!(cache.get("a", || async { Ok(99) }).await.unwrap(), 1);

            // ..."b" is therefore the least recently used entry and a miss on "c" evicts it.
            assert_eq!(cache.get("c", counting_getter!(counter)).await.unwrap(), 3);
            let _ = refreshed.recv().await;
            assert_eq!(cache.keys().await, vec!["a".to_owned(), "c".to_owned()]);
        });
    }

    #[test]
    fn least_recently_used_entries_are_evicted_first() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0; 9], 2);

            // Fill the cache beyond its capacity of two...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;
            assert_eq!(cache.get("b", counting_getter!(counter)).await.unwrap(), 2);
            let _ = refreshed.recv().await;
            assert_eq!(cache.get("c", counting_getter!(counter)).await.unwrap(), 3);
            let _ = refreshed.recv().await;
            assert_eq!(cache.len(), 2);

            // ..."a" was the least recently used entry and is gone, "b" and "c" are served
            // from memory...
            assert_eq!(cache.get("b", counting_getter!(counter)).await.unwrap(), 2);
            assert_eq!(cache.get("c", counting_getter!(counter)).await.unwrap(), 3);

            // ...a miss on "a" recomputes it and evicts "b" (least recently touched)...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 4);
            let _ = refreshed.recv().await;

            // ..."c" survived and its access moves it ahead of "a" again...
            assert_eq!(cache.get("c", counting_getter!(counter)).await.unwrap(), 3);

            // ...so recomputing "b" now evicts "a", and recomputing "a" evicts "c".
            assert_eq!(cache.get("b", counting_getter!(counter)).await.unwrap(), 5);
            let _ = refreshed.recv().await;
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 6);
            let _ = refreshed.recv().await;
            assert_eq!(cache.len(), 2);
            assert_eq!(cache.keys().await, vec!["b".to_owned(), "a".to_owned()]);
        });
    }

    #[test]
    fn replacing_a_rotten_entry_does_not_evict_its_neighbours() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0, 0, 60, 62], 2);

            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;
            assert_eq!(cache.get("b", counting_getter!(counter)).await.unwrap(), 2);
            let _ = refreshed.recv().await;

            // t=60: "a" is rotten and replaced in place. The cache is full, but as "a" is
            // detached before the capacity check runs, nothing is evicted...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 3);
            let _ = refreshed.recv().await;
            assert_eq!(cache.len(), 2);

            // ...and the replacement is fresh relative to t=60.
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 3);
            assert_eq!(counter.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn getter_errors_propagate_and_create_no_entry() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, _refreshed) = observed_cache([0, 0, 0], 2);

            // Every lookup of an unknown key invokes the getter once and surfaces its error...
            assert!(cache.get("a", failing_getter!(counter)).await.is_err());
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            assert!(cache.get("a", failing_getter!(counter)).await.is_err());
            assert_eq!(counter.load(Ordering::SeqCst), 2);
            assert!(cache.get("b", failing_getter!(counter)).await.is_err());
            assert_eq!(counter.load(Ordering::SeqCst), 3);

            // ...and no entry is ever created.
            assert!(cache.is_empty());
        });
    }

    #[test]
    fn a_failed_synchronous_recompute_keeps_the_existing_entry() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0, 60, 20], 2);

            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;

            // t=60: the entry is rotten and the synchronous recompute fails...
            assert!(cache.get("a", failing_getter!(counter)).await.is_err());
            assert_eq!(cache.len(), 1);

            // ...leaving value and expiries untouched: a lookup within the original stale
            // window still serves the original value.
            assert_eq!(cache.get("a", || async { Ok(99) }).await.unwrap(), 1);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn failed_background_refreshes_keep_the_stale_value() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0, 10, 10, 60], 2);
            let (failed_tx, mut failed_rx) = unbounded_channel();

            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;

            // t=10: the background refresh fails...
            let failing = {
                let failed_tx = failed_tx.clone();
                move || async move {
                    let _ = failed_tx.send(());
                    anyhow::bail!("simulated backend outage")
                }
            };
            assert_eq!(cache.get("a", failing).await.unwrap(), 1);
            let _ = failed_rx.recv().await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }

            // ...which leaves the entry untouched: the next stale lookup still serves the old
            // value and re-triggers a refresh, as the permit was released...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;

            // ...and once the rotten timeout of the refreshed value has elapsed, the entry is
            // recomputed synchronously as usual.
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 3);
            let _ = refreshed.recv().await;
        });
    }

    #[test]
    fn flush_drops_all_entries() {
        crate::testing::test_async(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let (cache, mut refreshed) = observed_cache([0, 0, 0, 0], 2);

            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 1);
            let _ = refreshed.recv().await;
            assert_eq!(cache.get("b", counting_getter!(counter)).await.unwrap(), 2);
            let _ = refreshed.recv().await;

            cache.flush().await;
            assert!(cache.is_empty());

            // Former entries are recomputed from scratch...
            assert_eq!(cache.get("a", counting_getter!(counter)).await.unwrap(), 3);
            let _ = refreshed.recv().await;
            assert_eq!(cache.len(), 1);
        });
    }
}
