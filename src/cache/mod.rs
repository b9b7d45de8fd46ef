//! Provides refresh-ahead caches which trade bounded staleness for bounded latency.
//!
//! Both caches in this module wrap an expensive fallible computation (the *getter*) and answer
//! lookups from memory whenever possible. The idea is quite simple: every stored value carries two
//! expiry instants which partition time into three states. While a value is **fresh** it is
//! returned as is. Once its refresh timeout has elapsed it becomes **stale**: it is still returned
//! immediately, but the first caller to observe this dispatches a single background task which
//! recomputes the value and swaps it in once done. All concurrent callers within the stale window
//! keep receiving the old value without waiting - only one recomputation is ever in flight. Only
//! once the rotten timeout has elapsed as well (or for a key that was never computed) does a
//! lookup block and run the getter synchronously.
//!
//! This works well for data where serving a slightly outdated value is acceptable, which is
//! typically the case for configuration, master data or expensive aggregations. In exchange, the
//! backend sees at most one recomputation per refresh cycle and callers almost never wait for it.
//!
//! Two flavours are provided:
//! * [KeyValueCache] stores many entries under string keys, holds at most a fixed number of them
//!   and evicts the least recently used entry once full.
//! * [ValueCache] stores a single value and is the natural fit for "the one expensive thing"
//!   (a service token, a parsed remote config, ...).
//!
//! A failed recomputation never destroys previously cached data: the synchronous path propagates
//! the getter error to its caller and leaves the cache untouched, a failed background refresh is
//! logged and dropped so that the next stale lookup simply tries again.
mod linked_list;
mod sync_map;

pub mod key_value;
pub mod value;

pub use key_value::KeyValueCache;
pub use value::ValueCache;
