//! Larder is a small library providing refresh-ahead (stale-while-revalidate) in-process caches.
//!
//! # Introduction
//! A common problem when building services on top of slow backends (databases, external APIs,
//! secret stores) is that a plain TTL cache turns every expiry into a latency spike: the first
//! request after the TTL has elapsed pays the full cost of recomputing the value while all other
//! requests either pile up behind it or hammer the backend in parallel.
//!
//! **Larder** solves this by giving every cached value two lifetimes instead of one. After the
//! *refresh timeout* has elapsed, a value is considered **stale**: it is still served immediately,
//! but a single background task is dispatched to recompute it. Only after the *rotten timeout* has
//! elapsed as well (or if no value was ever computed) does a request block and recompute the value
//! synchronously. This way the latency of a lookup is bounded by the cache itself for as long as
//! the data is even remotely usable, and the expensive computation runs at most once per refresh
//! cycle no matter how many concurrent callers there are.
//!
//! # Modules
//! * **cache**: Provides the two cache flavours: [KeyValueCache](cache::KeyValueCache), a bounded
//!   string-keyed cache with least-recently-used eviction, and [ValueCache](cache::ValueCache),
//!   which caches a single value. See [crate::cache] for a description of the freshness state
//!   machine both are built on.
//! * **clock**: The time source used by the caches. Production code uses the wall clock via
//!   [SystemClock](clock::SystemClock), tests script every instant up front using a
//!   [ScriptedClock](clock::ScriptedClock) which makes all time-window behavior fully
//!   deterministic. See [crate::clock].
//!
//! # Example
//! ```
//! use larder::cache::KeyValueCache;
//! use larder::clock::SystemClock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! // Up to 1024 entries, stale after 15s, unusable after 60s...
//! let cache = KeyValueCache::new(
//!     Arc::new(SystemClock::new()),
//!     1024,
//!     Duration::from_secs(15),
//!     Duration::from_secs(60),
//! );
//!
//! // The getter is only invoked when no usable value is cached...
//! let value = cache.get("answer", || async { Ok(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod cache;
pub mod clock;

/// Initializes the logging system.
///
/// The caches only log sparsely (most notably when a background refresh fails), therefore this is
/// entirely optional. Embedding applications which bring their own logger should simply not call
/// this.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate larder;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
