//! Provides the time source consulted by the caches.
//!
//! Every cache lookup reads the current instant exactly once and derives all freshness decisions
//! from that single reading. The instant is a plain unix timestamp in seconds, which is all the
//! resolution the caches need, as their timeouts are measured in seconds anyway.
//!
//! Production code uses [SystemClock] which simply reads the wall clock. Tests use a
//! [ScriptedClock] which is loaded with a finite sequence of instants up front and hands them out
//! one per query. This turns all time-window behavior of the caches into a deterministic function
//! of the script, without ever sleeping in a test.
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Yields the current instant as a unix timestamp in seconds.
///
/// This is deliberately a single-method capability so that a cache can be wired against a scripted
/// time source in tests.
pub trait Clock: Send + Sync {
    /// Returns "now" in seconds since the unix epoch.
    fn now(&self) -> i64;
}

/// A [Clock] backed by the wall clock.
#[derive(Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new wall clock.
    pub fn new() -> Self {
        SystemClock
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A [Clock] which replays a pre-loaded sequence of instants.
///
/// Each call to [now](Clock::now) consumes the next instant of the script. Querying an exhausted
/// script is a fatal test setup error and panics, as continuing with some made-up instant would
/// silently invalidate whatever the test tries to prove.
///
/// # Example
/// ```
/// # use larder::clock::{Clock, ScriptedClock};
/// let clock = ScriptedClock::new([0, 10]);
/// assert_eq!(clock.now(), 0);
/// assert_eq!(clock.now(), 10);
/// ```
pub struct ScriptedClock {
    instants: Mutex<VecDeque<i64>>,
}

impl ScriptedClock {
    /// Creates a clock which will report the given instants, one per query, in order.
    pub fn new(instants: impl IntoIterator<Item = i64>) -> Self {
        ScriptedClock {
            instants: Mutex::new(instants.into_iter().collect()),
        }
    }
}

impl Clock for ScriptedClock {
    /// Returns the next scripted instant.
    ///
    /// # Panics
    /// Panics if the script has been exhausted.
    fn now(&self) -> i64 {
        self.instants
            .lock()
            .unwrap()
            .pop_front()
            .expect("The scripted clock was queried more often than instants were provided!")
    }
}
