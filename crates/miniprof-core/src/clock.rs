//! Time sources for live profiling.
//!
//! A profiler records every offset as "milliseconds since the profile
//! started", measured on a [`Clock`]. Production code uses the monotonic
//! [`SystemClock`]; tests drive a [`ManualClock`] so that durations are exact.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A monotonic millisecond counter.
///
/// Only differences between readings are meaningful; the origin is
/// arbitrary but fixed for the lifetime of the clock.
pub trait Clock: Debug + Send + Sync {
    /// Current reading in milliseconds.
    fn now_ms(&self) -> f64;
}

/// Monotonic wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same reading, so a test can keep one copy and hand
/// another to the profiler.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Creates a clock reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `ms`.
    pub fn advance(&self, ms: f64) {
        *self.now.lock().expect("clock lock poisoned") += ms;
    }

    /// Sets the reading to `ms`.
    pub fn set(&self, ms: f64) {
        *self.now.lock().expect("clock lock poisoned") = ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Shared, type-erased clock handle as stored by profilers.
pub type SharedClock = Arc<dyn Clock>;
