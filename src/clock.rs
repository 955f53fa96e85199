//! Time source abstraction.
//!
//! Every component reads "now" through a [`Clock`] rather than calling
//! `chrono::Utc::now()` directly, so tests can advance time deterministically
//! instead of sleeping real wall-clock milliseconds to exercise windows,
//! cooldowns, and TTLs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::types::TimestampMs;

/// Source of the current time, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time, milliseconds since epoch.
    fn now_ms(&self) -> TimestampMs;
}

/// Wall-clock implementation backed by `chrono::Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_ms(&self) -> TimestampMs {
        Utc::now().timestamp_millis()
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when [`VirtualClock::advance`] is called.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: Arc<AtomicI64>,
}

impl VirtualClock {
    /// Create a virtual clock starting at `start_ms`.
    pub fn new(start_ms: TimestampMs) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Move the clock forward by `delta_ms` milliseconds.
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, at_ms: TimestampMs) {
        self.now.store(at_ms, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared, cloneable handle to a [`Clock`] implementation.
pub type SharedClock = Arc<dyn Clock>;
