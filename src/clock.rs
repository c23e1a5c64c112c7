//! ==============================================================================
//! clock.rs - millisecond wall clock
//! ==============================================================================
//!
//! purpose:
//!     every timestamp in this crate (updatedAt, lastSeen, cache entries, echo
//!     windows) is unix epoch milliseconds. components read time through the
//!     `Clock` trait so tests can drive it by hand.
//!
//! relationships:
//!     - used by: store.rs, presence.rs, cache.rs, agent/echo.rs
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// source of "now" in unix epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// the real wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        get_timestamp_ms()
    }
}

/// a clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self { now: AtomicU64::new(start_ms) })
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// get current timestamp in milliseconds (unix epoch)
pub fn get_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}
