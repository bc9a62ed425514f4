//! # Time Source
//!
//! Monotonic millisecond clock used for bounded waits and delayed work.

/// Monotonic clock abstraction
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Block the calling context for at least `ms` milliseconds
    fn delay_ms(&self, ms: u64);
}

/// A deadline computed from a [`Clock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(u64);

impl Deadline {
    /// Deadline `timeout_ms` from now
    pub fn after(clock: &dyn Clock, timeout_ms: u64) -> Self {
        Self(clock.now_ms().saturating_add(timeout_ms))
    }

    /// Whether the deadline has passed
    pub fn expired(self, clock: &dyn Clock) -> bool {
        clock.now_ms() >= self.0
    }

    /// Absolute expiry time
    pub const fn at_ms(self) -> u64 {
        self.0
    }
}
