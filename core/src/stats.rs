//! Adapter counters.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! adapter_stats {
    ($($field:ident: $doc:literal),* $(,)?) => {
        /// Live counters, bumped lock-free from any context
        #[derive(Debug, Default)]
        pub struct AdapterStats {
            $(#[doc = $doc] pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of [`AdapterStats`]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct StatsSnapshot {
            $(#[doc = $doc] pub $field: u64,)*
        }

        impl AdapterStats {
            /// Read every counter
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

adapter_stats! {
    events_queued: "Firmware events accepted",
    events_processed: "Firmware events run to completion",
    events_ignored: "Firmware events discarded as superseded",
    events_requeued: "Firmware events moved to the delayed queue",
    devices_added: "Devices registered",
    devices_removed: "Devices unregistered",
    discovery_errors: "Devices skipped because of discovery errors",
    tm_issued: "Task-management requests sent",
    tm_failed: "Task-management requests that failed",
    tm_timeouts: "Task-management requests that timed out",
    handshakes_started: "Removal handshakes started",
    handshakes_deferred: "Removal handshake stages parked for lack of a slot",
    handshakes_completed: "Removal handshakes confirmed by the firmware",
    handshakes_exhausted: "Removal handshakes that ran out of retries",
    resets: "Host resets completed",
    reset_failures: "Host resets that failed",
}

impl AdapterStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = AdapterStats::new();
        AdapterStats::bump(&stats.resets);
        AdapterStats::bump(&stats.resets);
        AdapterStats::bump(&stats.tm_issued);
        let snap = stats.snapshot();
        assert_eq!(snap.resets, 2);
        assert_eq!(snap.tm_issued, 1);
        assert_eq!(snap.events_ignored, 0);
    }
}
