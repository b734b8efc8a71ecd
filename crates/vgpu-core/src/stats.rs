use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! engine_counters {
    ($($(#[$doc:meta])* $name:ident => $inc:ident),* $(,)?) => {
        /// Telemetry counters for the engine.
        ///
        /// Cheap to bump from any manager; readers take a [`EngineStatsSnapshot`].
        #[derive(Debug, Default)]
        pub struct EngineStats {
            $($(#[$doc])* $name: AtomicU64,)*
        }

        impl EngineStats {
            $(
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> EngineStatsSnapshot {
                EngineStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }

        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct EngineStatsSnapshot {
            $(pub $name: u64,)*
        }
    };
}

engine_counters! {
    buffers_created => inc_buffers_created,
    buffers_destroyed => inc_buffers_destroyed,
    buffers_discarded => inc_buffers_discarded,
    /// Registry evictions of live buffers.
    buffers_evicted => inc_buffers_evicted,
    buffers_completed => inc_buffers_completed,
    pool_expansions => inc_pool_expansions,
    pool_sibling_fallbacks => inc_pool_sibling_fallbacks,
    pool_exhausted => inc_pool_exhausted,
    submissions => inc_submissions,
    submission_failures => inc_submission_failures,
    hazards_detected => inc_hazards_detected,
    hazards_dropped => inc_hazards_dropped,
    sync_primitives => inc_sync_primitives,
    device_barriers => inc_device_barriers,
    software_barriers => inc_software_barriers,
    memory_allocations => inc_memory_allocations,
    memory_frees => inc_memory_frees,
    memory_expansions => inc_memory_expansions,
    memory_sibling_fallbacks => inc_memory_sibling_fallbacks,
    memory_failures => inc_memory_failures,
    transfers_immediate => inc_transfers_immediate,
    transfers_batched => inc_transfers_batched,
    /// Large low-priority transfers held back while the device was busy.
    transfers_deferred => inc_transfers_deferred,
    batch_flushes => inc_batch_flushes,
    coherency_hits => inc_coherency_hits,
    coherency_misses => inc_coherency_misses,
    coherency_flushes => inc_coherency_flushes,
    frame_ticks => inc_frame_ticks,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hazards(&self, detected: usize, dropped: usize) {
        self.hazards_detected
            .fetch_add(detected as u64, Ordering::Relaxed);
        self.hazards_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn add_sync_primitives(&self, n: usize) {
        self.sync_primitives.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

impl EngineStatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
