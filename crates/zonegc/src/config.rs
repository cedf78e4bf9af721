//! Runtime configuration.

use crate::gc::incremental::SliceBudget;
use crate::heap::{ARENA_SIZE, MAX_SMALL_OBJECT_SIZE};

/// Default nursery size (1 MiB).
pub const DEFAULT_NURSERY_BYTES: usize = 1 << 20;

/// Default tenured heap limit (256 MiB).
pub const DEFAULT_MAX_HEAP_BYTES: usize = 256 << 20;

/// Default pages per pool chunk (256 KiB chunks).
pub const DEFAULT_CHUNK_PAGES: usize = 64;

/// Default work units per incremental slice.
pub const DEFAULT_SLICE_WORK: usize = 10_000;

/// How the write barrier preserves the tri-color invariant while marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierStrategy {
    /// Shade the stored target gray (insertion barrier).
    #[default]
    ShadeTarget,
    /// Re-gray the holder so it is scanned again.
    RescanHolder,
}

/// Configuration for a [`GcRuntime`](crate::GcRuntime).
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Nursery size in bytes. Zero disables young allocation.
    pub nursery_bytes: usize,
    /// Largest cell (header included) allocated in the nursery; bigger
    /// cells go straight to tenured space. Clamped to the nursery size and
    /// the largest size class.
    pub nursery_max_object_bytes: usize,
    /// Upper bound on memory reserved for tenured arenas.
    pub max_heap_bytes: usize,
    /// Pages per chunk requested from the OS.
    pub chunk_pages: usize,
    /// Honor slice budgets. When false every slice runs its collection to
    /// completion.
    pub incremental: bool,
    /// Budget used by `run_slice` callers that do not pick one.
    pub default_slice_budget: SliceBudget,
    /// Compact a collected zone when this fraction of its small-arena cells
    /// is free. `None` disables compaction outside of zeal and shrinking GCs.
    pub compaction_threshold: Option<f64>,
    /// Threads used to sweep zones in parallel during atomic sweeps.
    pub helper_threads: usize,
    /// Write barrier flavor.
    pub barrier_strategy: BarrierStrategy,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            nursery_bytes: DEFAULT_NURSERY_BYTES,
            nursery_max_object_bytes: MAX_SMALL_OBJECT_SIZE / 4,
            max_heap_bytes: DEFAULT_MAX_HEAP_BYTES,
            chunk_pages: DEFAULT_CHUNK_PAGES,
            incremental: true,
            default_slice_budget: SliceBudget::Work(DEFAULT_SLICE_WORK),
            compaction_threshold: None,
            helper_threads: 0,
            barrier_strategy: BarrierStrategy::ShadeTarget,
        }
    }
}

impl GcConfig {
    /// A configuration with young allocation disabled.
    #[must_use]
    pub fn without_nursery() -> Self {
        Self {
            nursery_bytes: 0,
            ..Self::default()
        }
    }

    /// Effective young-object size limit.
    #[must_use]
    pub fn nursery_object_limit(&self) -> usize {
        self.nursery_max_object_bytes
            .min(self.nursery_bytes)
            .min(MAX_SMALL_OBJECT_SIZE)
    }

    /// The heap limit rounded down to whole arenas.
    #[must_use]
    pub const fn heap_limit(&self) -> usize {
        self.max_heap_bytes / ARENA_SIZE * ARENA_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GcConfig::default();
        assert_eq!(config.nursery_bytes, DEFAULT_NURSERY_BYTES);
        assert!(config.incremental);
        assert_eq!(config.barrier_strategy, BarrierStrategy::ShadeTarget);
        assert!(config.compaction_threshold.is_none());
    }

    #[test]
    fn test_nursery_object_limit_is_clamped() {
        let config = GcConfig {
            nursery_bytes: 256,
            nursery_max_object_bytes: 4096,
            ..GcConfig::default()
        };
        assert_eq!(config.nursery_object_limit(), 256);
        assert_eq!(GcConfig::without_nursery().nursery_object_limit(), 0);
    }
}
