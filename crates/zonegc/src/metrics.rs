//! GC metrics and statistics.
//!
//! Every runtime keeps its own metrics: the last collection's [`GcMetrics`],
//! cumulative [`GcStats`], and a short [`GcHistory`] of recent collections.
//! Nothing here is process-global, so independent runtimes never observe
//! each other's numbers.

use std::time::{Duration, Instant};

/// Number of collections kept in [`GcHistory`].
pub const HISTORY_SIZE: usize = 64;

/// Why a collection ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GcReason {
    /// No collection has run yet.
    #[default]
    None,
    /// Requested through the public API.
    Api,
    /// The nursery filled up.
    NurseryFull,
    /// The page pool was exhausted.
    OutOfMemory,
    /// A zeal mode triggered it.
    Zeal,
    /// Nursery eviction before installing mark observers.
    Eviction,
    /// A zone is being destroyed.
    DestroyZone,
    /// The runtime is shutting down.
    Shutdown,
}

impl GcReason {
    /// Short name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Api => "api",
            Self::NurseryFull => "nursery_full",
            Self::OutOfMemory => "out_of_memory",
            Self::Zeal => "zeal",
            Self::Eviction => "eviction",
            Self::DestroyZone => "destroy_zone",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Type of GC collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// A minor collection (nursery only).
    Minor = 1,
    /// A major collection finished within one call.
    Major = 2,
    /// A major collection spread over several slices.
    IncrementalMajor = 3,
}

/// Statistics from one collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Wall time from start to finish. For incremental collections this
    /// includes mutator time between slices.
    pub duration: Duration,
    /// Time spent inside collector slices.
    pub pause_total: Duration,
    /// Longest single slice.
    pub max_pause: Duration,
    /// Bytes reclaimed.
    pub bytes_reclaimed: usize,
    /// Bytes surviving in collected zones.
    pub bytes_surviving: usize,
    /// Cells reclaimed.
    pub cells_reclaimed: usize,
    /// Cells surviving in collected zones.
    pub cells_surviving: usize,
    /// Type of collection.
    pub collection_type: CollectionType,
    /// Why it ran.
    pub reason: GcReason,
    /// Collections of this runtime so far, this one included.
    pub total_collections: usize,
    /// Zones collected.
    pub zones_collected: usize,
    /// Duration of the prepare phase.
    pub prepare_duration: Duration,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Duration of the compact phase.
    pub compact_duration: Duration,
    /// Cells marked.
    pub cells_marked: usize,
    /// Slices executed.
    pub slices_executed: usize,
    /// Nursery cells promoted (minor collections).
    pub cells_promoted: usize,
    /// Cells moved by compaction.
    pub cells_relocated: usize,
    /// Arenas returned to the page pool.
    pub arenas_released: usize,
    /// Finalizers run.
    pub finalizers_run: usize,
    /// Whether the remaining work was forced through in one go.
    pub aborted_forward: bool,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            pause_total: Duration::ZERO,
            max_pause: Duration::ZERO,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            cells_reclaimed: 0,
            cells_surviving: 0,
            collection_type: CollectionType::None,
            reason: GcReason::None,
            total_collections: 0,
            zones_collected: 0,
            prepare_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            compact_duration: Duration::ZERO,
            cells_marked: 0,
            slices_executed: 0,
            cells_promoted: 0,
            cells_relocated: 0,
            arenas_released: 0,
            finalizers_run: 0,
            aborted_forward: false,
        }
    }
}

/// Phases whose time [`PhaseTimer`] accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedPhase {
    /// Zone selection and root snapshot.
    Prepare,
    /// Marking.
    Mark,
    /// Sweeping.
    Sweep,
    /// Compaction.
    Compact,
}

/// Accumulates per-phase durations across the slices of one collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated prepare time.
    pub prepare: Duration,
    /// Accumulated mark time.
    pub mark: Duration,
    /// Accumulated sweep time.
    pub sweep: Duration,
    /// Accumulated compact time.
    pub compact: Duration,
    current: Option<(TimedPhase, Instant)>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prepare: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            compact: Duration::ZERO,
            current: None,
        }
    }

    /// Start timing a phase, ending any phase in progress.
    pub fn start(&mut self, phase: TimedPhase) {
        self.end();
        self.current = Some((phase, Instant::now()));
    }

    /// End the phase in progress and add its duration.
    pub fn end(&mut self) {
        if let Some((phase, start)) = self.current.take() {
            let elapsed = start.elapsed();
            match phase {
                TimedPhase::Prepare => self.prepare += elapsed,
                TimedPhase::Mark => self.mark += elapsed,
                TimedPhase::Sweep => self.sweep += elapsed,
                TimedPhase::Compact => self.compact += elapsed,
            }
        }
    }
}

/// Cumulative statistics of one runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// All collections.
    pub collections: usize,
    /// Minor collections.
    pub minor_collections: usize,
    /// Major collections completed in one call.
    pub major_collections: usize,
    /// Major collections spread over several slices.
    pub incremental_collections: usize,
    /// Collections that had to be forced to completion.
    pub aborted_forward: usize,
    /// Bytes reclaimed.
    pub bytes_reclaimed: usize,
    /// Cells reclaimed.
    pub cells_reclaimed: usize,
    /// Cells promoted out of the nursery.
    pub cells_promoted: usize,
    /// Cells moved by compaction.
    pub cells_relocated: usize,
    /// Total collector pause time in nanoseconds.
    pub pause_ns: u64,
}

/// Ring buffer of recent collection metrics.
#[derive(Debug, Clone)]
pub struct GcHistory {
    buffer: Vec<GcMetrics>,
    write_idx: usize,
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(HISTORY_SIZE),
            write_idx: 0,
        }
    }

    fn push(&mut self, metrics: GcMetrics) {
        if self.buffer.len() < HISTORY_SIZE {
            self.buffer.push(metrics);
        } else {
            self.buffer[self.write_idx % HISTORY_SIZE] = metrics;
        }
        self.write_idx += 1;
    }

    /// Get the total number of metrics recorded.
    ///
    /// This may exceed `HISTORY_SIZE` if more collections have occurred
    /// than the buffer can hold.
    #[must_use]
    pub const fn total_recorded(&self) -> usize {
        self.write_idx
    }

    /// The most recent `n` entries, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let total = self.write_idx;
        let n = n.min(self.buffer.len());
        (total - n..total)
            .map(|i| self.buffer[i % HISTORY_SIZE])
            .collect()
    }

    /// Average pause time of the most recent `n` collections.
    ///
    /// Returns `Duration::ZERO` if no collections have been recorded.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(|m| m.pause_total).sum();
        total / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    /// Longest single pause among the most recent `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.max_pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Per-runtime metrics sink.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    last: GcMetrics,
    stats: GcStats,
    history: GcHistory,
}

impl MetricsRecorder {
    pub(crate) fn record(&mut self, mut metrics: GcMetrics) {
        self.stats.collections += 1;
        match metrics.collection_type {
            CollectionType::Minor => self.stats.minor_collections += 1,
            CollectionType::Major => self.stats.major_collections += 1,
            CollectionType::IncrementalMajor => self.stats.incremental_collections += 1,
            CollectionType::None => {}
        }
        if metrics.aborted_forward {
            self.stats.aborted_forward += 1;
        }
        self.stats.bytes_reclaimed += metrics.bytes_reclaimed;
        self.stats.cells_reclaimed += metrics.cells_reclaimed;
        self.stats.cells_promoted += metrics.cells_promoted;
        self.stats.cells_relocated += metrics.cells_relocated;
        self.stats.pause_ns += u64::try_from(metrics.pause_total.as_nanos()).unwrap_or(u64::MAX);

        metrics.total_collections = self.stats.collections;
        self.last = metrics;
        self.history.push(metrics);
    }

    pub(crate) const fn last(&self) -> GcMetrics {
        self.last
    }

    pub(crate) const fn stats(&self) -> GcStats {
        self.stats
    }

    pub(crate) const fn history(&self) -> &GcHistory {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_accumulates() {
        let mut timer = PhaseTimer::new();
        timer.start(TimedPhase::Mark);
        std::thread::sleep(Duration::from_millis(1));
        timer.start(TimedPhase::Sweep);
        timer.end();
        timer.start(TimedPhase::Mark);
        timer.end();
        assert!(timer.mark >= Duration::from_millis(1));
        assert_eq!(timer.compact, Duration::ZERO);
    }

    #[test]
    fn test_recorder_counts_by_type() {
        let mut recorder = MetricsRecorder::default();
        recorder.record(GcMetrics {
            collection_type: CollectionType::Minor,
            cells_promoted: 3,
            ..GcMetrics::new()
        });
        recorder.record(GcMetrics {
            collection_type: CollectionType::IncrementalMajor,
            bytes_reclaimed: 64,
            aborted_forward: true,
            ..GcMetrics::new()
        });
        let stats = recorder.stats();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.minor_collections, 1);
        assert_eq!(stats.incremental_collections, 1);
        assert_eq!(stats.aborted_forward, 1);
        assert_eq!(stats.cells_promoted, 3);
        assert_eq!(recorder.last().total_collections, 2);
        assert_eq!(recorder.last().bytes_reclaimed, 64);
    }

    #[test]
    fn test_history_wraps() {
        let mut history = GcHistory::new();
        for i in 0..(HISTORY_SIZE + 5) {
            history.push(GcMetrics {
                cells_marked: i,
                ..GcMetrics::new()
            });
        }
        assert_eq!(history.total_recorded(), HISTORY_SIZE + 5);
        let recent = history.recent(3);
        assert_eq!(
            recent.iter().map(|m| m.cells_marked).collect::<Vec<_>>(),
            vec![HISTORY_SIZE + 2, HISTORY_SIZE + 3, HISTORY_SIZE + 4]
        );
        assert_eq!(history.recent(1000).len(), HISTORY_SIZE);
    }
}
