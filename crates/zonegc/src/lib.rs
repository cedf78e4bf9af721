//! A zoned, generational, incremental garbage collector core for a
//! JavaScript engine.
//!
//! `zonegc` manages a heap of fixed-layout cells. Each cell belongs to a
//! [`Zone`]; zones can be collected on their own or all together. New cells
//! are bump-allocated in a nursery and promoted to the tenured heap by minor
//! collections. Tenured memory uses a **`BiBOP` (Big Bag of Pages)** layout
//! and is collected by an **incremental mark-and-sweep** collector with
//! optional compaction.
//!
//! # Features
//!
//! - **Zones**: per-zone collection, with cross-zone edges as roots
//! - **Generational**: copying nursery with a store buffer
//! - **Incremental**: budgeted slices kept sound by write barriers
//! - **Weak maps**: ephemeron semantics resolved to a fixed point
//! - **Compaction**: evacuates sparse arenas and patches every reference
//!
//! # Quick Start
//!
//! ```
//! use zonegc::{GcRuntime, KindId, Value};
//!
//! let mut rt = GcRuntime::with_defaults().unwrap();
//! let zone = rt.create_zone().unwrap();
//!
//! let list = rt.allocate(zone, KindId::OBJECT, 2).unwrap();
//! let root = rt.add_root(list);
//! let item = rt.allocate_young(zone, KindId::OBJECT, 0).unwrap();
//! rt.store(list, 0, Value::cell(item)).unwrap();
//!
//! rt.gc();
//! let list = rt.root(root).unwrap();
//! assert!(rt.get_slot(list, 0).unwrap().as_cell().is_some());
//! ```
//!
//! # Incremental collection
//!
//! ```
//! use zonegc::{GcRuntime, GcScope, SliceBudget, SliceOutcome};
//!
//! let mut rt = GcRuntime::with_defaults().unwrap();
//! let mut outcome = rt.start_collection(GcScope::Full, SliceBudget::Work(100)).unwrap();
//! while !outcome.is_finished() {
//!     // the mutator runs here, storing through `GcRuntime::store`
//!     outcome = rt.run_slice(SliceBudget::Work(100));
//! }
//! assert_eq!(rt.gcstate(), "NotActive");
//! ```
//!
//! # Threads
//!
//! A runtime has a single mutator. Nothing is process-global: separate
//! runtimes never share cells, roots or metrics.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cell;
pub mod config;
pub mod error;
pub mod gc;
pub mod metrics;
pub mod nursery;
pub mod roots;
pub mod runtime;
pub mod testing;
pub mod trace;
pub mod tracing;
pub mod zone;

/// `BiBOP` memory management internals.
///
/// This module is public for testing and advanced use cases.
/// Most users should go through [`GcRuntime`].
pub mod heap;

// Re-export public API
pub use cell::{
    CellPtr, FinalizeFn, KindId, KindInfo, KindRegistry, MarkColor, Space, TraceFn, Value,
    MAX_SLOTS,
};
pub use config::{BarrierStrategy, GcConfig};
pub use error::{GcError, Violation, ViolationKind};
pub use gc::{
    AllZones, AllocationThreshold, EphemeronTable, GcScope, GcState, SliceBudget, SliceOutcome,
    ZonePolicy, ZoneUsage,
};
pub use metrics::{CollectionType, GcHistory, GcMetrics, GcReason, GcStats};
pub use roots::{RootId, RootTable};
pub use runtime::GcRuntime;
pub use testing::ZealMode;
pub use trace::{trace_all_slots, trace_nothing, TraceMode, Tracer};
pub use zone::{CrossZoneEdge, Zone, ZoneGcState, ZoneId};
