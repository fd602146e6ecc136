//! The in-process half of the profiler: a per-thread trace ring with a
//! shadow return stack (C2), a thread registry that owns one ring per
//! instrumented thread, and a module tracker that assigns stable IDs across
//! reloads of the same file.

mod aggregator;
mod collector;
mod error;
mod gate;
mod module_tracker;
mod trace;

pub use aggregator::StatisticsAggregator;
pub use collector::{
    global, install_global, on_enter_trampoline, on_exit_trampoline, Collector,
    DEFAULT_TRACE_LIMIT_EVENTS,
};
pub use error::{Error, Result};
pub use module_tracker::ModuleTracker;
pub use trace::PerThreadTrace;
