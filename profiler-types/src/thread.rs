use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Metadata about one instrumented thread, as observed by the collector and
/// shipped to the frontend via `threads_info` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: Id,
    pub native_id: u64,
    pub description: String,
    /// Microseconds since the collector's epoch.
    pub start_time: u64,
    /// Cumulative CPU time in microseconds, sampled at drain time.
    pub cpu_time: u64,
    /// Set once the collector has observed the OS thread exit. Flipped at
    /// most one drain cycle after the thread actually terminates.
    pub complete: bool,
}

impl ThreadInfo {
    pub fn new(id: Id, native_id: u64, description: String, start_time: u64) -> Self {
        ThreadInfo {
            id,
            native_id,
            description,
            start_time,
            cpu_time: 0,
            complete: false,
        }
    }
}
