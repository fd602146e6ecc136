use serde::{Deserialize, Serialize};

use crate::histogram::Histogram;
use crate::ids::{Id, LongAddress};

/// One `(thread_id, parent_id, address)` aggregation bucket.
///
/// `parent_id == 0` means this record is a root call on its thread.
/// `inclusive_time` excludes time attributed to a reentrant invocation of
/// the same address on the same thread (see the reentrancy rule in
/// `profiler-store`); `exclusive_time` is inclusive minus the sum of
/// children's inclusive times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Id,
    pub thread_id: Id,
    pub parent_id: Id,
    pub address: LongAddress,
    pub times_called: u64,
    pub inclusive_time: u64,
    pub exclusive_time: u64,
    pub max_reentrance: u32,
    pub max_call_time: u64,
    pub histogram: Option<Histogram>,
}

impl CallRecord {
    pub fn zero(id: Id, thread_id: Id, parent_id: Id, address: LongAddress) -> Self {
        CallRecord {
            id,
            thread_id,
            parent_id,
            address,
            times_called: 0,
            inclusive_time: 0,
            exclusive_time: 0,
            max_reentrance: 0,
            max_call_time: 0,
            histogram: None,
        }
    }

    pub fn key(&self) -> (Id, Id, LongAddress) {
        (self.thread_id, self.parent_id, self.address)
    }

    /// Applies one statistics delta to this record, per spec.md §4.J.
    /// `suppress_inclusive` must be `true` when `address` occurs elsewhere
    /// on the path from the root to this node (the reentrancy rule).
    pub fn apply_delta(&mut self, delta: &CallRecordDelta, suppress_inclusive: bool) {
        self.times_called += delta.times_called;
        if !suppress_inclusive {
            self.inclusive_time += delta.inclusive_time;
        }
        self.exclusive_time += delta.exclusive_time;
        self.max_reentrance = self.max_reentrance.max(delta.max_reentrance);
        self.max_call_time = self.max_call_time.max(delta.max_call_time);
        if let Some(delta_hist) = &delta.histogram {
            self.histogram
                .get_or_insert_with(Histogram::new)
                .merge(delta_hist);
        }
    }
}

/// A delta to apply to a [`CallRecord`], as carried by `statistics_update`
/// protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecordDelta {
    pub thread_id: Id,
    pub parent_id: Id,
    pub address: LongAddress,
    pub times_called: u64,
    pub inclusive_time: u64,
    pub exclusive_time: u64,
    pub max_reentrance: u32,
    pub max_call_time: u64,
    pub histogram: Option<Histogram>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_delta_suppresses_inclusive_on_reentrance() {
        let mut record = CallRecord::zero(Id(1), Id(1), Id(0), 501);
        let delta = CallRecordDelta {
            thread_id: Id(1),
            parent_id: Id(0),
            address: 501,
            times_called: 1,
            inclusive_time: 100,
            exclusive_time: 40,
            max_reentrance: 0,
            max_call_time: 100,
            histogram: None,
        };
        record.apply_delta(&delta, false);
        assert_eq!(record.inclusive_time, 100);

        let reentrant_delta = CallRecordDelta {
            thread_id: Id(1),
            parent_id: Id(1),
            address: 501,
            times_called: 1,
            inclusive_time: 30,
            exclusive_time: 20,
            max_reentrance: 1,
            max_call_time: 30,
            histogram: None,
        };
        let mut child = CallRecord::zero(Id(2), Id(1), Id(1), 501);
        child.apply_delta(&reentrant_delta, true);
        assert_eq!(child.inclusive_time, 0);
        assert_eq!(child.exclusive_time, 20);
        assert_eq!(child.max_reentrance, 1);
    }
}
