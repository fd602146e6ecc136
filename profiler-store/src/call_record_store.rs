use std::sync::atomic::{AtomicBool, Ordering};

use profiler_types::{CallRecord, CallRecordDelta, Id, IdGenerator, LongAddress, ROOT_CALL_ID};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

/// The indexed call-record table (4.J): an auto-increment primary table
/// with the secondary indexes `by_callnode`, `by_parent` and `by_thread`.
///
/// Ingest enforces the dangling-parent invariant (a record's `parent_id`
/// must already exist, on the same thread, before it can be referenced) and
/// the reentrancy rule: a delta whose address already occurs somewhere on
/// the path from the root to the node being updated has its inclusive-time
/// contribution suppressed, since that time is already attributed to the
/// outermost invocation.
pub struct CallRecordStore {
    ids: IdGenerator,
    by_id: FxHashMap<Id, CallRecord>,
    by_callnode: FxHashMap<(Id, Id, LongAddress), Id>,
    by_parent: FxHashMap<Id, Vec<Id>>,
    by_thread: FxHashMap<Id, Vec<Id>>,
    dirty: AtomicBool,
}

impl Default for CallRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRecordStore {
    pub fn new() -> Self {
        CallRecordStore {
            ids: IdGenerator::new(),
            by_id: FxHashMap::default(),
            by_callnode: FxHashMap::default(),
            by_parent: FxHashMap::default(),
            by_thread: FxHashMap::default(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Applies one delta, creating the call-record node on first sight.
    /// Returns the id of the (possibly newly created) node.
    pub fn ingest(&mut self, delta: &CallRecordDelta) -> Result<Id> {
        if !delta.parent_id.is_root() && !self.by_id.contains_key(&delta.parent_id) {
            return Err(Error::DanglingParent(delta.parent_id.get()));
        }

        let key = (delta.thread_id, delta.parent_id, delta.address);
        let id = match self.by_callnode.get(&key) {
            Some(&id) => id,
            None => {
                let id = self.ids.next();
                self.by_id.insert(
                    id,
                    CallRecord::zero(id, delta.thread_id, delta.parent_id, delta.address),
                );
                self.by_callnode.insert(key, id);
                self.by_parent.entry(delta.parent_id).or_default().push(id);
                self.by_thread.entry(delta.thread_id).or_default().push(id);
                id
            }
        };

        let suppress_inclusive = self.address_recurs_above(delta.parent_id, delta.address);
        let record = self.by_id.get_mut(&id).expect("id was just resolved or inserted above");
        record.apply_delta(delta, suppress_inclusive);
        self.dirty.store(true, Ordering::Release);
        Ok(id)
    }

    /// Walks the `parent_id` chain starting at `ancestor` up to the root,
    /// looking for a node whose address equals `address` (P4).
    fn address_recurs_above(&self, mut ancestor: Id, address: LongAddress) -> bool {
        while !ancestor.is_root() {
            let Some(record) = self.by_id.get(&ancestor) else {
                break;
            };
            if record.address == address {
                return true;
            }
            ancestor = record.parent_id;
        }
        false
    }

    pub fn get(&self, id: Id) -> Option<&CallRecord> {
        self.by_id.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &CallRecord> {
        self.by_id.values()
    }

    pub fn children_of(&self, parent_id: Id) -> impl Iterator<Item = &CallRecord> {
        self.by_parent
            .get(&parent_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
    }

    pub fn thread_records(&self, thread_id: Id) -> impl Iterator<Item = &CallRecord> {
        self.by_thread
            .get(&thread_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
    }

    /// Returns whether any ingest happened since the last call, resetting
    /// the flag. Coalesces any number of writes within a drain cycle into a
    /// single signal, per 4.J.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn delta(thread_id: Id, parent_id: Id, address: LongAddress, inclusive_time: u64, exclusive_time: u64) -> CallRecordDelta {
    CallRecordDelta {
        thread_id,
        parent_id,
        address,
        times_called: 1,
        inclusive_time,
        exclusive_time,
        max_reentrance: 0,
        max_call_time: inclusive_time,
        histogram: None,
    }
}
