use profiler_types::{CallRecord, Histogram, Id, LongAddress, ROOT_CALL_ID};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::call_record_store::CallRecordStore;

/// `addresses(selection, hierarchy)` (4.K): translates a selection of call
/// record ids to the distinct set of addresses they name.
pub fn addresses(store: &CallRecordStore, selection: &[Id]) -> FxHashSet<LongAddress> {
    selection
        .iter()
        .filter_map(|id| store.get(*id))
        .map(|record| record.address)
        .collect()
}

fn accumulate(target: &mut CallRecord, source: &CallRecord) {
    target.times_called += source.times_called;
    target.inclusive_time += source.inclusive_time;
    target.exclusive_time += source.exclusive_time;
    target.max_reentrance = target.max_reentrance.max(source.max_reentrance);
    target.max_call_time = target.max_call_time.max(source.max_call_time);
    if let Some(histogram) = &source.histogram {
        target
            .histogram
            .get_or_insert_with(Histogram::new)
            .merge(histogram);
    }
}

/// `callers(addresses, hierarchy)` (4.K): for every record whose address is
/// in `addresses`, aggregates into a synthesized row keyed by
/// `(thread_id, 0, parent_address)` — `parent_address` is `0` when the
/// record is a root call. A caller whose address itself is in `addresses`
/// is a recursive self-call and is dropped, matching the reentrancy rule of
/// 4.J: that time is already attributed to the outermost invocation.
pub fn callers(store: &CallRecordStore, addresses: &FxHashSet<LongAddress>) -> Vec<CallRecord> {
    let mut out: FxHashMap<(Id, LongAddress), CallRecord> = FxHashMap::default();
    for record in store.records() {
        if !addresses.contains(&record.address) {
            continue;
        }
        let parent_address = if record.parent_id.is_root() {
            0
        } else {
            match store.get(record.parent_id) {
                Some(parent) => parent.address,
                None => continue,
            }
        };
        if addresses.contains(&parent_address) {
            continue;
        }
        let entry = out
            .entry((record.thread_id, parent_address))
            .or_insert_with(|| CallRecord::zero(ROOT_CALL_ID, record.thread_id, ROOT_CALL_ID, parent_address));
        accumulate(entry, record);
    }
    out.into_values().collect()
}

/// `callees(addresses, hierarchy)` (4.K): for every record whose address is
/// in `addresses`, enumerates its children and aggregates them into a
/// synthesized row keyed by `(thread_id, 0, child_address)`. A child whose
/// address is itself in `addresses` is a recursive self-call and is
/// dropped, same rule as [`callers`].
pub fn callees(store: &CallRecordStore, addresses: &FxHashSet<LongAddress>) -> Vec<CallRecord> {
    let mut out: FxHashMap<(Id, LongAddress), CallRecord> = FxHashMap::default();
    for parent in store.records() {
        if !addresses.contains(&parent.address) {
            continue;
        }
        for child in store.children_of(parent.id) {
            if addresses.contains(&child.address) {
                continue;
            }
            let entry = out
                .entry((child.thread_id, child.address))
                .or_insert_with(|| CallRecord::zero(ROOT_CALL_ID, child.thread_id, ROOT_CALL_ID, child.address));
            accumulate(entry, child);
        }
    }
    out.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use profiler_types::CallRecordDelta;

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

    /// S2: recursion-aware aggregation.
    #[test]
    fn s2_recursion_aware_callee_aggregation() {
        let mut store = CallRecordStore::new();
        let r1 = store.ingest(&delta(Id(1), ROOT_CALL_ID, 501, 100, 40)).unwrap();
        store.ingest(&delta(Id(1), r1, 501, 30, 20)).unwrap();
        store.ingest(&delta(Id(1), ROOT_CALL_ID, 200, 50, 50)).unwrap();

        let selection = vec![r1];
        let selected_addresses = addresses(&store, &selection);
        assert_eq!(selected_addresses, FxHashSet::from_iter([501]));
        assert!(callees(&store, &selected_addresses).is_empty());

        store.ingest(&delta(Id(1), r1, 600, 10, 10)).unwrap();
        let result = callees(&store, &selected_addresses);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].thread_id, Id(1));
        assert_eq!(result[0].address, 600);
        assert_eq!(result[0].inclusive_time, 10);
        assert_eq!(result[0].exclusive_time, 10);
    }

    /// S3: callers with parent = null synthesize address 0.
    #[test]
    fn s3_callers_with_root_parent_synthesize_address_zero() {
        let mut store = CallRecordStore::new();
        let r1 = store.ingest(&delta(Id(9), ROOT_CALL_ID, 501, 104, 37)).unwrap();

        let selected_addresses = addresses(&store, &[r1]);
        let result = callers(&store, &selected_addresses);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].thread_id, Id(9));
        assert_eq!(result[0].address, 0);
        assert_eq!(result[0].inclusive_time, 104);
        assert_eq!(result[0].exclusive_time, 37);
    }

    #[test]
    fn callers_aggregate_distinct_call_sites_of_the_same_address() {
        let mut store = CallRecordStore::new();
        let a = store.ingest(&delta(Id(1), ROOT_CALL_ID, 123, 0, 0)).unwrap();
        let b = store.ingest(&delta(Id(1), ROOT_CALL_ID, 124, 0, 0)).unwrap();
        store.ingest(&delta(Id(1), a, 501, 10, 5)).unwrap();
        store.ingest(&delta(Id(1), b, 501, 20, 7)).unwrap();

        let selected_addresses = FxHashSet::from_iter([501]);
        let mut result = callers(&store, &selected_addresses);
        result.sort_by_key(|r| r.address);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].address, 123);
        assert_eq!(result[0].inclusive_time, 10);
        assert_eq!(result[1].address, 124);
        assert_eq!(result[1].inclusive_time, 20);
    }

    /// P5: derived views depend only on the hierarchy and the selection.
    #[test]
    fn derived_views_are_pure_functions_of_hierarchy_and_selection() {
        let mut store = CallRecordStore::new();
        let a = store.ingest(&delta(Id(1), ROOT_CALL_ID, 123, 0, 0)).unwrap();
        store.ingest(&delta(Id(1), a, 501, 10, 5)).unwrap();

        let selected_addresses = addresses(&store, &[a]);
        let mut first = callees(&store, &selected_addresses);
        let mut second = callees(&store, &selected_addresses);
        first.sort_by_key(|r| r.address);
        second.sort_by_key(|r| r.address);
        assert_eq!(first, second);
    }
}
