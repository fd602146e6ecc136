use profiler_types::{CallRecordDelta, Histogram, Id, IdGenerator, LongAddress, ROOT_CALL_ID, TraceEvent};
use rustc_hash::FxHashMap;

/// An open call frame on one thread's shadow stack, as seen by the
/// aggregator (distinct from `PerThreadTrace`'s own shadow stack, which only
/// tracks stack-pointer identity for tail-call detection).
struct OpenFrame {
    node_id: Id,
    address: LongAddress,
    entry_time: u64,
    children_inclusive: u64,
    reentrance_depth: u32,
}

#[derive(Default)]
struct Accumulated {
    times_called: u64,
    inclusive_time: u64,
    exclusive_time: u64,
    max_reentrance: u32,
    max_call_time: u64,
    histogram: Option<Histogram>,
}

/// Turns each thread's raw `(timestamp, callee)` trace into the
/// `(thread_id, parent_id, address)`-keyed statistics deltas carried by
/// `statistics_update` (4.G/4.J boundary).
///
/// `profiler-store::CallRecordStore` mints a node's id by auto-incrementing
/// a single counter on first sight of a new call-node key, in the order
/// records are ingested. Since one collector session feeds exactly one
/// store in strict arrival order, this aggregator mirrors that same
/// discipline — same starting value, same increment-on-first-sight rule —
/// so a `parent_id` it emits already equals the id the store will assign
/// that parent, with no round trip back from the frontend to learn it.
pub struct StatisticsAggregator {
    collect_histograms: bool,
    node_ids: FxHashMap<(Id, Id, LongAddress), Id>,
    ids: IdGenerator,
    stacks: FxHashMap<Id, Vec<OpenFrame>>,
    pending: FxHashMap<(Id, Id, LongAddress), Accumulated>,
}

impl StatisticsAggregator {
    pub fn new(collect_histograms: bool) -> Self {
        StatisticsAggregator {
            collect_histograms,
            node_ids: FxHashMap::default(),
            ids: IdGenerator::new(),
            stacks: FxHashMap::default(),
            pending: FxHashMap::default(),
        }
    }

    fn node_id(&mut self, thread_id: Id, parent_id: Id, address: LongAddress) -> Id {
        let ids = &self.ids;
        *self
            .node_ids
            .entry((thread_id, parent_id, address))
            .or_insert_with(|| ids.next())
    }

    /// Feeds one thread's drained trace events through the shadow stack,
    /// accumulating per-call-node statistics as frames close.
    pub fn ingest_trace(&mut self, thread_id: Id, events: &[TraceEvent]) {
        for event in events {
            if event.is_exit() {
                self.close_frame(thread_id, event.timestamp);
            } else {
                self.open_frame(thread_id, event.callee, event.timestamp);
            }
        }
    }

    fn open_frame(&mut self, thread_id: Id, address: LongAddress, timestamp: u64) {
        let (parent_id, reentrance_depth) = {
            let stack = self.stacks.entry(thread_id).or_default();
            let parent_id = stack.last().map(|f| f.node_id).unwrap_or(ROOT_CALL_ID);
            let reentrance_depth = stack.iter().filter(|f| f.address == address).count() as u32;
            (parent_id, reentrance_depth)
        };
        let node_id = self.node_id(thread_id, parent_id, address);
        self.stacks.entry(thread_id).or_default().push(OpenFrame {
            node_id,
            address,
            entry_time: timestamp,
            children_inclusive: 0,
            reentrance_depth,
        });
    }

    fn close_frame(&mut self, thread_id: Id, timestamp: u64) {
        let Some(stack) = self.stacks.get_mut(&thread_id) else {
            return;
        };
        let Some(frame) = stack.pop() else {
            return;
        };
        let duration = timestamp.saturating_sub(frame.entry_time);
        let exclusive_time = duration.saturating_sub(frame.children_inclusive);
        let parent_id = match stack.last_mut() {
            Some(parent) => {
                parent.children_inclusive += duration;
                parent.node_id
            }
            None => ROOT_CALL_ID,
        };

        let key = (thread_id, parent_id, frame.address);
        let entry = self.pending.entry(key).or_default();
        entry.times_called += 1;
        entry.inclusive_time += duration;
        entry.exclusive_time += exclusive_time;
        entry.max_reentrance = entry.max_reentrance.max(frame.reentrance_depth);
        entry.max_call_time = entry.max_call_time.max(duration);
        if self.collect_histograms {
            entry.histogram.get_or_insert_with(Histogram::new).record(duration);
        }
    }

    /// Drains every call node with accumulated statistics since the last
    /// call, as the per-thread grouping `statistics_update` expects.
    pub fn drain_deltas(&mut self) -> std::collections::HashMap<Id, Vec<CallRecordDelta>> {
        let mut by_thread: std::collections::HashMap<Id, Vec<CallRecordDelta>> =
            std::collections::HashMap::new();
        for ((thread_id, parent_id, address), acc) in self.pending.drain() {
            by_thread.entry(thread_id).or_default().push(CallRecordDelta {
                thread_id,
                parent_id,
                address,
                times_called: acc.times_called,
                inclusive_time: acc.inclusive_time,
                exclusive_time: acc.exclusive_time,
                max_reentrance: acc.max_reentrance,
                max_call_time: acc.max_call_time,
                histogram: acc.histogram,
            });
        }
        by_thread
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_single_call_produces_one_root_delta() {
        let mut agg = StatisticsAggregator::new(false);
        agg.ingest_trace(
            Id(1),
            &[TraceEvent::enter(0, 0x501), TraceEvent::exit(10)],
        );
        let deltas = agg.drain_deltas();
        let thread_deltas = &deltas[&Id(1)];
        assert_eq!(thread_deltas.len(), 1);
        let delta = &thread_deltas[0];
        assert_eq!(delta.parent_id, ROOT_CALL_ID);
        assert_eq!(delta.address, 0x501);
        assert_eq!(delta.times_called, 1);
        assert_eq!(delta.inclusive_time, 10);
        assert_eq!(delta.exclusive_time, 10);
    }

    #[test]
    fn nested_calls_chain_parent_ids_and_split_exclusive_time() {
        let mut agg = StatisticsAggregator::new(false);
        agg.ingest_trace(
            Id(1),
            &[
                TraceEvent::enter(0, 0x501),
                TraceEvent::enter(10, 0x600),
                TraceEvent::exit(30),
                TraceEvent::exit(40),
            ],
        );
        let deltas = agg.drain_deltas();
        let thread_deltas = &deltas[&Id(1)];
        assert_eq!(thread_deltas.len(), 2);

        let outer = thread_deltas.iter().find(|d| d.address == 0x501).unwrap();
        let inner = thread_deltas.iter().find(|d| d.address == 0x600).unwrap();

        assert_eq!(outer.parent_id, ROOT_CALL_ID);
        assert_eq!(outer.inclusive_time, 40);
        assert_eq!(outer.exclusive_time, 20);

        assert_eq!(inner.inclusive_time, 20);
        assert_eq!(inner.exclusive_time, 20);
        assert_ne!(inner.parent_id, ROOT_CALL_ID);
    }

    #[test]
    fn repeated_calls_to_the_same_node_accumulate_into_one_delta() {
        let mut agg = StatisticsAggregator::new(false);
        agg.ingest_trace(
            Id(1),
            &[
                TraceEvent::enter(0, 0x501),
                TraceEvent::exit(10),
                TraceEvent::enter(10, 0x501),
                TraceEvent::exit(25),
            ],
        );
        let deltas = agg.drain_deltas();
        let thread_deltas = &deltas[&Id(1)];
        assert_eq!(thread_deltas.len(), 1);
        assert_eq!(thread_deltas[0].times_called, 2);
        assert_eq!(thread_deltas[0].inclusive_time, 25);
        assert_eq!(thread_deltas[0].max_call_time, 15);
    }

    #[test]
    fn direct_recursion_reports_reentrance_depth() {
        let mut agg = StatisticsAggregator::new(false);
        agg.ingest_trace(
            Id(1),
            &[
                TraceEvent::enter(0, 0x501),
                TraceEvent::enter(1, 0x501),
                TraceEvent::exit(5),
                TraceEvent::exit(10),
            ],
        );
        let deltas = agg.drain_deltas();
        let thread_deltas = &deltas[&Id(1)];
        // Two distinct call nodes: the root-level 0x501 and the
        // self-recursive 0x501 whose parent is the outer invocation.
        assert_eq!(thread_deltas.len(), 2);
        let inner = thread_deltas
            .iter()
            .find(|d| d.parent_id != ROOT_CALL_ID)
            .unwrap();
        assert_eq!(inner.max_reentrance, 1);
    }

    #[test]
    fn node_ids_are_assigned_in_strict_first_sight_order() {
        let mut agg = StatisticsAggregator::new(false);
        agg.ingest_trace(
            Id(1),
            &[
                TraceEvent::enter(0, 0x501),
                TraceEvent::exit(10),
                TraceEvent::enter(10, 0x600),
                TraceEvent::exit(20),
            ],
        );
        // Both are root-level nodes minted in discovery order starting at 1.
        let mut node_ids: Vec<u64> = agg.node_ids.values().map(|id| id.get()).collect();
        node_ids.sort_unstable();
        assert_eq!(node_ids, vec![1, 2]);
    }
}
