use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use profiler_types::{Id, LongAddress, TraceEvent};

use crate::gate::Gate;

struct ShadowEntry {
    sp: u64,
    return_address: u64,
}

type Buffer = UnsafeCell<Vec<TraceEvent>>;

/// A double-buffered SPSC ring for one thread's `(timestamp, callee)`
/// events, plus the shadow return stack that lets `on_enter`/`on_exit`
/// distinguish a tail call from a regular nested call (4.F).
///
/// `active` holds a pointer to whichever of `buffer_a`/`buffer_b` the
/// producer is currently allowed to append to, or `null` while either side
/// holds it exclusively. Both the producer's append and the consumer's
/// buffer swap claim the pointer the same way — swap it for `null`, do the
/// work, store the result back — so the two can never touch a buffer at the
/// same instant, and whichever side loses the race simply retries.
pub struct PerThreadTrace {
    thread_id: Id,
    start_time: u64,
    buffer_a: Box<Buffer>,
    buffer_b: Box<Buffer>,
    active: AtomicPtr<Buffer>,
    limit_events: usize,
    gate: Gate,
    shadow: UnsafeCell<Vec<ShadowEntry>>,
    complete: AtomicBool,
}

// SAFETY: `shadow` is only ever touched from `on_enter`/`on_exit`, which the
// collector guarantees are called exclusively by the thread that owns this
// trace. `buffer_a`/`buffer_b` are only dereferenced while exclusively
// claimed via `active`, enforced by the swap-to-null protocol below.
unsafe impl Sync for PerThreadTrace {}

impl PerThreadTrace {
    pub fn new(thread_id: Id, limit_events: usize, start_time: u64) -> Self {
        let buffer_a = Box::new(UnsafeCell::new(Vec::with_capacity(limit_events)));
        let active = AtomicPtr::new(buffer_a.as_ref() as *const Buffer as *mut Buffer);
        PerThreadTrace {
            thread_id,
            start_time,
            buffer_a,
            buffer_b: Box::new(UnsafeCell::new(Vec::with_capacity(limit_events))),
            active,
            limit_events,
            gate: Gate::new(),
            shadow: UnsafeCell::new(vec![ShadowEntry {
                sp: 0,
                return_address: 0,
            }]),
            complete: AtomicBool::new(false),
        }
    }

    pub fn thread_id(&self) -> Id {
        self.thread_id
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Flipped by the registering thread's TLS destructor when it exits
    /// (4.G); read back by `Collector::thread_info` on the next drain cycle.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// `return_address` is the real return address read from `*sp` by the
    /// caller (the trampoline glue has direct access to that memory; this
    /// type only deals in stack pointer identity).
    ///
    /// # Safety
    /// Must only be called by the thread that owns this trace, and never
    /// concurrently with another call to `on_enter`/`on_exit` on the same
    /// trace.
    pub unsafe fn on_enter(&self, callee: LongAddress, timestamp: u64, sp: u64, return_address: u64) {
        let shadow = &mut *self.shadow.get();
        if shadow.last().map(|e| e.sp) != Some(sp) {
            shadow.push(ShadowEntry { sp, return_address });
        } else {
            // Tail call: the frame that was here didn't actually return
            // through our exit stub (its sp is unchanged), so close it with
            // a synthetic exit before opening the new one. Shadow depth is
            // unchanged since we don't push or pop here.
            self.record(0, timestamp);
        }
        self.record(callee, timestamp);
    }

    /// # Safety
    /// Same constraints as [`Self::on_enter`]. Returns the real return
    /// address recovered from the shadow stack.
    pub unsafe fn on_exit(&self, timestamp: u64) -> u64 {
        let shadow = &mut *self.shadow.get();
        let return_address = shadow
            .pop()
            .map(|e| e.return_address)
            .unwrap_or(0);
        self.record(0, timestamp);
        return_address
    }

    unsafe fn record(&self, callee: LongAddress, timestamp: u64) {
        loop {
            let claimed = self.active.swap(std::ptr::null_mut(), Ordering::Acquire);
            if claimed.is_null() {
                std::hint::spin_loop();
                continue;
            }
            let buf = &mut *(*claimed).get();
            if buf.len() < self.limit_events {
                buf.push(TraceEvent::enter(timestamp, callee));
                self.active.store(claimed, Ordering::Release);
                return;
            }
            // Full: release it so the consumer can drain it, then block.
            self.active.store(claimed, Ordering::Release);
            self.gate.wait();
        }
    }

    /// Swaps the active and inactive buffers and returns everything that
    /// was collected into the one that's now inactive, clearing it for
    /// reuse. If that buffer had reached `limit_events`, the producer's
    /// gate is raised so it can make progress again.
    pub fn drain(&self) -> Vec<TraceEvent> {
        // Claim whichever buffer the producer currently owns. If the
        // producer is mid-append it has swapped in null itself; spin until
        // it stores its buffer back.
        let claimed = loop {
            let p = self.active.swap(std::ptr::null_mut(), Ordering::Acquire);
            if !p.is_null() {
                break p;
            }
            std::hint::spin_loop();
        };

        let other = if std::ptr::eq(claimed as *const Buffer, self.buffer_a.as_ref()) {
            self.buffer_b.as_ref() as *const Buffer as *mut Buffer
        } else {
            self.buffer_a.as_ref() as *const Buffer as *mut Buffer
        };
        self.active.store(other, Ordering::Release);

        let buf = unsafe { &mut *(*claimed).get() };
        if buf.len() >= self.limit_events {
            self.gate.raise();
        }
        std::mem::take(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_nesting_pushes_a_new_shadow_frame() {
        let trace = PerThreadTrace::new(Id::new(1), 16, 0);
        unsafe {
            trace.on_enter(0x1000, 1, 0x7000, 0xaaaa);
            trace.on_enter(0x2000, 2, 0x6ff0, 0xbbbb);
        }
        let events = trace.drain();
        let callees: Vec<_> = events.iter().map(|e| e.callee).collect();
        assert_eq!(callees, vec![0x1000, 0x2000]);
    }

    #[test]
    fn tail_call_synthesizes_an_exit_before_the_new_entry() {
        let trace = PerThreadTrace::new(Id::new(1), 16, 0);
        unsafe {
            trace.on_enter(0x1000, 1, 0x7000, 0xaaaa);
            // Same sp as the frame above: a tail call, not a nested call.
            trace.on_enter(0x2000, 2, 0x7000, 0xaaaa);
        }
        let events = trace.drain();
        assert_eq!(events.len(), 3);
        assert!(events[1].is_exit());
        assert_eq!(events[2].callee, 0x2000);
    }

    #[test]
    fn exit_emits_a_zero_callee_record_and_pops_shadow() {
        let trace = PerThreadTrace::new(Id::new(1), 16, 0);
        unsafe {
            trace.on_enter(0x1000, 1, 0x7000, 0xaaaa);
            trace.on_exit(2);
        }
        let events = trace.drain();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_exit());
    }

    #[test]
    fn back_pressure_gate_releases_after_drain() {
        let trace = PerThreadTrace::new(Id::new(1), 2, 0);
        unsafe {
            trace.on_enter(0x1, 1, 0x7000, 0xaaaa);
            trace.on_enter(0x2, 2, 0x6ff0, 0xbbbb);
        }
        // The active buffer is now exactly at its 2-event limit.
        let drained = trace.drain();
        assert_eq!(drained.len(), 2);
        unsafe {
            // Must not deadlock: the buffer drain swapped in a fresh one.
            trace.on_enter(0x3, 3, 0x6fe0, 0xcccc);
        }
        let drained_again = trace.drain();
        assert_eq!(drained_again.len(), 1);
    }

    #[test]
    fn events_within_one_thread_are_monotone_in_timestamp() {
        let trace = PerThreadTrace::new(Id::new(1), 32, 0);
        unsafe {
            for i in 0..10u64 {
                trace.on_enter(i, i, 0x7000 - i, 0xaaaa);
            }
        }
        let events = trace.drain();
        let timestamps: Vec<_> = events.iter().map(|e| e.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort_unstable();
        assert_eq!(timestamps, sorted);
    }
}
