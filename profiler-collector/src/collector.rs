use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;
use profiler_patcher::{OnEnterFn, OnExitFn};
use profiler_types::{Id, IdGenerator, ThreadInfo, TraceEvent};
use rustc_hash::FxHashMap;

use crate::trace::PerThreadTrace;

/// Event-count capacity of each half of a thread's double buffer. `4096`
/// events at 16 bytes each is 64 KiB per half, 128 KiB per thread — small
/// enough that a process with thousands of instrumented threads doesn't
/// dominate working-set size, large enough that a drain cycle rarely races
/// the back-pressure gate under normal call rates.
pub const DEFAULT_TRACE_LIMIT_EVENTS: usize = 4096;

fn current_native_thread_id() -> u64 {
    #[cfg(unix)]
    {
        unsafe { libc::pthread_self() as u64 }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Best-effort per-thread CPU time, sampled at drain time (4.G). Only
/// glibc exposes `pthread_getcpuclockid`; other unixes and non-unix targets
/// report zero rather than guessing.
#[cfg(target_os = "linux")]
fn thread_cpu_time_micros(native_id: u64) -> u64 {
    unsafe {
        let mut clock_id: libc::clockid_t = 0;
        if libc::pthread_getcpuclockid(native_id as libc::pthread_t, &mut clock_id) != 0 {
            return 0;
        }
        let mut ts = std::mem::zeroed::<libc::timespec>();
        if libc::clock_gettime(clock_id, &mut ts) != 0 {
            return 0;
        }
        (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
    }
}

#[cfg(not(target_os = "linux"))]
fn thread_cpu_time_micros(_native_id: u64) -> u64 {
    0
}

/// Dropped when the registering OS thread's TLS is torn down, which is the
/// only exit signal available without a dedicated thread-creation hook.
struct ThreadExitGuard(Arc<PerThreadTrace>);

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        self.0.mark_complete();
    }
}

thread_local! {
    static EXIT_GUARD: RefCell<Option<ThreadExitGuard>> = RefCell::new(None);
}

/// Owns every thread's trace for the collector's lifetime. Threads register
/// lazily on first `on_enter` (4.G); there is no explicit thread-creation
/// hook to depend on.
pub struct Collector {
    trace_limit_events: usize,
    ids: IdGenerator,
    threads: Mutex<FxHashMap<u64, Arc<PerThreadTrace>>>,
}

impl Collector {
    pub fn new(trace_limit_events: usize) -> Self {
        Collector {
            trace_limit_events,
            ids: IdGenerator::new(),
            threads: Mutex::new(FxHashMap::default()),
        }
    }

    fn trace_for(&self, native_id: u64) -> Arc<PerThreadTrace> {
        let mut threads = self.threads.lock();
        let is_new = !threads.contains_key(&native_id);
        let trace = threads
            .entry(native_id)
            .or_insert_with(|| {
                Arc::new(PerThreadTrace::new(
                    self.ids.next(),
                    self.trace_limit_events,
                    now_micros(),
                ))
            })
            .clone();
        drop(threads);
        if is_new {
            log::trace!("thread {native_id:#x} registered with id {}", trace.thread_id());
            EXIT_GUARD.with(|guard| *guard.borrow_mut() = Some(ThreadExitGuard(trace.clone())));
        }
        trace
    }

    /// # Safety
    /// Must be called from the thread whose `on_enter` event this is.
    pub unsafe fn on_enter(&self, callee: u64, timestamp: u64, sp: u64) {
        let trace = self.trace_for(current_native_thread_id());
        let return_address = std::ptr::read(sp as *const u64);
        trace.on_enter(callee, timestamp, sp, return_address);
    }

    /// # Safety
    /// Must be called from the thread whose `on_exit` event this is.
    pub unsafe fn on_exit(&self, timestamp: u64) -> u64 {
        let trace = self.trace_for(current_native_thread_id());
        trace.on_exit(timestamp)
    }

    /// Drains every registered thread's trace and hands the contiguous
    /// slice to `reader`. Threads are visited in no particular order; there
    /// is no cross-thread ordering guarantee to preserve (4.F).
    pub fn read_collected(&self, mut reader: impl FnMut(Id, &[TraceEvent])) {
        let threads: Vec<Arc<PerThreadTrace>> = self.threads.lock().values().cloned().collect();
        for trace in threads {
            let events = trace.drain();
            if !events.is_empty() {
                reader(trace.thread_id(), &events);
            }
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Snapshots every registered thread's metadata for a `threads_info`
    /// message, including `complete`/`cpu_time` as observed right now.
    pub fn thread_info(&self) -> Vec<ThreadInfo> {
        self.threads
            .lock()
            .iter()
            .map(|(&native_id, trace)| {
                let mut info =
                    ThreadInfo::new(trace.thread_id(), native_id, String::new(), trace.start_time());
                info.cpu_time = thread_cpu_time_micros(native_id);
                info.complete = trace.is_complete();
                info
            })
            .collect()
    }
}

/// The global collector instance, initialized once at agent bootstrap and
/// referenced by the extern "C" trampoline entry points below, which can't
/// thread a `&Collector` through themselves since the patched target
/// function's calling convention has no room for one.
static GLOBAL: Mutex<Option<Arc<Collector>>> = Mutex::new(None);

pub fn install_global(collector: Arc<Collector>) {
    log::info!("collector installed");
    *GLOBAL.lock() = Some(collector);
}

pub fn global() -> Option<Arc<Collector>> {
    GLOBAL.lock().clone()
}

/// # Safety
/// Only valid as the `on_enter` function pointer handed to
/// `profiler_patcher::FunctionPatch::install`; relies on the global
/// collector having been installed first.
pub unsafe extern "C" fn on_enter_trampoline(callee: u64, sp: u64) {
    if let Some(collector) = global() {
        collector.on_enter(callee, now(), sp);
    }
}

/// # Safety
/// Same constraints as [`on_enter_trampoline`].
pub unsafe extern "C" fn on_exit_trampoline() -> u64 {
    match global() {
        Some(collector) => collector.on_exit(now()),
        None => {
            log::warn!("on_exit_trampoline fired with no collector installed");
            0
        }
    }
}

fn now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn now_micros() -> u64 {
    now() / 1_000
}

#[allow(dead_code)]
const _: OnEnterFn = on_enter_trampoline;
#[allow(dead_code)]
const _: OnExitFn = on_exit_trampoline;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_register_lazily_on_first_enter() {
        let collector = Collector::new(16);
        assert_eq!(collector.thread_count(), 0);
        unsafe {
            collector.on_enter(0x1000, 1, Box::leak(Box::new(0u64)) as *const u64 as u64);
        }
        assert_eq!(collector.thread_count(), 1);
    }

    #[test]
    fn read_collected_drains_every_registered_thread() {
        let collector = Collector::new(16);
        unsafe {
            collector.on_enter(0x1000, 1, Box::leak(Box::new(0u64)) as *const u64 as u64);
        }
        let mut total = 0;
        collector.read_collected(|_thread_id, events| total += events.len());
        assert_eq!(total, 1);
    }

    #[test]
    fn empty_traces_are_skipped_by_read_collected() {
        let collector = Collector::new(16);
        let mut calls = 0;
        collector.read_collected(|_, _| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn thread_info_reports_incomplete_while_the_thread_is_alive() {
        let collector = Collector::new(16);
        unsafe {
            collector.on_enter(0x1000, 1, Box::leak(Box::new(0u64)) as *const u64 as u64);
        }
        let infos = collector.thread_info();
        assert_eq!(infos.len(), 1);
        assert!(!infos[0].complete);
    }

    #[test]
    fn thread_completion_is_observed_after_the_os_thread_exits() {
        let collector = Arc::new(Collector::new(16));
        let worker = collector.clone();
        let handle = std::thread::spawn(move || unsafe {
            worker.on_enter(0x1000, 1, Box::leak(Box::new(0u64)) as *const u64 as u64);
        });
        handle.join().unwrap();

        let infos = collector.thread_info();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].complete);
    }
}
