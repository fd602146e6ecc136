use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use profiler_types::{PatchRecord, PatchState, Rva};

use crate::allocator::ExecutableAllocator;
use crate::function_patch::{FunctionPatch, OnEnterFn, OnExitFn};

/// Resolves an RVA within one mapped module to the absolute address of the
/// function's first byte. Supplied by the module tracker so this crate
/// never has to know how a module got mapped.
pub trait RvaResolver {
    fn resolve(&self, rva: Rva) -> Option<*mut u8>;
}

/// Per-module `rva -> patch` table (4.E). Apply and revert are idempotent:
/// re-applying an already-active or already-requested RVA, or reverting an
/// already-idle or already-requested-revert one, is a no-op that doesn't
/// touch the underlying patch.
pub struct ImagePatchManager {
    module_id: u64,
    allocator: Arc<ExecutableAllocator>,
    on_enter: OnEnterFn,
    on_exit: OnExitFn,
    patches: Mutex<HashMap<Rva, Entry>>,
}

struct Entry {
    state: PatchState,
    installed: Option<FunctionPatch>,
}

impl ImagePatchManager {
    pub fn new(
        module_id: u64,
        allocator: Arc<ExecutableAllocator>,
        on_enter: OnEnterFn,
        on_exit: OnExitFn,
    ) -> Self {
        ImagePatchManager {
            module_id,
            allocator,
            on_enter,
            on_exit,
            patches: Mutex::new(HashMap::new()),
        }
    }

    /// Applies patches at `rvas`, resolving each through `resolver`. RVAs
    /// already `Active` or `RequestedApply` are skipped (P6). A resolution
    /// or installation failure transitions that RVA to `Error` without
    /// affecting the others.
    ///
    /// # Safety
    /// Every address `resolver` returns must point at a live function
    /// belonging to this manager's module, per [`FunctionPatch::install`].
    pub unsafe fn apply(&self, resolver: &dyn RvaResolver, rvas: &[Rva]) -> Vec<PatchRecord> {
        let mut patches = self.patches.lock();
        let mut results = Vec::with_capacity(rvas.len());
        for &rva in rvas {
            let state = patches.get(&rva).map(|e| e.state).unwrap_or(PatchState::Idle);
            if state.apply_is_noop() {
                results.push(PatchRecord {
                    module_id: self.module_id.into(),
                    rva,
                    state,
                });
                continue;
            }
            patches.insert(
                rva,
                Entry {
                    state: PatchState::RequestedApply,
                    installed: None,
                },
            );
            let new_state = match resolver.resolve(rva) {
                None => PatchState::Error,
                Some(entry) => match FunctionPatch::install(
                    Arc::clone(&self.allocator),
                    entry,
                    self.on_enter,
                    self.on_exit,
                ) {
                    Ok(patch) => {
                        patches.get_mut(&rva).unwrap().installed = Some(patch);
                        PatchState::Active
                    }
                    Err(_) => PatchState::Error,
                },
            };
            patches.get_mut(&rva).unwrap().state = new_state;
            results.push(PatchRecord {
                module_id: self.module_id.into(),
                rva,
                state: new_state,
            });
        }
        results
    }

    /// Reverts patches at `rvas`. RVAs already `Idle` or `RequestedRevert`
    /// are skipped (P6).
    ///
    /// # Safety
    /// The patched function must not be concurrently entered by a thread
    /// that has already read the (about to be reverted) jump instruction,
    /// per [`Jumper::activate`](crate::jumper::Jumper::activate).
    pub unsafe fn revert(&self, rvas: &[Rva]) -> Vec<PatchRecord> {
        let mut patches = self.patches.lock();
        let mut results = Vec::with_capacity(rvas.len());
        for &rva in rvas {
            let state = patches.get(&rva).map(|e| e.state).unwrap_or(PatchState::Idle);
            if state.revert_is_noop() {
                results.push(PatchRecord {
                    module_id: self.module_id.into(),
                    rva,
                    state,
                });
                continue;
            }
            if let Some(entry) = patches.get_mut(&rva) {
                entry.installed = None; // dropping FunctionPatch reverts + releases
            }
            patches.insert(
                rva,
                Entry {
                    state: PatchState::Idle,
                    installed: None,
                },
            );
            results.push(PatchRecord {
                module_id: self.module_id.into(),
                rva,
                state: PatchState::Idle,
            });
        }
        results
    }

    /// Implicitly reverts every patch without writing to the now-unmapped
    /// module's memory — dropping the table's `FunctionPatch`es would try
    /// to restore original bytes at addresses that no longer belong to this
    /// process, so entries are discarded via `forget` instead.
    pub fn on_module_unmapped(&self) {
        let mut patches = self.patches.lock();
        for (_, entry) in patches.drain() {
            if let Some(patch) = entry.installed {
                std::mem::forget(patch);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<PatchRecord> {
        self.patches
            .lock()
            .iter()
            .map(|(&rva, entry)| PatchRecord {
                module_id: self.module_id.into(),
                rva,
                state: entry.state,
            })
            .collect()
    }

    pub fn state_of(&self, rva: Rva) -> PatchState {
        self.patches
            .lock()
            .get(&rva)
            .map(|e| e.state)
            .unwrap_or(PatchState::Idle)
    }
}
