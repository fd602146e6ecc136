use std::sync::Arc;

use crate::allocator::{ExecutableAllocator, Slot};
use crate::error::Result;
use crate::jumper::{Jumper, JUMP_LEN};
use crate::trampoline::Trampoline;

/// Called on entry to the patched function: `callee` is the function's own
/// address, `sp` is the stack pointer observed at entry (the shadow-stack
/// key). Implemented by `profiler-collector`'s per-thread trace.
pub type OnEnterFn = unsafe extern "C" fn(callee: u64, sp: u64);

/// Called in place of the function's return; returns the real return
/// address recovered from the shadow stack so the exit stub can jump there.
pub type OnExitFn = unsafe extern "C" fn() -> u64;

/// One B+C pair: a jumper diverting a function's entry into a trampoline
/// that calls back into the collector. Owns its trampoline slot exclusively
/// for its whole lifetime; dropping it reverts the jump and releases the
/// slot, in that order, so no thread can ever observe the slot half-freed
/// while still jumped-to.
pub struct FunctionPatch {
    jumper: Jumper,
    slot: Option<Slot>,
    allocator: Arc<ExecutableAllocator>,
}

impl FunctionPatch {
    /// # Safety
    /// `entry` must point at the start of a function with at least
    /// `JUMP_LEN * 2` readable, writable, executable bytes, and must remain
    /// mapped at that address for the patch's entire lifetime.
    pub unsafe fn install(
        allocator: Arc<ExecutableAllocator>,
        entry: *mut u8,
        on_enter: OnEnterFn,
        on_exit: OnExitFn,
    ) -> Result<Self> {
        let entry_addr = entry as u64;
        let prologue = std::slice::from_raw_parts(entry, JUMP_LEN * 2);

        let mut slot = allocator.allocate()?;
        let slot_addr = slot.as_ptr() as u64;

        let trampoline = Trampoline::build(
            entry_addr,
            prologue,
            JUMP_LEN,
            slot_addr,
            on_enter as u64,
            on_exit as u64,
        )?;
        slot.write(trampoline.code());

        let mut jumper = Jumper::new(entry, slot_addr);
        jumper.activate(true)?;

        Ok(FunctionPatch {
            jumper,
            slot: Some(slot),
            allocator,
        })
    }

    pub fn is_active(&self) -> bool {
        self.jumper.is_active()
    }

    /// Reverts the jump, restoring the function's original bytes, without
    /// freeing the trampoline slot yet — a thread already inside the
    /// trampoline must be allowed to finish running it.
    ///
    /// # Safety
    /// See [`Jumper::activate`].
    pub unsafe fn deactivate(&mut self) -> Result<()> {
        self.jumper.activate(false)
    }
}

impl Drop for FunctionPatch {
    fn drop(&mut self) {
        // `Jumper::drop` reverts the jump if still active. We still need to
        // hand the slot back explicitly since `Slot` carries no allocator
        // reference of its own.
        if let Some(slot) = self.slot.take() {
            self.allocator.release(slot);
        }
    }
}
