use parking_lot::Mutex;

use crate::error::Result;

/// 14-byte `jmp qword ptr [rip+0]; dq target` — an indirect jump that needs
/// no scratch register, so it's safe to splice into an arbitrary function
/// prologue regardless of what that function does with the general-purpose
/// registers.
pub const JUMP_LEN: usize = 14;

fn jump_shellcode(target: u64) -> [u8; JUMP_LEN] {
    let mut code = [0xffu8, 0x25, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
    code[6..14].copy_from_slice(&target.to_le_bytes());
    code
}

/// Global lock serializing writes to code pages across all jumpers. Spec's
/// "stop-the-world window bounded by a single memcpy plus icache flush"
/// becomes, on x86-64 where instruction fetch is coherent with data stores,
/// just the memcpy: no explicit icache flush instruction is needed, but the
/// write must still be serialized against concurrent reads by other threads
/// entering the same function.
static CODE_PAGE_LOCK: Mutex<()> = Mutex::new(());

/// Installs and reverts a jump at one function's entry point. Captures the
/// original bytes at construction time so `activate(false)` can restore them
/// bit-exactly, per the revert-buffer invariant.
pub struct Jumper {
    entry: *mut u8,
    original_bytes: [u8; JUMP_LEN],
    target: u64,
    active: bool,
}

// SAFETY: a `Jumper` is only ever owned by the single `FunctionPatch` that
// created it, which serializes access to `entry`.
unsafe impl Send for Jumper {}

impl Jumper {
    /// Captures the first [`JUMP_LEN`] bytes at `entry` without modifying
    /// them. `entry` must point at readable, writable, executable memory
    /// containing at least `JUMP_LEN` bytes belonging to one function.
    ///
    /// # Safety
    /// `entry` must remain valid for the lifetime of the returned `Jumper`.
    pub unsafe fn new(entry: *mut u8, target: u64) -> Self {
        let mut original_bytes = [0u8; JUMP_LEN];
        std::ptr::copy_nonoverlapping(entry, original_bytes.as_mut_ptr(), JUMP_LEN);
        Jumper {
            entry,
            original_bytes,
            target,
            active: false,
        }
    }

    pub fn original_bytes(&self) -> &[u8; JUMP_LEN] {
        &self.original_bytes
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Installs (`true`) or removes (`false`) the jump. Idempotent: calling
    /// with the current state is a no-op.
    ///
    /// # Safety
    /// Must not be called while another thread might be fetching
    /// instructions from `entry` through a stale cached address — the
    /// collector relies on the caller (the image patch manager) to hold
    /// patches under a single-writer discipline.
    pub unsafe fn activate(&mut self, enable: bool) -> Result<()> {
        if enable == self.active {
            return Ok(());
        }
        let _guard = CODE_PAGE_LOCK.lock();
        if enable {
            let code = jump_shellcode(self.target);
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.entry, JUMP_LEN);
        } else {
            std::ptr::copy_nonoverlapping(self.original_bytes.as_ptr(), self.entry, JUMP_LEN);
        }
        self.active = enable;
        Ok(())
    }
}

impl Drop for Jumper {
    fn drop(&mut self) {
        if self.active {
            // Best-effort: revert on drop so a leaked patch never leaves a
            // dangling jump into a freed trampoline slot.
            unsafe {
                let _ = self.activate(false);
            }
        }
    }
}
