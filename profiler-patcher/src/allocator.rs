use parking_lot::Mutex;

use crate::error::{Error, Result};

/// One page-aligned, RWX-mapped slot big enough to hold a single trampoline.
/// The pointer stays valid and executable for the slot's entire lifetime,
/// including across a release/reallocate cycle — callers must stop using the
/// old contents before calling [`ExecutableAllocator::release`].
pub struct Slot {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the memory a `Slot` points at is owned exclusively by whichever
// `FunctionPatch` currently holds it; the allocator only ever hands a given
// address to one caller at a time (see `Inner::free`).
unsafe impl Send for Slot {}

impl Slot {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Copies `bytes` to the start of the slot. Panics if `bytes` doesn't
    /// fit — callers size trampolines against `len()` before allocating.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.len, "trampoline does not fit in slot");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len());
        }
    }

    fn address(&self) -> usize {
        self.ptr as usize
    }
}

struct Inner {
    slot_size: usize,
    free: Vec<usize>,
    mapped: Vec<(usize, usize)>,
}

/// A page-granularity allocator of RWX memory, used to back trampolines.
/// Slots are recycled on release rather than unmapped, so the collector's
/// executable address-space footprint is bounded by its high-water mark of
/// simultaneously installed patches, not its total number of apply/revert
/// cycles.
pub struct ExecutableAllocator {
    inner: Mutex<Inner>,
}

impl ExecutableAllocator {
    /// `slot_size` is rounded up to the host page size since the underlying
    /// mapping is always done at page granularity.
    pub fn new(slot_size: usize) -> Self {
        let page_size = page_size();
        let rounded = slot_size.div_ceil(page_size) * page_size;
        ExecutableAllocator {
            inner: Mutex::new(Inner {
                slot_size: rounded,
                free: Vec::new(),
                mapped: Vec::new(),
            }),
        }
    }

    pub fn allocate(&self) -> Result<Slot> {
        let mut inner = self.inner.lock();
        if let Some(addr) = inner.free.pop() {
            return Ok(Slot {
                ptr: addr as *mut u8,
                len: inner.slot_size,
            });
        }
        let slot_size = inner.slot_size;
        let addr = map_rwx(slot_size)?;
        inner.mapped.push((addr as usize, slot_size));
        Ok(Slot {
            ptr: addr,
            len: slot_size,
        })
    }

    pub fn release(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        inner.free.push(slot.address());
    }
}

impl Drop for ExecutableAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for &(addr, len) in &inner.mapped {
            unmap(addr as *mut u8, len);
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn map_rwx(len: usize) -> Result<*mut u8> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(Error::Allocation(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(ptr as *mut u8)
    }
}

#[cfg(not(unix))]
fn map_rwx(_len: usize) -> Result<*mut u8> {
    Err(Error::Allocation(
        "executable memory allocation is only implemented for unix targets".to_string(),
    ))
}

#[cfg(unix)]
fn unmap(ptr: *mut u8, len: usize) {
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn unmap(_ptr: *mut u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_yields_writable_executable_memory() {
        let allocator = ExecutableAllocator::new(64);
        let mut slot = allocator.allocate().unwrap();
        assert!(slot.len() >= 64);
        slot.write(&[0x90, 0x90, 0xC3]);
        unsafe {
            assert_eq!(*slot.as_ptr(), 0x90);
        }
    }

    #[test]
    fn release_recycles_the_same_address() {
        let allocator = ExecutableAllocator::new(64);
        let slot = allocator.allocate().unwrap();
        let addr = slot.as_ptr() as usize;
        allocator.release(slot);
        let slot2 = allocator.allocate().unwrap();
        assert_eq!(slot2.as_ptr() as usize, addr);
    }

    #[test]
    fn concurrent_allocation_never_hands_out_the_same_slot_twice() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let allocator = Arc::new(ExecutableAllocator::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || allocator.allocate().unwrap().as_ptr() as usize)
            })
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let unique: HashSet<_> = addrs.iter().copied().collect();
        assert_eq!(unique.len(), addrs.len());
    }
}
