use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A process-wide monotone identifier assigned by auto-increment on
/// insertion into any indexed table (call records, module mappings, ...).
///
/// `0` is reserved: for a call record it means "root" (no parent); it is
/// never handed out by [`Id::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Id(pub u64);

/// The reserved parent id denoting a root call record.
pub const ROOT_CALL_ID: Id = Id(0);

impl Id {
    pub const fn new(value: u64) -> Self {
        Id(value)
    }

    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process-wide auto-increment counter. Each indexed table in
/// `profiler-store` / the module tracker owns one of these; it never reuses
/// a value, even across deletions, matching spec.md's "process-wide monotone
/// integer" definition of `id_t`.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Starts handing out ids at 1, keeping 0 reserved for "root"/"none".
    pub fn new() -> Self {
        IdGenerator {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Id {
        Id(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A 64-bit absolute virtual address.
pub type LongAddress = u64;

/// A 32-bit module-relative offset (relative virtual address).
pub type Rva = u32;

/// Identifier for a module grouped by file identity (device+inode), stable
/// across multiple load/unload cycles of the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

impl From<u64> for ModuleId {
    fn from(value: u64) -> Self {
        ModuleId(value)
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
