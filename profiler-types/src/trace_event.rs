use crate::ids::LongAddress;

/// One entry in a per-thread trace ring. `callee == 0` means "exit of the
/// current frame" (spec.md §3's convention); any other value is the address
/// being entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TraceEvent {
    pub timestamp: u64,
    pub callee: LongAddress,
}

impl TraceEvent {
    pub const SIZE: usize = std::mem::size_of::<TraceEvent>();

    pub fn enter(timestamp: u64, callee: LongAddress) -> Self {
        TraceEvent { timestamp, callee }
    }

    pub fn exit(timestamp: u64) -> Self {
        TraceEvent {
            timestamp,
            callee: 0,
        }
    }

    pub fn is_exit(self) -> bool {
        self.callee == 0
    }
}
