use serde::{Deserialize, Serialize};

use crate::ids::{ModuleId, Rva};

/// `idle -> requested_apply -> active -> requested_revert -> idle`, any state
/// can fail to `error`. `error` and `idle` are the only states with no
/// pending async work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchState {
    Idle,
    RequestedApply,
    Active,
    RequestedRevert,
    Error,
}

impl PatchState {
    /// Whether an `apply()` request for this RVA is a no-op (already active
    /// or already in flight to become active) — spec.md's idempotence rule.
    pub fn apply_is_noop(self) -> bool {
        matches!(self, PatchState::Active | PatchState::RequestedApply)
    }

    pub fn revert_is_noop(self) -> bool {
        matches!(self, PatchState::Idle | PatchState::RequestedRevert)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub module_id: ModuleId,
    pub rva: Rva,
    pub state: PatchState,
}

impl PatchRecord {
    pub fn idle(module_id: ModuleId, rva: Rva) -> Self {
        PatchRecord {
            module_id,
            rva,
            state: PatchState::Idle,
        }
    }
}
