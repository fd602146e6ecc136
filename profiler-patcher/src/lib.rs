//! Reversible function-entry instrumentation: an executable-memory
//! allocator, a jumper that installs/reverts a single indirect jump, a
//! trampoline generator that relocates the displaced prologue around a
//! call back into the collector, and a per-module patch table tying them
//! together.
//!
//! Everything here is `unsafe` at its core — it rewrites live code — but the
//! unsafety is concentrated in [`jumper::Jumper::activate`] and
//! [`function_patch::FunctionPatch::install`]; callers above
//! [`image_patch_manager::ImagePatchManager`] only need to guarantee that
//! the addresses they hand in point at real, currently-mapped functions.

mod allocator;
mod error;
mod function_patch;
mod image_patch_manager;
mod jumper;
mod trampoline;

pub use allocator::{ExecutableAllocator, Slot};
pub use error::{Error, Result};
pub use function_patch::{FunctionPatch, OnEnterFn, OnExitFn};
pub use image_patch_manager::{ImagePatchManager, RvaResolver};
pub use jumper::{Jumper, JUMP_LEN};
pub use trampoline::Trampoline;
