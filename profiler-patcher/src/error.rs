use thiserror::Error;

/// Errors from the patch engine. All of these are data/platform errors, not
/// programmer errors: a failed apply transitions a patch record to
/// `PatchState::Error` rather than panicking, so the collector keeps running
/// with the rest of its patches intact.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("executable memory allocation failed: {0}")]
    Allocation(String),

    #[error("no executable-memory slots available (capacity exhausted)")]
    SlabExhausted,

    #[error("function entry at {0:#x} contains fewer than {1} decodable bytes")]
    NotEnoughBytes(u64, usize),

    #[error("function entry at {0:#x} could not be decoded (invalid instruction)")]
    InvalidBytes(u64),

    #[error("function entry at {0:#x} has a RIP-relative operand within the patched prologue")]
    RelativeInstruction(u64),

    #[error("function entry at {0:#x} contains a branch within the patched prologue")]
    UnsupportedControlFlow(u64),

    #[error("trampoline encoding failed for entry at {0:#x}")]
    EncodingFailed(u64),

    #[error("patch already installed for module {0} rva {1:#x}")]
    AlreadyPatched(u64, u32),

    #[error("no patch installed for module {0} rva {1:#x}")]
    NotPatched(u64, u32),
}

pub type Result<T> = std::result::Result<T, Error>;
