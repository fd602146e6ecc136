use thiserror::Error;

/// Data-shape errors that can arise while validating entities from this
/// crate (e.g. a call record whose parent does not exist). Kept small and
/// `#[non_exhaustive]` since call sites convert these into their own
/// richer error enums (see `profiler-protocol::Error`,
/// `profiler-store::Error`).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("call record {0} references non-existent parent {1}")]
    DanglingParent(crate::Id, crate::Id),

    #[error("duplicate call node for (thread={0}, parent={1}, address={2:#x})")]
    DuplicateCallNode(crate::Id, crate::Id, u64),
}
