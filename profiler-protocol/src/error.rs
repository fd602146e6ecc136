use thiserror::Error;

/// Data-shape and I/O errors from the codec. Per spec.md §7, a data-shape
/// error (malformed frame, truncated row) terminates the *session* but is
/// never a programmer-error abort; the frontend reacts to this by tearing
/// down the connection while leaving in-memory state intact.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown message tag {0}")]
    UnknownTag(u32),

    #[error("string field was not valid UTF-8")]
    InvalidUtf8,

    #[error("frame length {0} exceeds the maximum allowed message size")]
    FrameTooLarge(u32),
}
