use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("call record delta references unknown parent id {0}")]
    DanglingParent(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
