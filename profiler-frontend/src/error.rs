use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] profiler_protocol::Error),
    #[error(transparent)]
    Store(#[from] profiler_store::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
