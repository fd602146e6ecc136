use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("opening metadata cache at {path}")]
    Open {
        path: String,
        #[source]
        source: rusqlite_migration::Error,
    },
    #[error("metadata cache query failed")]
    Query(#[source] rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(source: rusqlite::Error) -> Self {
        Error::Query(source)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
