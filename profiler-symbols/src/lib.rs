//! Address resolution against currently loaded modules (4.L) and the
//! persistent symbol/metadata cache (§6) backing it across sessions.

mod cache;
mod error;
mod resolver;

pub use cache::{MetadataCache, SqliteMetadataCache};
pub use error::{Error, Result};
pub use resolver::SymbolResolver;
