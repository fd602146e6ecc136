//! Accepts collector sessions, decodes framed protocol messages off them,
//! and dispatches those messages into `profiler-store` and
//! `profiler-symbols` from a single apartment thread (§5, §6).

mod dispatcher;
mod error;
mod server;
mod session;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use server::{Server, ShutdownHandle};
