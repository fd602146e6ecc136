//! The frontend's in-memory hierarchy: an indexed call-record store (4.J)
//! and the three pure derived-statistics views built on top of it (4.K).

mod call_record_store;
mod derived_statistics;
mod error;

pub use call_record_store::CallRecordStore;
pub use derived_statistics::{addresses, callees, callers};
pub use error::{Error, Result};
