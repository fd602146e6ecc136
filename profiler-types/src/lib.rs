//! Data model shared between the collector (in-process agent) and the
//! frontend (out-of-process analyzer). Kept dependency-light and
//! `serde`-friendly so it can be used directly as the protocol payload shape.

mod call_record;
mod error;
mod histogram;
mod ids;
mod module;
mod patch;
mod symbol;
mod thread;
mod trace_event;

pub use call_record::{CallRecord, CallRecordDelta};
pub use error::Error;
pub use histogram::Histogram;
pub use ids::{Id, IdGenerator, LongAddress, ModuleId, Rva, ROOT_CALL_ID};
pub use module::{ModuleMapping, ModuleMetadata, SourceFile};
pub use patch::{PatchRecord, PatchState};
pub use symbol::Symbol;
pub use thread::ThreadInfo;
pub use trace_event::TraceEvent;
