//! Tagged, length-prefixed message framing between the collector and the
//! frontend, plus the TLV encoding for the entities in `profiler-types`.
//!
//! Wire shape: `{ u32 tag, u32 length, payload[length] }`, little-endian.
//! Request/response messages additionally carry a `u32 token` as the first
//! field of their payload, used to correlate a response with its request.

mod codec;
mod error;
mod frame;
mod message;

pub use codec::{byte_order_probe, ByteOrder, Reader, Writer};
pub use error::Error;
pub use frame::{read_frame, write_frame, Frame};
pub use message::{Message, PatchOutcome, Tag, Token};

pub type Result<T> = std::result::Result<T, Error>;
