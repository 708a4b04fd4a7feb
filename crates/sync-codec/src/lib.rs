//! Length-prefixed binary wire framing shared by the sync client and server.
//!
//! A message is an ordered tuple of typed fields: the codec writes a short
//! name tag followed by each field in declared order, and the reader
//! matches on the tag then reads fields back in the same order. See
//! [`MessageWriter`]/[`MessageReader`] for the field primitives and
//! [`try_decode_frame`]/[`encode_frame`] for the outer length-prefixed
//! framing that makes partial TCP reads ("needs more bytes") distinguishable
//! from a genuinely malformed message.

mod error;
mod frame;
mod reader;
mod signed;
mod version;
mod writer;

pub use error::{CodecError, CodecResult};
pub use frame::{encode_frame, try_decode_frame, DEFAULT_MAX_FRAME_LEN, PING_BYTE};
pub use reader::MessageReader;
pub use signed::{append_signature, split_signature, SIGNATURE_LEN};
pub use version::{min_compatible_version, protocol_version, Version};
pub use writer::MessageWriter;
