pub(crate) mod codec;
pub(crate) mod header;
mod message;

pub use codec::{decode_message, encode_message, read_framed};
pub use header::{HEADER_SIZE, Header, MessageType};
pub use message::{BenchMessage, MemoryDescriptor, PeerEntry};
