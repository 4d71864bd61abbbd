//! # dbxlink Codec
//!
//! Block framing for the dbxlink wire protocol.
//!
//! A block is a 5-byte header (4-byte little-endian payload length, 1-byte
//! tag) followed by exactly that many payload bytes. The tag packs a
//! [`Sort`] and a [`DataType`]. A request is an [`Envelope`] followed by
//! argument blocks and a zero-length END-OF-DATA block; a response is a
//! single block, with the ERROR sort reserved for failures.
//!
//! ## Usage
//!
//! ```
//! use dbxlink_codec::{block_at, push_block, DataType, Sort};
//!
//! let mut buf = Vec::new();
//! push_block(&mut buf, b"hello", Sort::Data, DataType::Str8).unwrap();
//!
//! let (header, payload) = block_at(&buf, 0).unwrap();
//! assert_eq!(header.len, 5);
//! assert_eq!(payload, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod block;
mod command;
mod error;
mod handshake;
mod message;
mod value;

pub use block::{
    block_at, decode_block, encode_block, push_block, push_end_of_data, split_tag, tag,
    BlockHeader, DataType, Sort, HEADER_LEN,
};
pub use command::Command;
pub use error::{CodecError, CodecResult};
pub use handshake::{Banner, ServerVersion, MAX_BANNER_LEN, PROTOCOL_ID};
pub use message::{
    encode_request, encode_response, BlockReader, Envelope, ENVELOPE_LEN, FLAG_NARROW, FLAG_WIDE,
};
pub use value::{Arg, ArgView};
