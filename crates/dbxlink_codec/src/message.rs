//! Request envelopes and message iteration.
//!
//! A request is an envelope header (payload length + command code), one
//! encoding-flag byte, the argument blocks and a closing END-OF-DATA block.
//! The envelope length counts every byte after the 5-byte header. A
//! response is a single block.

use crate::block::{block_at, BlockHeader, DataType, Sort, HEADER_LEN};
use crate::command::Command;
use crate::error::{CodecError, CodecResult};
use crate::value::ArgView;

/// Size of the request envelope: block header plus the encoding flag byte.
pub const ENVELOPE_LEN: usize = HEADER_LEN + 1;

/// Encoding flag value for 8-bit strings.
pub const FLAG_NARROW: u8 = 0;

/// Encoding flag value for 16-bit strings.
pub const FLAG_WIDE: u8 = 1;

/// Decoded request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Bytes following the 5-byte header, flag byte included.
    pub len: u32,
    /// Requested command.
    pub command: Command,
    /// Whether the client negotiated 16-bit strings.
    pub wide: bool,
}

impl Envelope {
    /// Writes the envelope into the first [`ENVELOPE_LEN`] bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.len.to_le_bytes());
        out[4] = self.command.code();
        out[5] = if self.wide { FLAG_WIDE } else { FLAG_NARROW };
    }

    /// Parses the 5-byte envelope header; the flag byte is read separately
    /// with [`Envelope::with_flag`] once the body has arrived.
    pub fn parse_header(raw: &[u8]) -> CodecResult<(u32, Command)> {
        if raw.len() < HEADER_LEN {
            return Err(CodecError::truncated(HEADER_LEN, raw.len()));
        }
        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let command = Command::from_code(raw[4])?;
        Ok((len, command))
    }

    /// Completes an envelope from its header and the first body byte.
    pub fn with_flag(len: u32, command: Command, flag: u8) -> Self {
        Self {
            len,
            command,
            wide: flag == FLAG_WIDE,
        }
    }
}

/// Builds a complete request message from already-encoded argument blocks.
///
/// `blocks` must not contain the END-OF-DATA terminator; it is appended here.
pub fn encode_request(command: Command, wide: bool, blocks: &[u8]) -> CodecResult<Vec<u8>> {
    let body_len = 1 + blocks.len() + HEADER_LEN;
    let len = u32::try_from(body_len).map_err(|_| CodecError::PayloadTooLarge { len: body_len })?;
    let mut out = vec![0u8; ENVELOPE_LEN];
    Envelope { len, command, wide }.write_to(&mut out);
    out.extend_from_slice(blocks);
    crate::block::push_end_of_data(&mut out);
    Ok(out)
}

/// Encodes a single-block response.
pub fn encode_response(sort: Sort, ty: DataType, payload: &[u8]) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    crate::block::push_block(&mut out, payload, sort, ty)?;
    Ok(out)
}

/// Iterates the argument blocks of a request body up to END-OF-DATA.
///
/// `body` starts at the first argument block (after the flag byte).
pub struct BlockReader<'a> {
    body: &'a [u8],
    pos: usize,
    finished: bool,
}

impl<'a> BlockReader<'a> {
    /// Creates a reader over a request body.
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            body,
            pos: 0,
            finished: false,
        }
    }

    /// Collects every block, failing on the first malformed one.
    pub fn collect_views(self) -> CodecResult<Vec<ArgView<'a>>> {
        self.collect()
    }

    fn next_block(&mut self) -> CodecResult<Option<ArgView<'a>>> {
        if self.pos == self.body.len() {
            // A body without a terminator is accepted as ending here.
            return Ok(None);
        }
        let (header, payload): (BlockHeader, &'a [u8]) = block_at(self.body, self.pos)?;
        self.pos += header.block_len();
        if header.sort == Sort::EndOfData {
            return Ok(None);
        }
        Ok(Some(ArgView::new(header.sort, header.ty, payload)))
    }
}

impl<'a> Iterator for BlockReader<'a> {
    type Item = CodecResult<ArgView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_block() {
            Ok(Some(view)) => Some(Ok(view)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
