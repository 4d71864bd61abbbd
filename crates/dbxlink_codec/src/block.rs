//! Block framing.
//!
//! Every unit on the wire is a block: a 4-byte little-endian payload length,
//! a 1-byte tag, then exactly `length` payload bytes. The tag packs a sort
//! code and a type code as `sort * 20 + type`.

use crate::error::{CodecError, CodecResult};
use bytes::{Buf, BufMut};

/// Size of a block header in bytes.
pub const HEADER_LEN: usize = 5;

/// What role a block plays in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Sort {
    /// Unrecognized sort code.
    Invalid = 0,
    /// A data value.
    Data = 1,
    /// A subscript of a key.
    Subscript = 2,
    /// The global name of a key.
    GlobalName = 3,
    /// Zero-length terminator of a message.
    EndOfData = 9,
    /// Status sentinel; never carries a payload.
    Status = 10,
    /// Error text.
    Error = 11,
}

impl Sort {
    /// Maps a raw sort code, normalizing unknown codes to [`Sort::Invalid`].
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Sort::Data,
            2 => Sort::Subscript,
            3 => Sort::GlobalName,
            9 => Sort::EndOfData,
            10 => Sort::Status,
            11 => Sort::Error,
            _ => Sort::Invalid,
        }
    }

    /// Returns the raw sort code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// How a block payload is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// No type information.
    None = 0,
    /// 8-bit string.
    Str8 = 2,
    /// UTF-16LE string.
    Str16 = 3,
    /// 32-bit integer in decimal text.
    Integer = 4,
    /// 64-bit integer in decimal text.
    Int64 = 5,
    /// Double in decimal text.
    Double = 6,
    /// Object reference (decimal handle).
    ObjectRef = 7,
    /// Null value.
    Null = 10,
}

impl DataType {
    /// Maps a raw type code, normalizing unknown codes to [`DataType::None`].
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => DataType::Str8,
            3 => DataType::Str16,
            4 => DataType::Integer,
            5 => DataType::Int64,
            6 => DataType::Double,
            7 => DataType::ObjectRef,
            10 => DataType::Null,
            _ => DataType::None,
        }
    }

    /// Returns the raw type code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Human readable name, used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            DataType::None => "none",
            DataType::Str8 => "string-8",
            DataType::Str16 => "string-16",
            DataType::Integer => "integer",
            DataType::Int64 => "int64",
            DataType::Double => "double",
            DataType::ObjectRef => "object reference",
            DataType::Null => "null",
        }
    }
}

/// Packs a sort and type into a block tag.
pub fn tag(sort: Sort, ty: DataType) -> u8 {
    sort.code() * 20 + ty.code()
}

/// Splits a block tag into its sort and type.
pub fn split_tag(tag: u8) -> (Sort, DataType) {
    (Sort::from_code(tag / 20), DataType::from_code(tag % 20))
}

/// A decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Number of payload bytes following the header.
    pub len: u32,
    /// Block sort.
    pub sort: Sort,
    /// Payload type.
    pub ty: DataType,
}

impl BlockHeader {
    /// Creates a header.
    pub fn new(len: u32, sort: Sort, ty: DataType) -> Self {
        Self { len, sort, ty }
    }

    /// Total size of the block (header plus payload).
    pub fn block_len(&self) -> usize {
        HEADER_LEN + self.len as usize
    }

    /// Writes the header into the first [`HEADER_LEN`] bytes of `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`HEADER_LEN`].
    pub fn write_to(&self, mut out: &mut [u8]) {
        out.put_u32_le(self.len);
        out.put_u8(tag(self.sort, self.ty));
    }

    /// Parses a header from the first [`HEADER_LEN`] bytes of `raw`.
    ///
    /// A STATUS block never has a payload: its length is reported as zero
    /// whatever the length field holds.
    pub fn parse(raw: &[u8]) -> CodecResult<Self> {
        if raw.len() < HEADER_LEN {
            return Err(CodecError::truncated(HEADER_LEN, raw.len()));
        }
        let mut cursor = &raw[..HEADER_LEN];
        let len = cursor.get_u32_le();
        let (sort, ty) = split_tag(cursor.get_u8());
        let len = if sort == Sort::Status { 0 } else { len };
        Ok(Self { len, sort, ty })
    }
}

/// Encodes one block into `buf` at `offset`, growing `buf` as needed.
///
/// Returns the number of bytes written (header plus payload).
pub fn encode_block(
    buf: &mut Vec<u8>,
    offset: usize,
    payload: &[u8],
    sort: Sort,
    ty: DataType,
) -> CodecResult<usize> {
    let len =
        u32::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge { len: payload.len() })?;
    let end = offset + HEADER_LEN + payload.len();
    if buf.len() < end {
        buf.resize(end, 0);
    }
    BlockHeader::new(len, sort, ty).write_to(&mut buf[offset..offset + HEADER_LEN]);
    buf[offset + HEADER_LEN..end].copy_from_slice(payload);
    Ok(HEADER_LEN + payload.len())
}

/// Appends one block to the end of `buf`.
pub fn push_block(buf: &mut Vec<u8>, payload: &[u8], sort: Sort, ty: DataType) -> CodecResult<usize> {
    let offset = buf.len();
    encode_block(buf, offset, payload, sort, ty)
}

/// Appends the zero-length END-OF-DATA terminator.
pub fn push_end_of_data(buf: &mut Vec<u8>) -> usize {
    let offset = buf.len();
    buf.resize(offset + HEADER_LEN, 0);
    BlockHeader::new(0, Sort::EndOfData, DataType::None).write_to(&mut buf[offset..]);
    HEADER_LEN
}

/// Decodes the block header at `offset`.
pub fn decode_block(buf: &[u8], offset: usize) -> CodecResult<BlockHeader> {
    let raw = buf
        .get(offset..)
        .ok_or_else(|| CodecError::truncated(offset + HEADER_LEN, buf.len()))?;
    BlockHeader::parse(raw)
}

/// Decodes the block at `offset` and returns its header and payload.
///
/// Fails if the declared payload runs past the end of `buf`.
pub fn block_at(buf: &[u8], offset: usize) -> CodecResult<(BlockHeader, &[u8])> {
    let header = decode_block(buf, offset)?;
    let start = offset + HEADER_LEN;
    let end = start + header.len as usize;
    if end > buf.len() {
        return Err(CodecError::truncated(end, buf.len()));
    }
    Ok((header, &buf[start..end]))
}
