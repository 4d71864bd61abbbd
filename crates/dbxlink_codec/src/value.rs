//! Typed argument values.
//!
//! Every value travels as text inside a block payload: numbers in decimal,
//! narrow strings as raw bytes, wide strings as UTF-16LE. The block's type
//! code says how to read the text back.

use crate::block::{DataType, Sort};
use crate::error::{CodecError, CodecResult};
use std::borrow::Cow;

/// An owned, typed argument or result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Null value.
    Null,
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Int64(i64),
    /// Double.
    Double(f64),
    /// 8-bit string (not necessarily UTF-8).
    Str(Vec<u8>),
    /// 16-bit string.
    WStr(Vec<u16>),
    /// Opaque object reference handle.
    ObjectRef(u64),
}

impl Arg {
    /// Creates a narrow string argument.
    pub fn text(s: impl AsRef<str>) -> Self {
        Arg::Str(s.as_ref().as_bytes().to_vec())
    }

    /// Creates a wide string argument.
    pub fn wide(s: impl AsRef<str>) -> Self {
        Arg::WStr(s.as_ref().encode_utf16().collect())
    }

    /// Returns the type code this value is sent with.
    pub fn data_type(&self) -> DataType {
        match self {
            Arg::Null => DataType::Null,
            Arg::Int(_) => DataType::Integer,
            Arg::Int64(_) => DataType::Int64,
            Arg::Double(_) => DataType::Double,
            Arg::Str(_) => DataType::Str8,
            Arg::WStr(_) => DataType::Str16,
            Arg::ObjectRef(_) => DataType::ObjectRef,
        }
    }

    /// Encodes the value as a block payload.
    ///
    /// With `wide` set, narrow UTF-8 strings are widened to UTF-16; strings
    /// that are not valid UTF-8 stay narrow.
    pub fn encode(&self, wide: bool) -> (DataType, Vec<u8>) {
        match self {
            Arg::Null => (DataType::Null, Vec::new()),
            Arg::Int(n) => (DataType::Integer, n.to_string().into_bytes()),
            Arg::Int64(n) => (DataType::Int64, n.to_string().into_bytes()),
            Arg::Double(d) => (DataType::Double, d.to_string().into_bytes()),
            Arg::ObjectRef(h) => (DataType::ObjectRef, h.to_string().into_bytes()),
            Arg::Str(bytes) => match (wide, std::str::from_utf8(bytes)) {
                (true, Ok(s)) => (DataType::Str16, utf16_le_bytes(s.encode_utf16())),
                _ => (DataType::Str8, bytes.clone()),
            },
            Arg::WStr(units) => (DataType::Str16, utf16_le_bytes(units.iter().copied())),
        }
    }

    /// Decodes a block payload of the given type.
    pub fn decode(ty: DataType, payload: &[u8]) -> CodecResult<Self> {
        ArgView::new(Sort::Data, ty, payload).to_arg()
    }
}

impl From<i32> for Arg {
    fn from(n: i32) -> Self {
        Arg::Int(n)
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Arg::Int64(n)
    }
}

impl From<f64> for Arg {
    fn from(d: f64) -> Self {
        Arg::Double(d)
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::text(s)
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s.into_bytes())
    }
}

impl From<&[u8]> for Arg {
    fn from(bytes: &[u8]) -> Self {
        Arg::Str(bytes.to_vec())
    }
}

fn utf16_le_bytes(units: impl Iterator<Item = u16>) -> Vec<u8> {
    units.flat_map(u16::to_le_bytes).collect()
}

/// A borrowed view of one block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgView<'a> {
    /// Block sort.
    pub sort: Sort,
    /// Declared payload type.
    pub ty: DataType,
    /// Raw payload bytes.
    pub bytes: &'a [u8],
}

impl<'a> ArgView<'a> {
    /// Creates a view.
    pub fn new(sort: Sort, ty: DataType, bytes: &'a [u8]) -> Self {
        Self { sort, ty, bytes }
    }

    /// Returns the payload as text, decoding UTF-16 when the type says so.
    pub fn text(&self) -> Cow<'a, str> {
        if self.ty == DataType::Str16 {
            let units: Vec<u16> = self
                .bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            Cow::Owned(String::from_utf16_lossy(&units))
        } else {
            String::from_utf8_lossy(self.bytes)
        }
    }

    /// Returns the payload as narrow bytes, narrowing UTF-16 if needed.
    pub fn to_bytes(&self) -> Cow<'a, [u8]> {
        if self.ty == DataType::Str16 {
            Cow::Owned(self.text().into_owned().into_bytes())
        } else {
            Cow::Borrowed(self.bytes)
        }
    }

    /// Interprets the payload as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.text().trim().parse().ok()
    }

    /// Interprets the payload as a double.
    pub fn as_f64(&self) -> Option<f64> {
        self.text().trim().parse().ok()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Converts to an owned value, validating the payload against its type.
    pub fn to_arg(&self) -> CodecResult<Arg> {
        let invalid = |message: String| CodecError::invalid_payload(self.ty.name(), message);
        match self.ty {
            DataType::Null => Ok(Arg::Null),
            DataType::None | DataType::Str8 => Ok(Arg::Str(self.bytes.to_vec())),
            DataType::Str16 => {
                if self.bytes.len() % 2 != 0 {
                    return Err(invalid(format!("odd length {}", self.bytes.len())));
                }
                Ok(Arg::WStr(
                    self.bytes
                        .chunks_exact(2)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                        .collect(),
                ))
            }
            DataType::Integer => self
                .text()
                .trim()
                .parse()
                .map(Arg::Int)
                .map_err(|e| invalid(e.to_string())),
            DataType::Int64 => self
                .text()
                .trim()
                .parse()
                .map(Arg::Int64)
                .map_err(|e| invalid(e.to_string())),
            DataType::Double => self
                .text()
                .trim()
                .parse()
                .map(Arg::Double)
                .map_err(|e| invalid(e.to_string())),
            DataType::ObjectRef => self
                .text()
                .trim()
                .parse()
                .map(Arg::ObjectRef)
                .map_err(|e| invalid(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_travel_as_decimal_text() {
        assert_eq!(Arg::Int(-42).encode(false), (DataType::Integer, b"-42".to_vec()));
        assert_eq!(Arg::Int64(1 << 40).encode(false).1, b"1099511627776".to_vec());
        assert_eq!(Arg::Double(2.5).encode(false).1, b"2.5".to_vec());
        assert_eq!(Arg::ObjectRef(7).encode(false), (DataType::ObjectRef, b"7".to_vec()));
    }

    #[test]
    fn wide_mode_widens_utf8_strings() {
        let (ty, bytes) = Arg::text("hé").encode(true);
        assert_eq!(ty, DataType::Str16);
        assert_eq!(bytes, vec![b'h', 0, 0xE9, 0]);

        let view = ArgView::new(Sort::Data, ty, &bytes);
        assert_eq!(view.text(), "hé");
        assert_eq!(view.to_bytes().as_ref(), "hé".as_bytes());
    }

    #[test]
    fn invalid_utf8_stays_narrow() {
        let (ty, bytes) = Arg::Str(vec![0xFF, 0x00]).encode(true);
        assert_eq!(ty, DataType::Str8);
        assert_eq!(bytes, vec![0xFF, 0x00]);
    }

    #[test]
    fn decode_validates_type() {
        assert_eq!(Arg::decode(DataType::Integer, b"12"), Ok(Arg::Int(12)));
        assert_eq!(Arg::decode(DataType::ObjectRef, b"99"), Ok(Arg::ObjectRef(99)));
        assert!(matches!(
            Arg::decode(DataType::Integer, b"abc"),
            Err(CodecError::InvalidPayload { .. })
        ));
        assert!(matches!(
            Arg::decode(DataType::Str16, &[1, 2, 3]),
            Err(CodecError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn view_numeric_accessors() {
        let view = ArgView::new(Sort::Subscript, DataType::Str8, b" 17 ");
        assert_eq!(view.as_i64(), Some(17));
        assert_eq!(view.as_f64(), Some(17.0));
        assert_eq!(ArgView::new(Sort::Data, DataType::Str8, b"x").as_i64(), None);
    }
}
