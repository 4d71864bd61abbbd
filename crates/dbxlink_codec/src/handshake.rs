//! Connection handshake.
//!
//! The client opens with a one-line text banner naming the protocol and the
//! namespace it wants. The server answers with one block whose payload is
//! its version string, or an ERROR block if it refuses the session.

use crate::error::{CodecError, CodecResult};

/// Protocol identifier at the start of every banner.
pub const PROTOCOL_ID: &str = "dbx1";

/// Upper bound on banner length accepted by a server.
pub const MAX_BANNER_LEN: usize = 256;

/// The client's opening banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    /// Namespace requested by the client; empty means the server default.
    pub namespace: String,
}

impl Banner {
    /// Creates a banner for `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Encodes as `dbx1~<namespace>\n`.
    pub fn encode(&self) -> Vec<u8> {
        format!("{PROTOCOL_ID}~{}\n", self.namespace).into_bytes()
    }

    /// Parses a banner line, with or without its trailing newline.
    pub fn parse(line: &[u8]) -> CodecResult<Self> {
        let text = std::str::from_utf8(line)
            .map_err(|_| CodecError::invalid_handshake("banner is not UTF-8"))?;
        let text = text.trim_end_matches(['\n', '\r']);
        let (id, namespace) = text
            .split_once('~')
            .ok_or_else(|| CodecError::invalid_handshake("banner has no separator"))?;
        if id != PROTOCOL_ID {
            return Err(CodecError::invalid_handshake(format!(
                "unsupported protocol {id:?}"
            )));
        }
        Ok(Self::new(namespace))
    }
}

/// Version reported by the server, split into numeric fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Build number.
    pub build: u32,
    /// The version string exactly as received.
    pub text: String,
}

impl ServerVersion {
    /// Parses the first three numeric groups of a version string.
    ///
    /// Missing trailing groups default to zero; a string with no digits at
    /// all is rejected.
    pub fn parse(text: &str) -> CodecResult<Self> {
        let mut fields = text
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u32>());

        let mut next = || -> CodecResult<Option<u32>> {
            fields
                .next()
                .transpose()
                .map_err(|e| CodecError::invalid_handshake(format!("bad version field: {e}")))
        };

        let major = next()?
            .ok_or_else(|| CodecError::invalid_handshake(format!("no version in {text:?}")))?;
        let minor = next()?.unwrap_or(0);
        let build = next()?.unwrap_or(0);

        Ok(Self {
            major,
            minor,
            build,
            text: text.to_string(),
        })
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_roundtrip() {
        let banner = Banner::new("USER");
        let bytes = banner.encode();
        assert_eq!(bytes, b"dbx1~USER\n");
        assert_eq!(Banner::parse(&bytes).unwrap(), banner);
    }

    #[test]
    fn banner_rejects_foreign_protocol() {
        assert!(Banner::parse(b"http~x\n").is_err());
        assert!(Banner::parse(b"dbx1").is_err());
    }

    #[test]
    fn version_fields() {
        let v = ServerVersion::parse("dbxlink 2.3.117 (memory)").unwrap();
        assert_eq!((v.major, v.minor, v.build), (2, 3, 117));
        assert_eq!(v.to_string(), "2.3.117");

        let v = ServerVersion::parse("7").unwrap();
        assert_eq!((v.major, v.minor, v.build), (7, 0, 0));

        assert!(ServerVersion::parse("none").is_err());
    }
}
