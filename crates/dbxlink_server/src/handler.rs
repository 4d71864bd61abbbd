//! Per-request decoding, dispatch and reply encoding.

use crate::error::{ServerError, ServerResult};
use dbxlink_codec::{encode_response, Arg, BlockReader, Command, DataType, Sort, FLAG_WIDE};
use dbxlink_core::{Connection, Request};
use tracing::debug;

/// Executes decoded requests for one client session.
///
/// The session's engine work goes through an embedded [`Connection`], so
/// transactions opened by the client are pinned exactly as they would be
/// in-process.
pub struct RequestHandler {
    connection: Connection,
}

impl RequestHandler {
    /// Creates a handler over an open connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// The connection requests are dispatched on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Decodes a request body: the encoding flag byte, then argument blocks.
    pub fn decode(command: Command, body: &[u8]) -> ServerResult<Request> {
        let blocks = body.get(1..).unwrap_or_default();
        let mut request = Request::new(command);
        for view in BlockReader::new(blocks).collect_views()? {
            request = request.arg(view.sort, view.to_arg()?);
        }
        Ok(request)
    }

    /// Runs one request and returns the encoded response block.
    ///
    /// Text replies follow the width the client asked for in the flag byte.
    pub fn handle(&self, command: Command, body: &[u8]) -> ServerResult<Vec<u8>> {
        let wide = body.first() == Some(&FLAG_WIDE);
        let result = Self::decode(command, body)
            .and_then(|request| self.connection.dispatch(&request).map_err(ServerError::from));
        match result {
            Ok(outcome) => {
                let (ty, payload) = match outcome.ty {
                    DataType::Str8 if wide => Arg::Str(outcome.payload).encode(true),
                    ty => (ty, outcome.payload),
                };
                Ok(encode_response(Sort::Data, ty, &payload)?)
            }
            Err(e) => {
                debug!(%command, error = %e, "request failed");
                error_response(&e)
            }
        }
    }
}

/// Encodes `err` as an ERROR block.
pub fn error_response(err: &ServerError) -> ServerResult<Vec<u8>> {
    let text = err.to_engine_error().to_wire_text();
    Ok(encode_response(Sort::Error, DataType::Str8, text.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbxlink_codec::{block_at, push_block, push_end_of_data, ArgView, FLAG_NARROW};
    use dbxlink_core::{ConnectionConfig, MemoryEngine};
    use std::sync::Arc;

    fn handler() -> RequestHandler {
        let engine = MemoryEngine::new();
        let conn = Connection::open(ConnectionConfig::embedded(Arc::new(engine.session()))).unwrap();
        RequestHandler::new(conn)
    }

    fn body(args: &[(Sort, &[u8])]) -> Vec<u8> {
        let mut buf = vec![FLAG_NARROW];
        for (sort, bytes) in args {
            push_block(&mut buf, bytes, *sort, DataType::Str8).unwrap();
        }
        push_end_of_data(&mut buf);
        buf
    }

    fn reply(raw: &[u8]) -> (Sort, Vec<u8>) {
        let (header, payload) = block_at(raw, 0).unwrap();
        (header.sort, payload.to_vec())
    }

    #[test]
    fn decode_keeps_argument_order() {
        let raw = body(&[(Sort::GlobalName, b"^A"), (Sort::Subscript, b"1"), (Sort::Data, b"x")]);
        let request = RequestHandler::decode(Command::Set, &raw).unwrap();
        let sorts: Vec<Sort> = request.args().iter().map(|(s, _)| *s).collect();
        assert_eq!(sorts, vec![Sort::GlobalName, Sort::Subscript, Sort::Data]);
    }

    #[test]
    fn decode_accepts_empty_body() {
        let request = RequestHandler::decode(Command::TLevel, &[]).unwrap();
        assert!(request.args().is_empty());
    }

    #[test]
    fn set_then_get() {
        let h = handler();
        let set = body(&[(Sort::GlobalName, b"^A"), (Sort::Subscript, b"1"), (Sort::Data, b"x")]);
        assert_eq!(reply(&h.handle(Command::Set, &set).unwrap()).0, Sort::Data);

        let get = body(&[(Sort::GlobalName, b"^A"), (Sort::Subscript, b"1")]);
        let (sort, payload) = reply(&h.handle(Command::Get, &get).unwrap());
        assert_eq!(sort, Sort::Data);
        assert_eq!(payload, b"x");
    }

    #[test]
    fn wide_requests_get_wide_text() {
        let h = handler();
        let set = body(&[(Sort::GlobalName, b"^W"), (Sort::Data, "ключ".as_bytes())]);
        h.handle(Command::Set, &set).unwrap();

        let mut get = body(&[(Sort::GlobalName, b"^W")]);
        get[0] = FLAG_WIDE;
        let raw = h.handle(Command::Get, &get).unwrap();
        let (header, payload) = block_at(&raw, 0).unwrap();
        assert_eq!(header.ty, DataType::Str16);
        assert_eq!(ArgView::new(Sort::Data, header.ty, payload).text(), "ключ");

        let raw = h.handle(Command::Get, &body(&[(Sort::GlobalName, b"^W")])).unwrap();
        assert_eq!(block_at(&raw, 0).unwrap().0.ty, DataType::Str8);
    }

    #[test]
    fn commit_without_transaction_is_error_block() {
        let h = handler();
        let (sort, payload) = reply(&h.handle(Command::TCommit, &body(&[])).unwrap());
        assert_eq!(sort, Sort::Error);
        assert!(payload.starts_with(b"<NO TRANSACTION>"));
    }

    #[test]
    fn truncated_block_is_syntax_error() {
        let h = handler();
        let mut raw = body(&[(Sort::GlobalName, b"^A")]);
        raw.truncate(4);
        let (sort, payload) = reply(&h.handle(Command::Get, &raw).unwrap());
        assert_eq!(sort, Sort::Error);
        assert!(payload.starts_with(b"<SYNTAX>"));
    }
}
