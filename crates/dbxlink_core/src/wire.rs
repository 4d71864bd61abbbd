//! Network client for the block protocol.

use crate::arena::RequestContext;
use crate::error::{CoreError, CoreResult};
use crate::status::EngineError;
use dbxlink_codec::{Banner, BlockHeader, Command, DataType, ServerVersion, Sort, HEADER_LEN};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on the handshake reply.
const MAX_VERSION_LEN: usize = 4096;

/// Default upper bound on a response payload.
pub const DEFAULT_MAX_RESPONSE_LEN: usize = 64 * 1024 * 1024;

/// A socket session with a remote engine.
///
/// Any I/O failure, short read or timeout drops the socket; every later
/// call fails with [`CoreError::Closed`].
#[derive(Debug)]
pub struct WireClient {
    stream: Option<TcpStream>,
    address: String,
    version: ServerVersion,
    max_response_len: usize,
}

impl WireClient {
    /// Connects, sends the banner and reads the server version.
    pub fn connect(
        address: &str,
        namespace: &str,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
    ) -> CoreResult<Self> {
        let addrs = address
            .to_socket_addrs()
            .map_err(|e| CoreError::connection(format!("cannot resolve {address}: {e}")))?;

        let mut last_error = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let mut stream = stream.ok_or_else(|| {
            let reason = last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string());
            CoreError::connection(format!("cannot connect to {address}: {reason}"))
        })?;

        let setup = |stream: &TcpStream| -> io::Result<()> {
            stream.set_read_timeout(read_timeout)?;
            stream.set_write_timeout(read_timeout)?;
            stream.set_nodelay(true)
        };
        setup(&stream).map_err(|e| CoreError::connection(e.to_string()))?;

        let version = handshake(&mut stream, namespace)?;
        info!(%address, version = %version, "connected");
        Ok(Self {
            stream: Some(stream),
            address: address.to_string(),
            version,
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
        })
    }

    /// Caps the payload length accepted in a response. A larger header is
    /// a protocol error and drops the socket before anything is allocated.
    pub fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = len;
        self
    }

    /// Version reported by the server at handshake.
    pub fn version(&self) -> &ServerVersion {
        &self.version
    }

    /// Returns true until the socket has been dropped.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends the request staged in `ctx` and reads the single response
    /// block into its output buffer.
    pub fn send_command(&mut self, command: Command, ctx: &mut RequestContext) -> CoreResult<()> {
        let stream = self.stream.as_mut().ok_or(CoreError::Closed)?;
        let result = exchange(stream, command, ctx, self.max_response_len);
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(address = %self.address, %command, error = %e, "dropping connection");
                self.disconnect();
            }
        }
        result
    }

    /// Shuts the socket down.
    pub fn close(&mut self) {
        if self.stream.is_some() {
            debug!(address = %self.address, "closing socket");
            self.disconnect();
        }
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn handshake(stream: &mut TcpStream, namespace: &str) -> CoreResult<ServerVersion> {
    let fail = |e: io::Error| CoreError::connection(format!("handshake failed: {e}"));
    stream.write_all(&Banner::new(namespace).encode()).map_err(fail)?;

    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).map_err(fail)?;
    let header = BlockHeader::parse(&raw).map_err(|e| CoreError::connection(e.to_string()))?;
    let len = header.len as usize;
    if len > MAX_VERSION_LEN {
        return Err(CoreError::connection(format!(
            "handshake reply of {len} bytes"
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).map_err(fail)?;
    let text = String::from_utf8_lossy(&payload);

    if header.sort == Sort::Error {
        return Err(CoreError::connection(format!("server refused session: {text}")));
    }
    ServerVersion::parse(&text).map_err(|e| CoreError::connection(e.to_string()))
}

fn io_failure(step: &str, e: io::Error) -> CoreError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            CoreError::protocol(format!("timed out during {step}"))
        }
        io::ErrorKind::UnexpectedEof => CoreError::protocol(format!("connection closed during {step}")),
        _ => CoreError::protocol(format!("{step} failed: {e}")),
    }
}

fn exchange(
    stream: &mut TcpStream,
    command: Command,
    ctx: &mut RequestContext,
    max_len: usize,
) -> CoreResult<()> {
    let message = ctx.finish_request(command)?;
    stream
        .write_all(message)
        .map_err(|e| io_failure("request write", e))?;

    let mut raw = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut raw)
        .map_err(|e| io_failure("response header read", e))?;
    let header = BlockHeader::parse(&raw).map_err(|e| CoreError::protocol(e.to_string()))?;

    let len = header.len as usize;
    if len > max_len {
        return Err(CoreError::protocol(format!(
            "response of {len} bytes exceeds limit of {max_len}"
        )));
    }
    let payload = ctx.prepare_output(len)?;
    stream
        .read_exact(payload)
        .map_err(|e| io_failure("response payload read", e))?;
    ctx.set_reply_type(header.ty);

    match header.sort {
        Sort::Error => {
            let text = String::from_utf8_lossy(ctx.output());
            Err(EngineError::from_wire_text(&text).into())
        }
        Sort::Data | Sort::Status => {
            if header.ty == DataType::ObjectRef {
                let valid = std::str::from_utf8(ctx.output())
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .is_some();
                if !valid {
                    return Err(CoreError::protocol("malformed object reference"));
                }
            }
            Ok(())
        }
        other => Err(CoreError::protocol(format!(
            "unexpected {other:?} block in response"
        ))),
    }
}
