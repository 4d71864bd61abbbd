//! TCP listener and per-client sessions.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{error_response, RequestHandler};
use dbxlink_codec::{encode_response, Banner, Command, DataType, Sort, HEADER_LEN, MAX_BANNER_LEN};
use dbxlink_core::memory::DEFAULT_NAMESPACE;
use dbxlink_core::{Connection, ConnectionConfig, MemoryEngine};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// The wire server.
///
/// Each accepted client gets its own thread and its own engine session.
///
/// # Example
///
/// ```
/// use dbxlink_core::MemoryEngine;
/// use dbxlink_server::{ServerConfig, WireServer};
///
/// let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
/// let server = WireServer::bind(config, MemoryEngine::new()).unwrap();
/// let running = server.spawn().unwrap();
/// println!("listening on {}", running.local_addr());
/// running.stop().unwrap();
/// ```
pub struct WireServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    engine: MemoryEngine,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl WireServer {
    /// Binds the configured address.
    pub fn bind(config: ServerConfig, engine: MemoryEngine) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            config: Arc::new(config),
            engine,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The engine sessions are opened on.
    pub fn engine(&self) -> &MemoryEngine {
        &self.engine
    }

    /// Number of client sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Accepts clients until shut down.
    pub fn serve(&self) -> ServerResult<()> {
        let mut next_id = 0u64;
        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.active.load(Ordering::Acquire) >= self.config.max_connections {
                let err = ServerError::TooManyConnections(self.config.max_connections);
                warn!(error = %err, "rejecting client");
                if let Ok(reply) = error_response(&err) {
                    let _ = (&stream).write_all(&reply);
                }
                continue;
            }

            next_id += 1;
            let guard = ActiveGuard::new(Arc::clone(&self.active));
            let engine = self.engine.clone();
            let config = Arc::clone(&self.config);
            let spawned = thread::Builder::new()
                .name(format!("dbxlink-session-{next_id}"))
                .spawn(move || {
                    let _guard = guard;
                    let peer = stream.peer_addr().ok();
                    match serve_client(stream, &engine, &config) {
                        Ok(()) => debug!(?peer, "session ended"),
                        Err(e) => warn!(?peer, error = %e, "session failed"),
                    }
                });
            if let Err(e) = spawned {
                warn!(error = %e, "cannot start session thread");
            }
        }
        info!("server stopped");
        Ok(())
    }

    /// Runs [`WireServer::serve`] on a background thread.
    pub fn spawn(self) -> ServerResult<RunningServer> {
        let addr = self.local_addr()?;
        let shutdown = Arc::clone(&self.shutdown);
        let active = Arc::clone(&self.active);
        let thread = thread::Builder::new()
            .name("dbxlink-listener".into())
            .spawn(move || self.serve())?;
        Ok(RunningServer {
            addr,
            shutdown,
            active,
            thread: Some(thread),
        })
    }
}

/// A server accepting clients on a background thread.
pub struct RunningServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    thread: Option<JoinHandle<ServerResult<()>>>,
}

impl RunningServer {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of client sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stops accepting clients and waits for the listener to exit.
    ///
    /// Sessions already running finish on their own.
    pub fn stop(mut self) -> ServerResult<()> {
        self.shutdown_listener()
    }

    fn shutdown_listener(&mut self) -> ServerResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::Release);
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.addr);
        thread
            .join()
            .map_err(|_| ServerError::Io(io::Error::other("listener thread panicked")))?
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_listener() {
            warn!(error = %e, "listener did not stop cleanly");
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn serve_client(stream: TcpStream, engine: &MemoryEngine, config: &ServerConfig) -> ServerResult<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(config.read_timeout)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let banner = match read_banner(&mut reader) {
        Ok(banner) => banner,
        Err(e) => {
            writer.write_all(&error_response(&e)?)?;
            return Err(e);
        }
    };
    let namespace = if banner.namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        banner.namespace.to_uppercase()
    };
    if !engine.has_namespace(&namespace) {
        let err = ServerError::Handshake(namespace);
        writer.write_all(&error_response(&err)?)?;
        return Err(err);
    }

    let connection = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session())).with_namespace(namespace.as_str()),
    )?;
    let version = config.version.as_deref().unwrap_or(engine.version());
    writer.write_all(&encode_response(Sort::Data, DataType::Str8, version.as_bytes())?)?;
    debug!(%namespace, "handshake complete");

    let handler = RequestHandler::new(connection);
    let result = request_loop(&handler, &mut reader, &mut writer, config);
    handler.connection().close();
    result
}

fn request_loop(
    handler: &RequestHandler,
    reader: &mut impl Read,
    writer: &mut impl Write,
    config: &ServerConfig,
) -> ServerResult<()> {
    loop {
        let frame = match read_frame(reader, config.max_request_len) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                if !matches!(e, ServerError::Io(_)) {
                    writer.write_all(&error_response(&e)?)?;
                }
                if e.ends_session() {
                    return Err(e);
                }
                continue;
            }
        };
        writer.write_all(&handler.handle(frame.command, &frame.body)?)?;
        if frame.command == Command::Close {
            return Ok(());
        }
    }
}

struct Frame {
    command: Command,
    body: Vec<u8>,
}

/// Reads one request; `Ok(None)` means the client hung up between requests.
fn read_frame(reader: &mut impl Read, max_len: usize) -> ServerResult<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > max_len {
        return Err(ServerError::RequestTooLarge {
            len,
            limit: max_len,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    // Decoded after the body so an unknown code leaves the stream in step.
    let command = Command::from_code(header[4])?;
    Ok(Some(Frame { command, body }))
}

fn read_banner(reader: &mut impl BufRead) -> ServerResult<Banner> {
    let mut line = Vec::new();
    (&mut *reader)
        .take(MAX_BANNER_LEN as u64)
        .read_until(b'\n', &mut line)?;
    if line.last() != Some(&b'\n') {
        return Err(ServerError::Handshake("banner too long or incomplete".into()));
    }
    Ok(Banner::parse(&line)?)
}
