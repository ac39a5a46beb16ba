//! TCP transport server.
//!
//! Accepts connections on one or more worker listeners, frames the byte
//! stream into newline-terminated payloads, and routes them to a
//! [`ConnectionHandler`]. Each worker owns its own handler instance.

use std::net::SocketAddr;
use std::sync::Arc;

use rpc_protocol::ConnectionContext;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Outcome of the connect-time gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    Accept,
    /// Send this payload, then close before reading anything.
    Reject(String),
}

/// Trait implemented by the dispatch core to handle connection events.
///
/// The transport calls these serially per connection: `on_connect` once,
/// `on_message` for each framed payload in receipt order, `on_close` once.
/// `on_message` runs to completion before the next payload on the same
/// connection is read. It runs on tokio's blocking pool, so it may block
/// without stalling other connections.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, connection: &ConnectionContext) -> ConnectDecision;

    /// Handle one payload (line terminator stripped, bytes as received)
    /// and return the reply payload.
    fn on_message(&self, connection: &ConnectionContext, payload: &[u8]) -> String;

    fn on_close(&self, _connection: &ConnectionContext) {}
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hostname or IP to bind to
    pub hostname: String,
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Number of workers accepting connections
    pub count: usize,
    /// Give every worker its own SO_REUSEPORT listener
    pub reuse_port: bool,
    /// Longest accepted line, in bytes
    pub max_package_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".into(),
            port: 8888,
            count: 8,
            reuse_port: true,
            max_package_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("connection closed by peer")]
    Closed,
}

/// The transport server. Owns the worker accept loops.
pub struct TransportServer {
    /// Shutdown signal shared by all workers
    shutdown_tx: broadcast::Sender<()>,
    /// Worker task handles
    handles: Vec<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start `config.count` workers. `make_handler` is called once per worker
    /// with the worker index.
    pub async fn start<H, F>(
        config: TransportConfig,
        mut make_handler: F,
    ) -> Result<Self, TransportError>
    where
        H: ConnectionHandler,
        F: FnMut(usize) -> H,
    {
        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port)
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("{}:{}", config.hostname, config.port)))?;
        let count = config.count.max(1);

        let first = bind_listener(addr, config.reuse_port)?;
        let port = first.local_addr()?.port();
        let bound = SocketAddr::new(addr.ip(), port);

        let first = Arc::new(first);
        let mut listeners = vec![first.clone()];
        for _ in 1..count {
            if config.reuse_port {
                listeners.push(Arc::new(bind_listener(bound, true)?));
            } else {
                listeners.push(first.clone());
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let max_package_size = config.max_package_size;
        let mut handles = Vec::with_capacity(count);
        for (worker, listener) in listeners.into_iter().enumerate() {
            let handler = Arc::new(make_handler(worker));
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_worker(
                worker,
                listener,
                handler,
                max_package_size,
                shutdown_rx,
            )));
        }

        info!(
            "RPC transport listening on tcp://{}:{} ({} workers, reuse_port={})",
            config.hostname, port, count, config.reuse_port
        );

        Ok(Self {
            shutdown_tx,
            handles,
            port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting new connections and wait for the workers to exit.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("RPC transport server stopped");
    }
}

fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener, TransportError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    {
        if reuse_port {
            socket.set_reuseport(true)?;
        }
    }
    #[cfg(not(unix))]
    {
        if reuse_port {
            warn!("SO_REUSEPORT is not available on this platform; workers share one listener");
        }
    }
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Workers and connections
// ─────────────────────────────────────────────────────────────────────────────

async fn run_worker<H: ConnectionHandler>(
    worker: usize,
    listener: Arc<TcpListener>,
    handler: Arc<H>,
    max_package_size: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Worker {worker} accepting connections");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(handle_connection(stream, peer, handler, max_package_size));
                    }
                    Err(e) => {
                        warn!("Worker {worker} accept failed: {e}");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Worker {worker} shutting down");
                break;
            }
        }
    }
}

async fn handle_connection<H: ConnectionHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    max_package_size: usize,
) {
    let connection = ConnectionContext::from_peer(uuid::Uuid::new_v4().to_string(), peer);
    let (read_half, mut write_half) = stream.into_split();

    match handler.on_connect(&connection) {
        ConnectDecision::Accept => {
            serve_messages(read_half, &mut write_half, &connection, &handler, max_package_size)
                .await;
        }
        ConnectDecision::Reject(payload) => {
            if let Err(e) = write_line(&mut write_half, payload.as_bytes()).await {
                debug!("Failed to send rejection to {}: {e}", connection.peer());
            }
            let _ = write_half.shutdown().await;
        }
    }

    handler.on_close(&connection);
}

async fn serve_messages<H: ConnectionHandler>(
    read_half: OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    connection: &ConnectionContext,
    handler: &Arc<H>,
    max_package_size: usize,
) {
    let mut reader = BufReader::new(read_half);
    let mut frame = Vec::new();

    loop {
        frame.clear();
        match read_frame(&mut reader, &mut frame, max_package_size).await {
            Ok(Frame::Line) => {
                let payload = trim_line_end(&frame);
                if payload.is_empty() {
                    continue;
                }
                let reply = match call_handler(handler, connection, payload.to_vec()).await {
                    Some(reply) => reply,
                    None => break,
                };
                if let Err(e) = write_line(write_half, reply.as_bytes()).await {
                    warn!("Failed to send response to {}: {e}", connection.peer());
                    break;
                }
            }
            Ok(Frame::Eof) => break,
            Ok(Frame::TooLarge) => {
                warn!(
                    "Package from {} exceeds {max_package_size} bytes, closing connection",
                    connection.peer()
                );
                break;
            }
            Err(e) => {
                debug!("Read error for {}: {e}", connection.peer());
                break;
            }
        }
    }
}

/// Run `on_message` on the blocking pool and wait for it, keeping replies
/// in receipt order.
async fn call_handler<H: ConnectionHandler>(
    handler: &Arc<H>,
    connection: &ConnectionContext,
    payload: Vec<u8>,
) -> Option<String> {
    let handler = handler.clone();
    let context = connection.clone();
    match tokio::task::spawn_blocking(move || handler.on_message(&context, &payload)).await {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!("Message handler for {} failed: {e}", connection.peer());
            None
        }
    }
}

fn trim_line_end(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

enum Frame {
    Line,
    Eof,
    TooLarge,
}

async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    frame: &mut Vec<u8>,
    max_package_size: usize,
) -> std::io::Result<Frame> {
    let limit = max_package_size as u64 + 1;
    let n = reader.take(limit).read_until(b'\n', frame).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    if frame.ends_with(b"\n") {
        return Ok(Frame::Line);
    }
    if n as u64 >= limit {
        Ok(Frame::TooLarge)
    } else {
        // Peer closed mid-line; an unterminated package is never dispatched
        Ok(Frame::Eof)
    }
}

pub(crate) async fn write_line(
    writer: &mut OwnedWriteHalf,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
