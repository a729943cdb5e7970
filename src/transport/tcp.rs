//! Framed TCP transport.
//!
//! Every connection starts with the sender's cookie, answered by one byte
//! accepting or rejecting it. After that the connection carries frames
//! prefixed with their `u32` length. I/O runs on an internal tokio runtime,
//! while [`Transport::send`] blocks the calling thread.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};

use super::{ChannelCaps, InboundChunk, Transport, TransportHandoff, TransportManager};
use crate::common::queue::WaitableQueue;
use crate::config::TransportKind;
use crate::error::TransportError;

const ACCEPT: u8 = 1;
const REJECT: u8 = 0;

/// Frames above this size are treated as stream corruption.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

const REBIND_ATTEMPTS: usize = 40;
const REBIND_PAUSE: Duration = Duration::from_millis(50);

////////////////////////////////////////////////////////////////////////////////

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes", len),
        ));
    }
    let mut data = vec![0; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> io::Result<()> {
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

async fn serve_connection(
    mut stream: TcpStream,
    queue: Arc<WaitableQueue<InboundChunk>>,
    cookie: String,
    name: String,
) -> io::Result<()> {
    let preamble = read_frame(&mut stream).await?;
    if preamble != cookie.as_bytes() {
        log::warn!("{}: rejected connection with wrong cookie", name);
        stream.write_u8(REJECT).await?;
        return Ok(());
    }
    stream.write_u8(ACCEPT).await?;

    loop {
        match read_frame(&mut stream).await {
            Ok(data) => {
                queue.push(InboundChunk {
                    transport: name.clone(),
                    data,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: Arc<WaitableQueue<InboundChunk>>,
    cookie: String,
    name: String,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::trace!("{}: accepted connection from {}", name, peer);
                let (queue, cookie, name) = (queue.clone(), cookie.clone(), name.clone());
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, queue, cookie, name.clone()).await {
                        log::debug!("{}: connection from {} closed: {}", name, peer, e);
                    }
                });
            }
            Err(e) => {
                log::warn!("{}: can not accept connection: {}", name, e);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Transport sending frames over cached TCP connections.
pub struct TcpTransport {
    host: String,
    port: u16,
    cookie: String,
    handle: Handle,
    closed: Arc<AtomicBool>,
    connections: tokio::sync::Mutex<HashMap<(String, u16), TcpStream>>,
}

impl TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
        let mut stream = TcpStream::connect((host, port)).await.map_err(|e| {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                TransportError::Unreachable {
                    host: host.to_owned(),
                    port,
                }
            } else {
                TransportError::Io(e)
            }
        })?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, self.cookie.as_bytes()).await?;
        match stream.read_u8().await? {
            ACCEPT => Ok(stream),
            _ => Err(TransportError::Authentication {
                host: host.to_owned(),
                port,
            }),
        }
    }

    async fn send_async(&self, chunk: &[u8], host: &str, port: u16) -> Result<(), TransportError> {
        let key = (host.to_owned(), port);
        let mut connections = self.connections.lock().await;
        if let Some(stream) = connections.get_mut(&key) {
            if write_frame(stream, chunk).await.is_ok() {
                return Ok(());
            }
            connections.remove(&key);
        }
        let mut stream = self.connect(host, port).await?;
        write_frame(&mut stream, chunk).await?;
        connections.insert(key, stream);
        Ok(())
    }
}

impl fmt::Display for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpTransport<{}:{}>", self.host, self.port)
    }
}

impl Transport for TcpTransport {
    fn capabilities(&self) -> ChannelCaps {
        ChannelCaps::BROADCAST | ChannelCaps::RELIABLEFIFO | ChannelCaps::INTERHOST
    }

    fn send(&self, chunk: &[u8], host: &str, port: u16) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotInitialized);
        }
        self.handle.block_on(self.send_async(chunk, host, port))
    }
}

////////////////////////////////////////////////////////////////////////////////

struct TcpState {
    runtime: Runtime,
    transport: Arc<TcpTransport>,
}

/// Manager of one [`TcpTransport`] and its listener.
pub struct TcpTransportManager {
    host: String,
    fixed_port: Option<u16>,
    range: (u16, u16),
    cookie: String,
    queue: Arc<WaitableQueue<InboundChunk>>,
    state: Mutex<Option<TcpState>>,
}

impl TcpTransportManager {
    /// Create manager which binds `fixed_port` or the first free port in `range`.
    pub fn new(host: &str, fixed_port: Option<u16>, range: (u16, u16), cookie: &str) -> Self {
        Self {
            host: host.to_owned(),
            fixed_port,
            range,
            cookie: cookie.to_owned(),
            queue: Arc::new(WaitableQueue::new()),
            state: Mutex::new(None),
        }
    }

    async fn bind(&self) -> Result<TcpListener, TransportError> {
        match self.fixed_port {
            // A port handed over by the parent may still be held for a moment.
            Some(port) => {
                let mut attempt = 0;
                loop {
                    match TcpListener::bind((self.host.as_str(), port)).await {
                        Ok(listener) => return Ok(listener),
                        Err(e) if attempt + 1 < REBIND_ATTEMPTS => {
                            log::trace!("Can not bind {}:{}: {}", self.host, port, e);
                            attempt += 1;
                            tokio::time::sleep(REBIND_PAUSE).await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            None => {
                for port in self.range.0..self.range.1 {
                    if let Ok(listener) = TcpListener::bind((self.host.as_str(), port)).await {
                        return Ok(listener);
                    }
                }
                Err(TransportError::NoFreePort {
                    min: self.range.0,
                    max: self.range.1,
                })
            }
        }
    }
}

impl TransportManager for TcpTransportManager {
    fn initialize(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("procnet-tcp")
            .enable_all()
            .build()?;
        let listener = runtime.block_on(self.bind())?;
        let port = listener.local_addr()?.port();

        let transport = Arc::new(TcpTransport {
            host: self.host.clone(),
            port,
            cookie: self.cookie.clone(),
            handle: runtime.handle().clone(),
            closed: Arc::new(AtomicBool::new(false)),
            connections: tokio::sync::Mutex::new(HashMap::new()),
        });
        runtime.spawn(accept_loop(
            listener,
            self.queue.clone(),
            self.cookie.clone(),
            transport.to_string(),
        ));
        log::debug!("Tcp transport listening on {}:{}", self.host, port);

        *state = Some(TcpState { runtime, transport });
        Ok(())
    }

    fn close(&self) {
        if let Some(state) = self.state.lock().take() {
            state.transport.closed.store(true, Ordering::SeqCst);
            state.runtime.shutdown_background();
        }
        self.queue.close();
    }

    fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.state
            .lock()
            .iter()
            .map(|s| s.transport.clone() as Arc<dyn Transport>)
            .collect()
    }

    fn transport_addresses(&self) -> Vec<u16> {
        self.state.lock().iter().map(|s| s.transport.port).collect()
    }

    fn queue(&self) -> Arc<WaitableQueue<InboundChunk>> {
        self.queue.clone()
    }

    fn cookie(&self) -> &str {
        &self.cookie
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn handoff(&self) -> Result<TransportHandoff, TransportError> {
        let ports = self.transport_addresses();
        if ports.is_empty() {
            return Err(TransportError::NotInitialized);
        }
        Ok(TransportHandoff {
            kind: TransportKind::Tcp,
            host: self.host.clone(),
            ports,
            cookie: self.cookie.clone(),
        })
    }
}
