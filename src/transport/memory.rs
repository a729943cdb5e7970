//! Loopback transport connecting routers of one OS process.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::{ChannelCaps, InboundChunk, Transport, TransportHandoff, TransportManager};
use crate::common::queue::WaitableQueue;
use crate::error::TransportError;

struct Endpoint {
    queue: Arc<WaitableQueue<InboundChunk>>,
    cookie: String,
}

type Hub = Mutex<HashMap<(String, u16), Endpoint>>;

fn hub() -> &'static Hub {
    static HUB: OnceLock<Hub> = OnceLock::new();
    HUB.get_or_init(Default::default)
}

////////////////////////////////////////////////////////////////////////////////

/// Transport delivering frames through the in-process hub.
pub struct MemoryTransport {
    host: String,
    port: u16,
    cookie: String,
}

impl fmt::Display for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryTransport<{}:{}>", self.host, self.port)
    }
}

impl Transport for MemoryTransport {
    fn capabilities(&self) -> ChannelCaps {
        ChannelCaps::BROADCAST | ChannelCaps::RELIABLEFIFO
    }

    fn send(&self, chunk: &[u8], host: &str, port: u16) -> Result<(), TransportError> {
        let hub = hub().lock();
        let endpoint =
            hub.get(&(host.to_owned(), port))
                .ok_or_else(|| TransportError::Unreachable {
                    host: host.to_owned(),
                    port,
                })?;
        if endpoint.cookie != self.cookie {
            return Err(TransportError::Authentication {
                host: host.to_owned(),
                port,
            });
        }
        endpoint.queue.push(InboundChunk {
            transport: self.to_string(),
            data: chunk.to_vec(),
        });
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Manager of one [`MemoryTransport`].
pub struct MemoryTransportManager {
    host: String,
    fixed_port: Option<u16>,
    range: (u16, u16),
    cookie: String,
    queue: Arc<WaitableQueue<InboundChunk>>,
    transport: Mutex<Option<Arc<MemoryTransport>>>,
}

impl MemoryTransportManager {
    /// Create manager which binds `fixed_port` or the first free port in `range`.
    pub fn new(host: &str, fixed_port: Option<u16>, range: (u16, u16), cookie: &str) -> Self {
        Self {
            host: host.to_owned(),
            fixed_port,
            range,
            cookie: cookie.to_owned(),
            queue: Arc::new(WaitableQueue::new()),
            transport: Mutex::new(None),
        }
    }

    fn bind(&self, hub: &mut HashMap<(String, u16), Endpoint>) -> Result<u16, TransportError> {
        let free = |port: &u16| !hub.contains_key(&(self.host.clone(), *port));
        let port = match self.fixed_port {
            Some(port) if free(&port) => port,
            Some(port) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("{}:{} is already bound", self.host, port),
                )))
            }
            None => (self.range.0..self.range.1)
                .find(|port| free(port))
                .ok_or(TransportError::NoFreePort {
                    min: self.range.0,
                    max: self.range.1,
                })?,
        };
        hub.insert(
            (self.host.clone(), port),
            Endpoint {
                queue: self.queue.clone(),
                cookie: self.cookie.clone(),
            },
        );
        Ok(port)
    }
}

impl TransportManager for MemoryTransportManager {
    fn initialize(&self) -> Result<(), TransportError> {
        let mut transport = self.transport.lock();
        if transport.is_some() {
            return Ok(());
        }
        let port = self.bind(&mut hub().lock())?;
        log::debug!("Memory transport bound on {}:{}", self.host, port);
        *transport = Some(Arc::new(MemoryTransport {
            host: self.host.clone(),
            port,
            cookie: self.cookie.clone(),
        }));
        Ok(())
    }

    fn close(&self) {
        if let Some(transport) = self.transport.lock().take() {
            hub().lock().remove(&(transport.host.clone(), transport.port));
        }
        self.queue.close();
    }

    fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transport
            .lock()
            .iter()
            .map(|t| t.clone() as Arc<dyn Transport>)
            .collect()
    }

    fn transport_addresses(&self) -> Vec<u16> {
        self.transport.lock().iter().map(|t| t.port).collect()
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
        Err(TransportError::NotTransferable("memory".to_owned()))
    }
}
