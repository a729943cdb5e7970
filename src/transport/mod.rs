//! Byte-level transports used by the [router][crate::router::Router].

pub mod memory;
pub mod tcp;

#[cfg(test)]
mod tests;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::queue::WaitableQueue;
use crate::config::{RuntimeConfig, TransportKind};
use crate::error::TransportError;

pub use memory::MemoryTransportManager;
pub use tcp::TcpTransportManager;

/// Size of the frame length prefix.
pub const HEADER_SIZE: usize = 4;

////////////////////////////////////////////////////////////////////////////////

/// Set of channel capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelCaps(u8);

impl ChannelCaps {
    /// No requirements.
    pub const NONE: ChannelCaps = ChannelCaps(0);
    /// Can reach a peer knowing only its address.
    pub const BROADCAST: ChannelCaps = ChannelCaps(1);
    /// Reliable delivery preserving order between a fixed pair.
    pub const RELIABLEFIFO: ChannelCaps = ChannelCaps(1 << 1);
    /// Can reach other hosts.
    pub const INTERHOST: ChannelCaps = ChannelCaps(1 << 2);

    /// Capability by its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "broadcast" => Some(Self::BROADCAST),
            "fifo" | "reliable" | "reliablefifo" => Some(Self::RELIABLEFIFO),
            "interhost" => Some(Self::INTERHOST),
            _ => None,
        }
    }

    /// Checks that every capability of `other` is present.
    pub fn contains(self, other: ChannelCaps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ChannelCaps {
    type Output = ChannelCaps;

    fn bitor(self, rhs: Self) -> Self::Output {
        ChannelCaps(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChannelCaps {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ChannelCaps {
    type Output = ChannelCaps;

    fn bitand(self, rhs: Self) -> Self::Output {
        ChannelCaps(self.0 & rhs.0)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Bytes received by a transport.
#[derive(Debug)]
pub struct InboundChunk {
    /// Name of the receiving transport.
    pub transport: String,
    /// Received frame.
    pub data: Vec<u8>,
}

/// Sends frames to other transports of the same kind.
pub trait Transport: Send + Sync + fmt::Display {
    /// Capabilities of the transport.
    fn capabilities(&self) -> ChannelCaps;

    /// Sends one frame to the given address.
    fn send(&self, chunk: &[u8], host: &str, port: u16) -> Result<(), TransportError>;
}

/// State of a transport manager handed over to a child OS process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportHandoff {
    /// Transport kind.
    pub kind: TransportKind,
    /// Host.
    pub host: String,
    /// Ports to rebind, in the transports' order.
    pub ports: Vec<u16>,
    /// Authentication cookie.
    pub cookie: String,
}

/// Owns the transports of an execution unit and their inbound queue.
pub trait TransportManager: Send + Sync {
    /// Binds every transport.
    fn initialize(&self) -> Result<(), TransportError>;

    /// Unbinds every transport and closes the inbound queue.
    fn close(&self);

    /// Initialized transports.
    fn transports(&self) -> Vec<Arc<dyn Transport>>;

    /// Bound port of every transport.
    fn transport_addresses(&self) -> Vec<u16>;

    /// First transport satisfying the requested capabilities with its index.
    fn get_transport(&self, flags: ChannelCaps) -> Option<(usize, Arc<dyn Transport>)> {
        self.transports()
            .into_iter()
            .enumerate()
            .find(|(_, t)| t.capabilities().contains(flags))
    }

    /// Queue of received frames.
    fn queue(&self) -> Arc<WaitableQueue<InboundChunk>>;

    /// Authentication cookie.
    fn cookie(&self) -> &str;

    /// Host the transports are bound on.
    fn host(&self) -> &str;

    /// State needed to rebind the transports in another OS process.
    fn handoff(&self) -> Result<TransportHandoff, TransportError>;
}

/// Create transport manager of the configured kind.
pub fn create_manager(config: &RuntimeConfig, cookie: &str) -> Arc<dyn TransportManager> {
    match config.transport {
        TransportKind::Memory => Arc::new(MemoryTransportManager::new(
            &config.hostname,
            config.port,
            (config.min_port, config.max_port),
            cookie,
        )),
        TransportKind::Tcp => Arc::new(TcpTransportManager::new(
            &config.hostname,
            config.port,
            (config.min_port, config.max_port),
            cookie,
        )),
    }
}

/// Recreate transport manager handed over by the parent process.
pub fn from_handoff(handoff: &TransportHandoff) -> Result<Arc<dyn TransportManager>, TransportError> {
    match handoff.kind {
        TransportKind::Memory => Err(TransportError::NotTransferable("memory".to_owned())),
        TransportKind::Tcp => {
            let port = handoff.ports.first().copied();
            Ok(Arc::new(TcpTransportManager::new(
                &handoff.host,
                port,
                (0, 0),
                &handoff.cookie,
            )))
        }
    }
}
