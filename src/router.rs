//! Message router of an execution unit.
//!
//! The router owns the mailboxes of local processes. Packets for local
//! destinations are appended to their mailboxes, everything else is encoded
//! into a [`WireFrame`] and sent through a transport. Frames received by the
//! transports are decoded on the router thread and dispatched the same way.
//!
//! Routers of different nodes find each other with a small bootstrap
//! sub-protocol: `HELLO` sent to a known address is answered by `ACK`
//! carrying the node process of the answering router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::codec::BufferPool;
use crate::common::command::{
    Body, Command, Content, ContentRef, Packet, RouterCommand, WireFrame, WireFrameRef,
};
use crate::common::pid::ProcessId;
use crate::common::queue::{LiveMailbox, Mailbox};
use crate::error::{RoutingError, TraceError};
use crate::runtime::Runtime;
use crate::trace::Recorder;
use crate::transport::{ChannelCaps, InboundChunk, Transport, TransportManager, HEADER_SIZE};

/// Granularity of checks for the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct PendingFrame {
    src: Option<ProcessId>,
    dst: ProcessId,
    content: Content,
    flags: ChannelCaps,
}

////////////////////////////////////////////////////////////////////////////////

/// Routes packets between local mailboxes and transports.
pub struct Router {
    runtime: Arc<Runtime>,
    transport_manager: Arc<dyn TransportManager>,
    buffers: BufferPool,
    local_procs: Mutex<HashMap<ProcessId, Arc<dyn Mailbox>>>,
    prestart: Mutex<Vec<PendingFrame>>,
    bootstrap_peer: Mutex<Option<ProcessId>>,
    peer_found: Condvar,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Create router over initialized transport manager.
    pub fn new(runtime: Arc<Runtime>, transport_manager: Arc<dyn TransportManager>) -> Arc<Self> {
        let buffers = BufferPool::new(runtime.config().message_buffer_size);
        Arc::new(Self {
            runtime,
            transport_manager,
            buffers,
            local_procs: Mutex::new(HashMap::new()),
            prestart: Mutex::new(Vec::new()),
            bootstrap_peer: Mutex::new(None),
            peer_found: Condvar::new(),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Runtime of the execution unit.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Transport manager the router sends through.
    pub fn transport_manager(&self) -> &Arc<dyn TransportManager> {
        &self.transport_manager
    }

    /// Checks if the router loop runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Node process of the router found by the last bootstrap.
    pub fn bootstrap_peer(&self) -> Option<ProcessId> {
        self.bootstrap_peer.lock().clone()
    }

    ////////////////////////////////////////////////////////////////////////////////

    /// Creates mailbox of a local process, recording traces if configured.
    pub fn register_local_process(
        &self,
        pid: &ProcessId,
        parent: Option<&ProcessId>,
    ) -> Result<Arc<dyn Mailbox>, TraceError> {
        let config = self.runtime.config();
        let mailbox: Arc<dyn Mailbox> = if config.record_trace {
            let recorder = Recorder::create(&config.logdir, pid, parent, self.runtime.codec())?;
            Arc::new(LiveMailbox::recording(recorder))
        } else {
            Arc::new(LiveMailbox::new())
        };
        self.local_procs.lock().insert(pid.clone(), mailbox.clone());
        log::debug!("Registered local process {}", pid);
        Ok(mailbox)
    }

    /// Binds local process to the given mailbox, used to replay traces.
    pub fn replace_local_process(&self, pid: &ProcessId, mailbox: Arc<dyn Mailbox>) {
        self.local_procs.lock().insert(pid.clone(), mailbox);
    }

    /// Removes mailbox of the process and closes it.
    pub fn deregister_local_process(&self, pid: &ProcessId) {
        if let Some(mailbox) = self.local_procs.lock().remove(pid) {
            mailbox.close();
            log::debug!("Deregistered local process {}", pid);
        }
    }

    /// Mailbox of the local process.
    pub fn get_queue_for_process(&self, pid: &ProcessId) -> Option<Arc<dyn Mailbox>> {
        self.local_procs.lock().get(pid).cloned()
    }

    /// Asks every local process to exit with code 1.
    pub fn terminate_local_processes(&self) {
        let Some(node) = self.runtime.node_id() else {
            log::warn!("Can not terminate local processes: node is unknown");
            return;
        };
        let mailboxes: Vec<Arc<dyn Mailbox>> = self.local_procs.lock().values().cloned().collect();
        for mailbox in mailboxes {
            mailbox.push(
                node.clone(),
                Packet::new(Command::End, Body::End { code: 1 }),
            );
        }
    }

    /// Closes every local mailbox, so blocked processes exit as interrupted.
    pub fn interrupt_local_processes(&self) {
        let mailboxes: Vec<Arc<dyn Mailbox>> = self.local_procs.lock().values().cloned().collect();
        log::debug!("Interrupting {} local processes", mailboxes.len());
        for mailbox in mailboxes {
            mailbox.close();
        }
    }

    ////////////////////////////////////////////////////////////////////////////////

    /// Starts the router loop on a dedicated thread
    /// and flushes messages buffered before the start.
    pub fn start(self: &Arc<Self>) -> Result<(), RoutingError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pending = std::mem::take(&mut *self.prestart.lock());
        for frame in pending {
            let content = match &frame.content {
                Content::Process(packet) => ContentRef::Process(packet),
                Content::Router(command) => ContentRef::Router(command),
            };
            self.dispatch(frame.src.as_ref(), &frame.dst, content, frame.flags);
        }

        let router = self.clone();
        let handle = thread::Builder::new()
            .name("procnet-router".to_owned())
            .spawn(move || router.mesgloop(&|r| !r.is_running(), None))
            .map_err(|e| RoutingError::InvalidRouterState(e.to_string()))?;
        *self.thread.lock() = Some(handle);
        log::debug!(
            "Router started on {}:{:?}",
            self.transport_manager.host(),
            self.transport_manager.transport_addresses()
        );
        Ok(())
    }

    /// Stops the router loop and terminates local processes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.terminate_local_processes();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("Router thread panicked");
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////

    /// Sends packet from a local process. Returns `false` if it could not be sent.
    pub fn send(
        &self,
        src: &ProcessId,
        dest: &ProcessId,
        packet: &Packet,
        flags: ChannelCaps,
    ) -> bool {
        self.dispatch(Some(src), dest, ContentRef::Process(packet), flags)
    }

    /// Sends router command.
    pub fn send_router(
        &self,
        src: &ProcessId,
        dest: &ProcessId,
        command: &RouterCommand,
        flags: ChannelCaps,
    ) -> bool {
        self.dispatch(Some(src), dest, ContentRef::Router(command), flags)
    }

    fn dispatch(
        &self,
        src: Option<&ProcessId>,
        dest: &ProcessId,
        content: ContentRef<'_>,
        flags: ChannelCaps,
    ) -> bool {
        let local = self.local_procs.lock().get(dest).cloned();
        if let Some(mailbox) = local {
            if flags.contains(ChannelCaps::BROADCAST) {
                return true;
            }
            return match (src, content) {
                // Local copy keeps sender and receiver independent.
                (Some(src), ContentRef::Process(packet)) => {
                    mailbox.push(src.clone(), packet.clone());
                    true
                }
                (src, ContentRef::Router(command)) => {
                    self.handle_router_command(src.cloned(), command.clone());
                    true
                }
                (None, ContentRef::Process(_)) => {
                    log::warn!("Dropping packet without sender for {}", dest);
                    false
                }
            };
        }

        if !self.is_running() && !self.is_own_address(dest) {
            self.prestart.lock().push(PendingFrame {
                src: src.cloned(),
                dst: dest.clone(),
                content: content.to_owned_content(),
                flags,
            });
            return true;
        }

        match self.send_remote(src, dest, content, flags, None) {
            Ok(()) => true,
            Err(RoutingError::CircularRouting(_)) => {
                log::debug!("Process {} is not registered here anymore", dest);
                false
            }
            Err(e) => {
                log::warn!("Can not send message to {}: {}", dest, e);
                false
            }
        }
    }

    fn is_own_address(&self, dest: &ProcessId) -> bool {
        dest.host() == self.transport_manager.host()
            && dest.transports() == self.transport_manager.transport_addresses().as_slice()
    }

    fn send_remote(
        &self,
        src: Option<&ProcessId>,
        dest: &ProcessId,
        content: ContentRef<'_>,
        flags: ChannelCaps,
        forced: Option<(usize, Arc<dyn Transport>)>,
    ) -> Result<(), RoutingError> {
        let mut flags = flags;
        if dest.host() != self.transport_manager.host() {
            flags |= ChannelCaps::INTERHOST;
        } else if self.is_own_address(dest) {
            return Err(RoutingError::CircularRouting(dest.to_string()));
        }

        let (index, transport) = match forced {
            Some(forced) => forced,
            None => self
                .transport_manager
                .get_transport(flags)
                .ok_or(RoutingError::NoAvailableTransport)?,
        };
        let port = dest
            .address_for_transport(index)
            .ok_or(RoutingError::NoAvailableTransport)?;

        let frame = WireFrameRef {
            src,
            dst: if flags.contains(ChannelCaps::BROADCAST) {
                None
            } else {
                Some(dest)
            },
            content,
        };
        let mut buffer = self.buffers.checkout();
        let limit = self.buffers.capacity().saturating_sub(HEADER_SIZE);
        self.runtime
            .codec()
            .encode_into(&frame, &mut buffer, limit)?;
        transport.send(&buffer, dest.host(), port)?;
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////

    fn mesgloop(&self, until: &dyn Fn(&Router) -> bool, timeout: Option<Duration>) {
        let queue = self.transport_manager.queue();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !until(self) {
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return;
                    }
                    left.min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            match queue.pop(true, Some(slice)) {
                Some(chunk) => self.handle_chunk(chunk),
                None if queue.is_closed() => {
                    log::debug!("Transport queue closed, leaving router loop");
                    return;
                }
                None => {}
            }
        }
    }

    fn handle_chunk(&self, chunk: InboundChunk) {
        let frame: WireFrame = match self.runtime.codec().decode(&chunk.data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping undecodable frame from {}: {}", chunk.transport, e);
                return;
            }
        };

        match frame {
            WireFrame {
                src,
                content: Content::Router(command),
                ..
            } => self.handle_router_command(src, command),
            WireFrame {
                src: Some(src),
                dst: Some(dst),
                content: Content::Process(packet),
            } => match self.get_queue_for_process(&dst) {
                Some(mailbox) => mailbox.push(src, packet),
                None => log::warn!("Dropping {:?} for unknown process {}", packet.command, dst),
            },
            WireFrame { src, dst, .. } => {
                log::warn!("Dropping malformed frame from {:?} to {:?}", src, dst);
            }
        }
    }

    fn handle_router_command(&self, src: Option<ProcessId>, command: RouterCommand) {
        let names = self.runtime.names();
        match command {
            RouterCommand::Hello { named } => {
                names.register_all(&named);
                let (Some(src), Some(node)) = (src, self.runtime.node_id()) else {
                    log::warn!("Can not answer HELLO: sender or node is unknown");
                    return;
                };
                let ack = RouterCommand::Ack {
                    node,
                    named: names.all_named(),
                };
                if let Err(e) = self.send_remote(
                    None,
                    &src,
                    ContentRef::Router(&ack),
                    ChannelCaps::BROADCAST | ChannelCaps::RELIABLEFIFO,
                    None,
                ) {
                    log::warn!("Can not answer HELLO of {}: {}", src, e);
                }
            }
            RouterCommand::Ack { node, named } => {
                names.register_all(&named);
                if self.runtime.node_id().as_ref() != Some(&node) {
                    log::debug!("Bootstrap peer {} answered", node);
                    *self.bootstrap_peer.lock() = Some(node);
                    self.peer_found.notify_all();
                }
            }
            RouterCommand::Ping { named } => names.register_all(&named),
            RouterCommand::Bye => {
                if let Some(src) = src {
                    names.drop_entry(&src);
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////

    /// Looks for a node listening at the given address.
    ///
    /// `HELLO` is sent over every transport in turn until some node answers.
    pub fn bootstrap_node(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<ProcessId, RoutingError> {
        let node = self
            .runtime
            .node_id()
            .ok_or_else(|| RoutingError::InvalidRouterState("node is unknown".to_owned()))?;
        *self.bootstrap_peer.lock() = None;

        let hello = RouterCommand::Hello {
            named: self.runtime.names().all_named(),
        };
        let transports = self.transport_manager.transports();
        let placeholder = ProcessId::placeholder(host, port, transports.len());

        for (index, transport) in transports.into_iter().enumerate() {
            let result = self.send_remote(
                Some(&node),
                &placeholder,
                ContentRef::Router(&hello),
                ChannelCaps::BROADCAST,
                Some((index, transport.clone())),
            );
            match result {
                Ok(()) => {
                    self.wait_for_peer(timeout);
                    if let Some(peer) = self.bootstrap_peer() {
                        log::info!("Joined {} through {}", peer, transport);
                        return Ok(peer);
                    }
                    log::debug!("No answer from {}:{} through {}", host, port, transport);
                }
                Err(RoutingError::Authentication(e)) => {
                    return Err(RoutingError::Authentication(e));
                }
                Err(e) => log::debug!("Can not reach {}:{} through {}: {}", host, port, transport, e),
            }
        }

        Err(RoutingError::BootstrapFailed(format!(
            "no node answered at {}:{}",
            host, port
        )))
    }

    fn wait_for_peer(&self, timeout: Duration) {
        if self.is_running() {
            let deadline = Instant::now() + timeout;
            let mut peer = self.bootstrap_peer.lock();
            while peer.is_none() {
                if self.peer_found.wait_until(&mut peer, deadline).timed_out() {
                    break;
                }
            }
        } else {
            self.mesgloop(&|r| r.bootstrap_peer.lock().is_some(), Some(timeout));
        }
    }
}
