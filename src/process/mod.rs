//! Engine of one distributed process.
//!
//! [`DistProcess`] is the context user algorithms run in. It owns the
//! process's mailbox, dispatches protocol commands through a fixed table,
//! synchronizes request/acknowledgement exchanges and runs event handlers
//! at labels. All of it happens on the thread of the hosting container.

mod dispatch;
pub(crate) mod events;
pub mod fault;
mod label;
mod node;
pub mod pattern;
pub mod state;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dyn_clone::DynClone;
use rand::Rng;
use serde_json::Value;

use procnet_message::Message;

use crate::common::command::{AckValue, Body, Command, NewRequest, Packet, ResolveRequest};
use crate::common::pid::{parse_name, ProcessId};
use crate::common::queue::Mailbox;
use crate::config::{ClockKind, ProcImpl, ProcessConfig};
use crate::container::Spawner;
use crate::error::{ProcessError, ProcessResult, TraceError};
use crate::router::Router;
use crate::runtime::Runtime;
use crate::trace::SendRecord;
use crate::transport::ChannelCaps;

use dispatch::CommandTable;
use events::{AsyncEvents, SeqCounter, HANG_SEQNO};
use fault::{FaultInjector, FaultKind, FaultProps};
use node::NodeRole;
use pattern::{Bindings, Event, EventBinding, EventKind, Handler, MatchScope};
use state::{Histories, StateBag};

pub use label::CRASH_EXIT_CODE;

////////////////////////////////////////////////////////////////////////////////

/// Algorithm of a process class.
///
/// Every process runs its own clone of the registered prototype.
pub trait Algorithm: DynClone + Send + Sync {
    /// Called once with the arguments passed by the creator.
    fn setup(&mut self, ctx: &mut DistProcess, args: &[Value]) -> Result<(), String> {
        let _ = (ctx, args);
        Ok(())
    }

    /// Body of the process, called after the process is started.
    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()>;

    /// Event bindings of the process.
    fn events(&self) -> Vec<EventBinding> {
        Vec::new()
    }

    /// Process config defaults of the class.
    fn config(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

dyn_clone::clone_trait_object!(Algorithm);

////////////////////////////////////////////////////////////////////////////////

/// Destination of a send: process id or process name.
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    /// Known process.
    Pid(ProcessId),
    /// Name in `name[@node][:host[:port]]` form, resolved before sending.
    Name(String),
}

/// List of destinations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Targets(Vec<Target>);

impl Targets {
    /// Destinations.
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.0.iter()
    }
}

impl From<ProcessId> for Targets {
    fn from(pid: ProcessId) -> Self {
        Targets(vec![Target::Pid(pid)])
    }
}

impl From<&ProcessId> for Targets {
    fn from(pid: &ProcessId) -> Self {
        Targets(vec![Target::Pid(pid.clone())])
    }
}

impl From<&[ProcessId]> for Targets {
    fn from(pids: &[ProcessId]) -> Self {
        Targets(pids.iter().cloned().map(Target::Pid).collect())
    }
}

impl From<Vec<ProcessId>> for Targets {
    fn from(pids: Vec<ProcessId>) -> Self {
        Targets(pids.into_iter().map(Target::Pid).collect())
    }
}

impl From<&Vec<ProcessId>> for Targets {
    fn from(pids: &Vec<ProcessId>) -> Self {
        pids.as_slice().into()
    }
}

impl From<&HashSet<ProcessId>> for Targets {
    fn from(pids: &HashSet<ProcessId>) -> Self {
        Targets(pids.iter().cloned().map(Target::Pid).collect())
    }
}

impl From<&BTreeSet<ProcessId>> for Targets {
    fn from(pids: &BTreeSet<ProcessId>) -> Self {
        Targets(pids.iter().cloned().map(Target::Pid).collect())
    }
}

impl From<&str> for Targets {
    fn from(name: &str) -> Self {
        Targets(vec![Target::Name(name.to_owned())])
    }
}

impl From<Vec<Target>> for Targets {
    fn from(targets: Vec<Target>) -> Self {
        Targets(targets)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Description of processes created by [`DistProcess::new_processes`].
#[derive(Clone, Debug, Default)]
pub struct NewSpec {
    count: Option<usize>,
    names: Vec<String>,
    at: Option<Targets>,
    method: Option<ProcImpl>,
    args: Option<Vec<Value>>,
    daemon: bool,
    props: FaultProps,
}

impl NewSpec {
    /// Create `count` anonymous processes.
    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Create one named process per name.
    pub fn names<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Create processes on the given nodes.
    pub fn at(mut self, nodes: impl Into<Targets>) -> Self {
        self.at = Some(nodes.into());
        self
    }

    /// Implementation of the processes.
    pub fn method(mut self, method: ProcImpl) -> Self {
        self.method = Some(method);
        self
    }

    /// Set up the processes with the arguments.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    /// Processes do not keep the execution unit alive.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Fault probabilities of the processes.
    pub fn props(mut self, props: FaultProps) -> Self {
        self.props = props;
        self
    }

    fn child_names(&self) -> Vec<String> {
        if !self.names.is_empty() {
            self.names.clone()
        } else {
            vec![String::new(); self.count.unwrap_or(1)]
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Whether outbound operations go live, are recorded or are replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TraceMode {
    Live,
    Record,
    Replay,
}

/// Everything a container hands over to a new process.
pub(crate) struct ProcessParts {
    pub runtime: Arc<Runtime>,
    pub router: Arc<Router>,
    pub mailbox: Arc<dyn Mailbox>,
    pub mode: TraceMode,
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub algorithm: Box<dyn Algorithm>,
    pub props: FaultProps,
    pub newcmd_seqno: Option<u64>,
    /// Set for the node process: arguments of its setup.
    pub node_args: Option<Vec<Value>>,
}

struct Job {
    handler: Handler,
    bindings: Bindings,
}

/// Context of a running process.
pub struct DistProcess {
    id: ProcessId,
    parent: Option<ProcessId>,
    runtime: Arc<Runtime>,
    router: Arc<Router>,
    mailbox: Arc<dyn Mailbox>,
    mode: TraceMode,
    spawner: Spawner,
    newcmd_seqno: Option<u64>,
    jobq: VecDeque<Job>,
    events: AsyncEvents,
    seq: SeqCounter,
    setup_called: bool,
    running: bool,
    crashed: bool,
    config: ProcessConfig,
    clock: u64,
    state: StateBag,
    histories: Histories,
    bindings: Vec<EventBinding>,
    faults: FaultInjector,
    timer: Option<Instant>,
    timer_expired: bool,
    table: CommandTable,
    node: Option<NodeRole>,
    algorithm: Option<Box<dyn Algorithm>>,
}

impl DistProcess {
    pub(crate) fn new(parts: ProcessParts) -> Self {
        let config = parts.runtime.process_config(parts.pid.class());
        let bindings = parts.algorithm.events();
        let faults = FaultInjector::new(parts.props, parts.runtime.config().seed);
        let node = parts.node_args.map(NodeRole::new);
        let table = CommandTable::build(node.is_some());
        Self {
            spawner: Spawner::new(parts.runtime.clone(), parts.router.clone()),
            id: parts.pid,
            parent: parts.parent,
            runtime: parts.runtime,
            router: parts.router,
            mailbox: parts.mailbox,
            mode: parts.mode,
            newcmd_seqno: parts.newcmd_seqno,
            jobq: VecDeque::new(),
            events: AsyncEvents::default(),
            seq: SeqCounter::new(1),
            setup_called: false,
            running: false,
            crashed: false,
            config,
            clock: 0,
            state: StateBag::default(),
            histories: Histories::new(),
            bindings,
            faults,
            timer: None,
            timer_expired: false,
            table,
            node,
            algorithm: Some(parts.algorithm),
        }
    }

    /// Entry sequence: acknowledge creation, wait for start and run the algorithm.
    pub(crate) fn delayed_start(&mut self) -> ProcessResult<i32> {
        if self.node.is_some() {
            return self.node_delayed_start();
        }

        if let (Some(seqno), Some(parent)) = (self.newcmd_seqno, self.parent.clone()) {
            self.send1(
                Command::NewAck,
                Body::Ack {
                    seqno,
                    value: AckValue::Unit,
                },
                &[parent],
                ChannelCaps::RELIABLEFIFO,
            )?;
        }
        while !self.running {
            self.process_event(true, None)?;
        }
        self.run_algorithm()
    }

    fn run_algorithm(&mut self) -> ProcessResult<i32> {
        let mut algorithm = self
            .algorithm
            .take()
            .ok_or_else(|| ProcessError::Failed("algorithm is already running".to_owned()))?;
        let result = algorithm.run(self);
        self.algorithm = Some(algorithm);
        match result {
            Ok(()) => Ok(0),
            Err(ProcessError::Failed(e)) => {
                log::error!("{}: run failed: {}", self.id, e);
                Ok(-1)
            }
            Err(e) => Err(e),
        }
    }

    fn setup_algorithm(&mut self, args: &[Value]) -> Result<(), String> {
        let mut algorithm = self
            .algorithm
            .take()
            .ok_or_else(|| "algorithm is busy".to_owned())?;
        let result = algorithm.setup(self, args);
        self.algorithm = Some(algorithm);
        result
    }

    ////////////////////////////////////////////////////////////////////////////////

    /// Id of the process.
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Creator of the process, `None` for node processes.
    pub fn parent(&self) -> Option<&ProcessId> {
        self.parent.as_ref()
    }

    /// Name of the process.
    pub fn nameof(pid: &ProcessId) -> &str {
        pid.name()
    }

    /// Node process of the node the process was spawned on, if known.
    pub fn nodeof(&self, pid: &ProcessId) -> Option<ProcessId> {
        self.runtime.names().lookup(pid.node(), pid.node())
    }

    /// Configuration of the process.
    pub fn process_config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Declared state.
    pub fn state(&self) -> &StateBag {
        &self.state
    }

    /// Mutable declared state.
    pub fn state_mut(&mut self) -> &mut StateBag {
        &mut self.state
    }

    /// Events recorded into the history.
    pub fn history(&self, name: &str) -> &[Event] {
        self.histories.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Checks if the process is crashed.
    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// Current logical clock.
    pub fn logical_clock(&self) -> u64 {
        self.clock
    }

    /// Ticks logical clock if it is enabled.
    pub fn incr_logical_clock(&mut self) {
        if self.config.clock == ClockKind::Lamport {
            self.clock += 1;
        }
    }

    fn clock_value(&self) -> Option<u64> {
        (self.config.clock == ClockKind::Lamport).then_some(self.clock)
    }

    /// Logs message at info level.
    pub fn output(&self, message: impl Display) {
        log::info!("{}: {}", self.id, message);
    }

    /// Logs message at debug level.
    pub fn debug(&self, message: impl Display) {
        log::debug!("{}: {}", self.id, message);
    }

    /// Logs message at error level.
    pub fn error(&self, message: impl Display) {
        log::error!("{}: {}", self.id, message);
    }

    /// Sleeps for a random time of up to two seconds.
    pub fn work(&mut self) {
        let millis = self.faults.rng().gen_range(0..=2000);
        thread::sleep(Duration::from_millis(millis));
    }

    /// Leaves the process with the given code.
    pub fn exit<T>(&self, code: i32) -> ProcessResult<T> {
        Err(ProcessError::Exit(code))
    }

    ////////////////////////////////////////////////////////////////////////////////

    fn create_seqno(&self) -> u64 {
        self.seq
            .next(|seqno| seqno == HANG_SEQNO || self.events.uses_seqno(seqno))
    }

    fn forward(&self, dest: &ProcessId, packet: &Packet, flags: ChannelCaps) -> ProcessResult<bool> {
        match self.mode {
            TraceMode::Live => Ok(self.router.send(&self.id, dest, packet, flags)),
            TraceMode::Record => {
                let sent = self.router.send(&self.id, dest, packet, flags);
                self.mailbox.record_send(SendRecord::Message(sent))?;
                Ok(sent)
            }
            TraceMode::Replay => match self.mailbox.replay_send()? {
                SendRecord::Message(sent) => Ok(sent),
                other => Err(TraceError::Mismatch(format!(
                    "expected send record, found {:?}",
                    other.command()
                ))
                .into()),
            },
        }
    }

    fn send1(
        &self,
        command: Command,
        body: Body,
        dests: &[ProcessId],
        flags: ChannelCaps,
    ) -> ProcessResult<bool> {
        let packet = Packet::new(command, body);
        let mut sent = true;
        for dest in dests {
            sent &= self.forward(dest, &packet, flags)?;
        }
        Ok(sent)
    }

    fn register_event(&self, command: Command, seqno: u64) {
        self.events.register(command, seqno);
    }

    /// Waits until every process of `srcs` acknowledges the request.
    fn sync(
        &mut self,
        command: Command,
        seqno: u64,
        srcs: &[ProcessId],
    ) -> ProcessResult<HashMap<ProcessId, AckValue>> {
        self.sync_timeout(command, seqno, srcs, None)
            .map(Option::unwrap_or_default)
    }

    /// Same as [`DistProcess::sync`], but gives up after `timeout` returning `None`.
    fn sync_timeout(
        &mut self,
        command: Command,
        seqno: u64,
        srcs: &[ProcessId],
        timeout: Option<Duration>,
    ) -> ProcessResult<Option<HashMap<ProcessId, AckValue>>> {
        if !self.events.begin_sync(command, seqno, srcs) {
            log::warn!("{}: {:?} #{} is not registered", self.id, command, seqno);
            return Ok(Some(HashMap::new()));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while !self.events.is_complete(command, seqno) {
            let left = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        self.events.deregister(command, seqno);
                        return Ok(None);
                    }
                    Some(left)
                }
                None => None,
            };
            if let Err(e) = self.process_event(true, left) {
                self.events.deregister(command, seqno);
                return Err(e);
            }
        }
        Ok(Some(self.events.finish(command, seqno)))
    }

    /// Takes one packet from the mailbox and dispatches it.
    /// Returns `true` if a packet was handled.
    fn process_event(&mut self, block: bool, timeout: Option<Duration>) -> ProcessResult<bool> {
        let Some((src, packet)) = self.mailbox.pop(block, timeout)? else {
            return Ok(false);
        };

        if self.crashed && !matches!(packet.command, Command::Restore | Command::Recover) {
            log::debug!("{}: crashed, dropping {:?}", self.id, packet.command);
            return Ok(true);
        }

        let Some(handler) = self.table.get(packet.command) else {
            log::warn!(
                "{}: no handler for {:?} from {}",
                self.id,
                packet.command,
                src
            );
            return Ok(false);
        };
        match handler(self, packet.command, src, packet.body) {
            Ok(()) => Ok(true),
            Err(ProcessError::Failed(e)) => {
                log::error!("{}: handling {:?} failed: {}", self.id, packet.command, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Matches event against bindings, recording histories and queueing jobs.
    fn trigger(&mut self, event: Event) {
        let scope = MatchScope {
            self_id: &self.id,
            state: &self.state,
        };
        let mut jobs = Vec::new();
        let mut histories = Vec::new();
        for binding in &self.bindings {
            if let Some(bindings) = binding.pattern().matches(&event, &scope) {
                if let Some(history) = binding.history() {
                    histories.push(history.to_owned());
                }
                jobs.extend(binding.handlers().iter().map(|handler| Job {
                    handler: handler.clone(),
                    bindings: bindings.clone(),
                }));
            }
        }
        for history in histories {
            self.histories.entry(history).or_default().push(event.clone());
        }
        self.jobq.extend(jobs);
    }

    ////////////////////////////////////////////////////////////////////////////////

    fn resolve_targets(&mut self, targets: Targets) -> ProcessResult<(Vec<ProcessId>, bool)> {
        let mut pids = Vec::new();
        let mut resolved = true;
        for target in targets.0 {
            match target {
                Target::Pid(pid) => pids.push(pid),
                Target::Name(name) => match self.resolve(&name)? {
                    Some(pid) => pids.push(pid),
                    None => resolved = false,
                },
            }
        }
        Ok((pids, resolved))
    }

    /// Sends message on the default channel.
    pub fn send(&mut self, message: impl Into<Message>, to: impl Into<Targets>) -> ProcessResult<bool> {
        self.send_on(message.into(), to, None)
    }

    /// Sends message, optionally on a specific channel.
    /// Returns `false` if some destination was not reached.
    pub fn send_on(
        &mut self,
        message: Message,
        to: impl Into<Targets>,
        channel: Option<ChannelCaps>,
    ) -> ProcessResult<bool> {
        let (targets, resolved) = self.resolve_targets(to.into())?;
        self.incr_logical_clock();
        let clock = self.clock_value();
        let flags = channel.unwrap_or(self.config.channel);

        let sent = if self.faults.fails(FaultKind::Send) {
            log::info!("{}: dropped message {}", self.id, message.get_tip());
            false
        } else if self.config.lossy && self.faults.chance(self.config.loss_rate) {
            log::warn!("{}: lost message {}", self.id, message.get_tip());
            false
        } else if self.config.delay > 0.0 {
            self.send_delayed(&message, clock, &targets, flags);
            resolved
        } else {
            let body = Body::Message {
                clock,
                message: message.clone(),
            };
            self.send1(Command::Message, body, &targets, flags)? && resolved
        };

        self.trigger(Event {
            kind: EventKind::Sent,
            clock,
            from: self.id.clone(),
            to: targets,
            message,
        });
        Ok(sent)
    }

    fn send_delayed(
        &self,
        message: &Message,
        clock: Option<u64>,
        targets: &[ProcessId],
        flags: ChannelCaps,
    ) {
        let router = self.router.clone();
        let src = self.id.clone();
        let targets = targets.to_vec();
        let packet = Packet::new(
            Command::Message,
            Body::Message {
                clock,
                message: message.clone(),
            },
        );
        let delay = Duration::from_secs_f64(self.config.delay);
        thread::spawn(move || {
            thread::sleep(delay);
            for dest in &targets {
                if !router.send(&src, dest, &packet, flags) {
                    log::warn!("{}: delayed message to {} was not sent", src, dest);
                }
            }
        });
    }

    /// Resolves process name in `name[@node][:host[:port]]` form.
    ///
    /// Unknown names are asked from the node process, which may bootstrap
    /// to the hinted host. Returns `None` if the name is malformed or not
    /// resolved within the configured timeout.
    pub fn resolve(&mut self, name: &str) -> ProcessResult<Option<ProcessId>> {
        let parsed = match parse_name(name) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("{}: {}", self.id, e);
                return Ok(None);
            }
        };
        let node = if parsed.node.is_empty() {
            self.runtime.node_name()
        } else {
            parsed.node
        };
        if let Some(pid) = self.runtime.names().lookup(&parsed.name, &node) {
            return Ok(Some(pid));
        }

        let Some(node_id) = self.runtime.node_id() else {
            log::error!("{}: can not resolve {}: node is unknown", self.id, name);
            return Ok(None);
        };
        let seqno = self.create_seqno();
        self.register_event(Command::ResolveAck, seqno);
        let request = ResolveRequest {
            name: parsed.name,
            node,
            port: parsed
                .port
                .or_else(|| parsed.host.as_ref().map(|_| self.runtime.config().default_master_port)),
            host: parsed.host,
            seqno,
        };
        let targets = [node_id.clone()];
        if !self.send1(
            Command::Resolve,
            Body::Resolve(request),
            &targets,
            ChannelCaps::RELIABLEFIFO,
        )? {
            self.events.deregister(Command::ResolveAck, seqno);
            self.runtime.names().cancel_callback(&self.id, seqno);
            log::warn!("{}: can not ask node to resolve {}", self.id, name);
            return Ok(None);
        }

        let timeout = self.runtime.config().resolve_timeout;
        let timeout = (timeout > 0.0).then(|| Duration::from_secs_f64(timeout));
        match self.sync_timeout(Command::ResolveAck, seqno, &targets, timeout)? {
            Some(results) => match results.get(&node_id) {
                Some(AckValue::Resolved(pid)) => Ok(Some(pid.clone())),
                other => {
                    log::warn!("{}: unexpected resolve answer {:?}", self.id, other);
                    Ok(None)
                }
            },
            None => {
                // Requests of children in other OS processes expire on the node instead.
                self.runtime.names().cancel_callback(&self.id, seqno);
                log::info!("{}: {} is not resolved yet", self.id, name);
                Ok(None)
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////

    /// Creates processes of the class, returning ids of those which started
    /// and, if arguments were given, were set up successfully.
    pub fn new_processes(&mut self, class: &str, spec: NewSpec) -> ProcessResult<Vec<ProcessId>> {
        if !self.runtime.classes().contains(class) {
            return Err(ProcessError::Failed(format!(
                "can not create processes of unknown class {}",
                class
            )));
        }
        let names = spec.child_names();
        let method = spec
            .method
            .unwrap_or(self.runtime.config().default_proc_impl);
        let at = match spec.at.clone() {
            Some(at) => self.resolve_targets(at)?.0,
            None => Vec::new(),
        };

        let seqno = self.create_seqno();
        self.register_event(Command::NewAck, seqno);

        let children = if !at.is_empty() && at != [self.id.clone()] {
            self.register_event(Command::RPCReply, seqno);
            let request = NewRequest {
                class: class.to_owned(),
                names,
                method,
                daemon: spec.daemon,
                props: spec.props,
                seqno,
            };
            if self.send1(Command::New, Body::New(request), &at, ChannelCaps::RELIABLEFIFO)? {
                let replies = self.sync(Command::RPCReply, seqno, &at)?;
                replies
                    .into_values()
                    .flat_map(|value| match value {
                        AckValue::Children(children) => children,
                        _ => Vec::new(),
                    })
                    .collect()
            } else {
                self.events.deregister(Command::RPCReply, seqno);
                log::error!("{}: can not ask {:?} to create {}", self.id, at, class);
                Vec::new()
            }
        } else {
            let parent = self.id.clone();
            self.spawn_children(
                class,
                &names,
                &parent,
                seqno,
                method,
                spec.daemon,
                spec.props,
            )?
        };

        self.sync(Command::NewAck, seqno, &children)?;
        log::debug!("{}: created {} {} processes", self.id, children.len(), class);

        let Some(args) = spec.args else {
            return Ok(children);
        };
        let mut ready = Vec::new();
        for (child, ok) in self.setup_results(&children, &args)? {
            if ok {
                ready.push(child);
            } else {
                log::error!("{}: setup of {} failed, terminating it", self.id, child);
                self.send1(
                    Command::End,
                    Body::End { code: 1 },
                    &[child],
                    ChannelCaps::RELIABLEFIFO,
                )?;
            }
        }
        Ok(ready)
    }

    /// Creates one process of the class.
    pub fn new_process(&mut self, class: &str, args: Option<Vec<Value>>) -> ProcessResult<Option<ProcessId>> {
        let mut spec = NewSpec::default().count(1);
        if let Some(args) = args {
            spec = spec.args(args);
        }
        Ok(self.new_processes(class, spec)?.into_iter().next())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_children(
        &mut self,
        class: &str,
        names: &[String],
        parent: &ProcessId,
        seqno: u64,
        method: ProcImpl,
        daemon: bool,
        props: FaultProps,
    ) -> ProcessResult<Vec<ProcessId>> {
        if self.mode == TraceMode::Replay {
            return match self.mailbox.replay_send()? {
                SendRecord::New(children) => Ok(children),
                other => Err(TraceError::Mismatch(format!(
                    "expected spawn record, found {:?}",
                    other.command()
                ))
                .into()),
            };
        }

        let children = self.spawner.spawn(
            &self.id,
            self.node.is_some(),
            class,
            names,
            parent,
            props,
            seqno,
            method,
            daemon,
        );
        if self.mode == TraceMode::Record {
            self.mailbox.record_send(SendRecord::New(children.clone()))?;
        }
        Ok(children)
    }

    fn setup_results(
        &mut self,
        procs: &[ProcessId],
        args: &[Value],
    ) -> ProcessResult<Vec<(ProcessId, bool)>> {
        let args = Message::new("args", &args).map_err(ProcessError::Failed)?;
        let seqno = self.create_seqno();
        self.register_event(Command::SetupAck, seqno);
        if !self.send1(
            Command::Setup,
            Body::Setup { seqno, args },
            procs,
            ChannelCaps::RELIABLEFIFO,
        )? {
            self.events.deregister(Command::SetupAck, seqno);
            return Ok(procs.iter().map(|p| (p.clone(), false)).collect());
        }
        let results = self.sync(Command::SetupAck, seqno, procs)?;
        Ok(procs
            .iter()
            .map(|p| {
                let ok = matches!(results.get(p), Some(AckValue::Flag(true) | AckValue::Unit));
                (p.clone(), ok)
            })
            .collect())
    }

    /// Sets processes up with the arguments.
    pub fn setup(&mut self, procs: impl Into<Targets>, args: Vec<Value>) -> ProcessResult<bool> {
        let (procs, resolved) = self.resolve_targets(procs.into())?;
        let results = self.setup_results(&procs, &args)?;
        Ok(resolved && results.iter().all(|(_, ok)| *ok))
    }

    /// Starts processes, waiting until every one acknowledges.
    pub fn start(&mut self, procs: impl Into<Targets>) -> ProcessResult<bool> {
        let (procs, resolved) = self.resolve_targets(procs.into())?;
        let seqno = self.create_seqno();
        self.register_event(Command::StartAck, seqno);
        if !self.send1(
            Command::Start,
            Body::Start { seqno },
            &procs,
            ChannelCaps::RELIABLEFIFO,
        )? {
            self.events.deregister(Command::StartAck, seqno);
            return Ok(false);
        }
        self.sync(Command::StartAck, seqno, &procs)?;
        Ok(resolved)
    }

    /// Asks processes to exit with the code.
    pub fn end(&mut self, procs: impl Into<Targets>, code: i32) -> ProcessResult<bool> {
        let (procs, resolved) = self.resolve_targets(procs.into())?;
        Ok(self.send1(
            Command::End,
            Body::End { code },
            &procs,
            ChannelCaps::RELIABLEFIFO,
        )? && resolved)
    }

    /// Blocks forever, still handling commands.
    pub fn hanged(&mut self) -> ProcessResult<()> {
        self.register_event(Command::EndAck, HANG_SEQNO);
        let me = [self.id.clone()];
        self.sync(Command::EndAck, HANG_SEQNO, &me).map(|_| ())
    }

    fn control(&mut self, procs: impl Into<Targets>, command: Command, body: Body) -> ProcessResult<bool> {
        let (procs, resolved) = self.resolve_targets(procs.into())?;
        Ok(self.send1(command, body, &procs, ChannelCaps::RELIABLEFIFO)? && resolved)
    }

    /// Crashes processes: they drop everything until recovered.
    pub fn crash(&mut self, procs: impl Into<Targets>) -> ProcessResult<bool> {
        self.control(procs, Command::Crash, Body::Crash)
    }

    /// Recovers crashed processes.
    pub fn recover(&mut self, procs: impl Into<Targets>) -> ProcessResult<bool> {
        self.control(procs, Command::Recover, Body::Recover)
    }

    /// Asks processes to save snapshots with the tag.
    pub fn backup(&mut self, procs: impl Into<Targets>, tag: &str) -> ProcessResult<bool> {
        let seqno = self.create_seqno();
        let body = Body::Backup {
            seqno,
            tag: tag.to_owned(),
        };
        self.control(procs, Command::Backup, body)
    }

    /// Asks processes to load their latest snapshot with the tag,
    /// or the snapshot directory `tag` if `full` is set.
    pub fn restore(&mut self, procs: impl Into<Targets>, tag: &str, full: bool) -> ProcessResult<bool> {
        let seqno = self.create_seqno();
        let body = Body::Restore {
            seqno,
            tag: tag.to_owned(),
            full,
        };
        self.control(procs, Command::Restore, body)
    }

    /// Updates config entry of processes.
    pub fn configure(&mut self, procs: impl Into<Targets>, key: &str, value: &Value) -> ProcessResult<bool> {
        let body = Body::Config {
            key: key.to_owned(),
            value: value.to_string(),
        };
        self.control(procs, Command::Config, body)
    }
}
