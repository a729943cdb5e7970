//! Protocol commands and packets exchanged between processes and routers.

use serde::{Deserialize, Serialize};

use procnet_message::Message;

use super::pid::ProcessId;
use crate::config::ProcImpl;
use crate::process::fault::FaultProps;

////////////////////////////////////////////////////////////////////////////////

/// Closed set of protocol commands.
///
/// Numeric tags are stable, they are used as wire tags and as
/// indices of the dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Command {
    Start = 1,
    Setup = 2,
    Config = 3,
    End = 5,
    New = 6,
    Resolve = 7,
    NodeJoin = 8,
    NodeLeave = 9,
    StartAck = 11,
    SetupAck = 12,
    ConfigAck = 13,
    EndAck = 15,
    NewAck = 16,
    ResolveAck = 17,
    NodeAck = 18,
    NodePing = 19,
    Message = 20,
    RPC = 30,
    RPCReply = 31,
    Backup = 32,
    Restore = 33,
    Crash = 34,
    Recover = 35,
}

impl Command {
    /// Size of the tag space.
    pub const COUNT: usize = 40;

    const ALL: [Command; 23] = [
        Command::Start,
        Command::Setup,
        Command::Config,
        Command::End,
        Command::New,
        Command::Resolve,
        Command::NodeJoin,
        Command::NodeLeave,
        Command::StartAck,
        Command::SetupAck,
        Command::ConfigAck,
        Command::EndAck,
        Command::NewAck,
        Command::ResolveAck,
        Command::NodeAck,
        Command::NodePing,
        Command::Message,
        Command::RPC,
        Command::RPCReply,
        Command::Backup,
        Command::Restore,
        Command::Crash,
        Command::Recover,
    ];

    /// Numeric tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Index in the dispatch table.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command.tag()
    }
}

impl TryFrom<u8> for Command {
    type Error = String;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.tag() == tag)
            .ok_or_else(|| format!("unknown command tag {}", tag))
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Value carried by acknowledgements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AckValue {
    /// Nothing but the fact of acknowledgement.
    Unit,
    /// Success flag.
    Flag(bool),
    /// Children created by a remote `new`.
    Children(Vec<ProcessId>),
    /// Resolved process.
    Resolved(ProcessId),
    /// Peer set and named processes known to a node.
    Peers {
        /// Known node processes.
        nodes: Vec<ProcessId>,
        /// Known named processes.
        named: Vec<ProcessId>,
    },
}

/// Request to create processes on behalf of another process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    /// Class of children.
    pub class: String,
    /// One entry per child, empty for anonymous ones.
    pub names: Vec<String>,
    /// Implementation of children.
    pub method: ProcImpl,
    /// Children do not keep their parent's execution unit alive.
    pub daemon: bool,
    /// Fault probabilities of children.
    pub props: FaultProps,
    /// Sequence number of the request.
    pub seqno: u64,
}

/// Request to resolve process name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Process name.
    pub name: String,
    /// Node name.
    pub node: String,
    /// Bootstrap host hint.
    pub host: Option<String>,
    /// Bootstrap port hint.
    pub port: Option<u16>,
    /// Sequence number of the request.
    pub seqno: u64,
}

/// Payload of a packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Body {
    /// Acknowledgement of the command with the same sequence number.
    Ack { seqno: u64, value: AckValue },
    /// Setup with json-encoded arguments.
    Setup { seqno: u64, args: Message },
    Start { seqno: u64 },
    End { code: i32 },
    New(NewRequest),
    Resolve(ResolveRequest),
    NodeJoin { named: Vec<ProcessId>, seqno: u64 },
    NodeLeave,
    NodePing { seqno: u64, pid: Option<ProcessId> },
    /// User message with the sender's logical clock.
    Message { clock: Option<u64>, message: Message },
    Backup { seqno: u64, tag: String },
    Restore { seqno: u64, tag: String, full: bool },
    Crash,
    Recover,
    /// Config entry with json-encoded value.
    Config { key: String, value: String },
}

/// Unit of communication between processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Command.
    pub command: Command,
    /// Payload.
    pub body: Body,
}

impl Packet {
    /// Create new packet.
    pub fn new(command: Command, body: Body) -> Self {
        Self { command, body }
    }

    /// Create acknowledgement packet.
    pub fn ack(command: Command, seqno: u64, value: AckValue) -> Self {
        Self::new(command, Body::Ack { seqno, value })
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Commands of the router bootstrap sub-protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RouterCommand {
    /// Greeting carrying our named processes.
    Hello {
        /// Named processes known to the sender.
        named: Vec<ProcessId>,
    },
    /// Propagation of named processes.
    Ping {
        /// Named processes known to the sender.
        named: Vec<ProcessId>,
    },
    /// Sender leaves.
    Bye,
    /// Answer to [`Hello`][RouterCommand::Hello].
    Ack {
        /// Node process of the answering router.
        node: ProcessId,
        /// Named processes known to the answering router.
        named: Vec<ProcessId>,
    },
}

/// Content of a wire frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Content {
    /// Packet for a process.
    Process(Packet),
    /// Command for the router.
    Router(RouterCommand),
}

/// Unit of transmission between routers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    /// Sender.
    pub src: Option<ProcessId>,
    /// Receiver, `None` for router-internal messages.
    pub dst: Option<ProcessId>,
    /// Content.
    pub content: Content,
}

/// Borrowed counterpart of [`Content`] encoded identically.
#[derive(Clone, Copy, Debug, Serialize)]
pub(crate) enum ContentRef<'a> {
    Process(&'a Packet),
    Router(&'a RouterCommand),
}

/// Borrowed counterpart of [`WireFrame`] encoded identically.
#[derive(Debug, Serialize)]
pub(crate) struct WireFrameRef<'a> {
    pub src: Option<&'a ProcessId>,
    pub dst: Option<&'a ProcessId>,
    pub content: ContentRef<'a>,
}

impl ContentRef<'_> {
    pub(crate) fn to_owned_content(self) -> Content {
        match self {
            ContentRef::Process(packet) => Content::Process(packet.clone()),
            ContentRef::Router(command) => Content::Router(command.clone()),
        }
    }
}
