//! Runtime for message-passing processes implementing distributed algorithms.
//!
//! Every process is hosted by a [container][`container::ProcessContainer`], talks to other
//! processes only through a per-execution-unit [router][`router::Router`], and is driven by a
//! cooperative [engine][`process::DistProcess`] which dispatches protocol commands,
//! synchronizes on acknowledgements and runs user handlers at label points.
//!
//! Runs can be recorded into binary traces and replayed deterministically, see [`trace`].

// Add warnings for missing public documentation.
#![warn(missing_docs)]

pub mod codec;
pub mod common;
pub mod config;
pub mod container;
pub mod error;
pub mod logging;
pub mod process;
pub mod router;
pub mod runtime;
pub mod trace;
pub mod transport;

pub use common::command::{AckValue, Body, Command, Packet};
pub use common::pid::{NameRegistry, ProcessId};
pub use config::{ProcImpl, ProcessConfig, RuntimeConfig, TransportKind};
pub use container::{init, interrupt, replay_trace, run_node, ProcessContainer};
pub use error::{ProcessError, ProcessResult, RoutingError, TraceError, TransportError};
pub use process::{
    fault::FaultProps,
    pattern::{Bindings, Event, EventBinding, EventKind, EventPattern, Handler, TipPattern},
    state::StateBag,
    Algorithm, DistProcess, NewSpec, Targets,
};
pub use procnet_macros::Passable;
pub use procnet_message::{Message, Passable as PassableMessage};
pub use runtime::{ClassRegistry, Runtime};
pub use transport::ChannelCaps;
