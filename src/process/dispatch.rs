//! Handlers of protocol commands.

use std::path::PathBuf;

use serde_json::Value;

use super::state::{latest_snapshot, read_snapshot, write_snapshot};
use super::{node, DistProcess};
use crate::common::command::{AckValue, Body, Command};
use crate::common::pid::ProcessId;
use crate::config::ClockKind;
use crate::error::{ProcessError, ProcessResult};
use crate::process::fault::FaultKind;
use crate::process::pattern::{Event, EventKind};
use crate::transport::ChannelCaps;

pub(crate) type CommandHandler =
    fn(&mut DistProcess, Command, ProcessId, Body) -> ProcessResult<()>;

/// Handler per command, indexed by the command's wire tag.
pub(crate) struct CommandTable {
    handlers: [Option<CommandHandler>; Command::COUNT],
}

const ACKS: [Command; 6] = [
    Command::NewAck,
    Command::EndAck,
    Command::StartAck,
    Command::SetupAck,
    Command::ResolveAck,
    Command::RPCReply,
];

impl CommandTable {
    pub fn build(is_node: bool) -> Self {
        let mut table = Self {
            handlers: [None; Command::COUNT],
        };
        for ack in ACKS {
            table.set(ack, cmd_ack);
        }
        table.set(Command::Start, cmd_start);
        table.set(Command::Setup, cmd_setup);
        table.set(Command::End, cmd_end);
        table.set(Command::Config, cmd_config);
        table.set(Command::Message, cmd_message);
        table.set(Command::New, cmd_new);
        table.set(Command::Backup, cmd_backup);
        table.set(Command::Restore, cmd_restore);
        table.set(Command::Crash, cmd_crash);
        table.set(Command::Recover, cmd_recover);
        if is_node {
            table.set(Command::NodeAck, cmd_ack);
            node::extend_table(&mut table);
        }
        table
    }

    pub fn set(&mut self, command: Command, handler: CommandHandler) {
        self.handlers[command.index()] = Some(handler);
    }

    pub fn get(&self, command: Command) -> Option<CommandHandler> {
        self.handlers.get(command.index()).copied().flatten()
    }
}

pub(super) fn malformed(command: Command) -> ProcessError {
    ProcessError::Failed(format!("{:?} with malformed body", command))
}

////////////////////////////////////////////////////////////////////////////////

fn cmd_ack(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Ack { seqno, value } = body else {
        return Err(malformed(command));
    };
    if !p.events.ack(command, seqno, src.clone(), value) {
        log::debug!("{}: unexpected {:?} #{} from {}", p.id, command, seqno, src);
    }
    Ok(())
}

fn cmd_start(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Start { seqno } = body else {
        return Err(malformed(command));
    };
    if p.running {
        log::warn!("{}: already started", p.id);
    } else if !p.setup_called {
        log::error!("{}: start before setup", p.id);
    } else {
        log::debug!("{}: starting", p.id);
        p.running = true;
    }
    p.send1(
        Command::StartAck,
        Body::Ack {
            seqno,
            value: AckValue::Unit,
        },
        &[src],
        ChannelCaps::RELIABLEFIFO,
    )?;
    Ok(())
}

fn cmd_setup(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Setup { seqno, args } = body else {
        return Err(malformed(command));
    };
    let ok = if p.setup_called {
        log::warn!("{}: setup is already done", p.id);
        false
    } else {
        let result = args
            .get_data::<Vec<Value>>()
            .and_then(|args| p.setup_algorithm(&args));
        match result {
            Ok(()) => {
                p.setup_called = true;
                true
            }
            Err(e) => {
                log::error!("{}: setup failed: {}", p.id, e);
                false
            }
        }
    };
    p.send1(
        Command::SetupAck,
        Body::Ack {
            seqno,
            value: AckValue::Flag(ok),
        },
        &[src],
        ChannelCaps::RELIABLEFIFO,
    )?;
    Ok(())
}

fn cmd_end(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::End { code } = body else {
        return Err(malformed(command));
    };
    let authorized =
        p.parent.as_ref() == Some(&src) || p.runtime.node_id().as_ref() == Some(&src);
    if authorized {
        log::debug!("{}: ended by {} with code {}", p.id, src, code);
        return Err(ProcessError::Exit(code));
    }
    log::warn!("{}: ignoring unauthorized End from {}", p.id, src);
    Ok(())
}

fn cmd_config(p: &mut DistProcess, command: Command, _src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Config { key, value } = body else {
        return Err(malformed(command));
    };
    let result = serde_json::from_str::<Value>(&value)
        .map_err(|e| e.to_string())
        .and_then(|value| p.config.set(&key, &value));
    if let Err(e) = result {
        log::warn!("{}: can not set config {}: {}", p.id, key, e);
    }
    Ok(())
}

fn cmd_message(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Message { clock, message } = body else {
        return Err(malformed(command));
    };
    if p.faults.fails(FaultKind::Receive) {
        log::info!("{}: dropped received {}", p.id, message.get_tip());
        return Ok(());
    }
    if p.config.clock == ClockKind::Lamport {
        let Some(clock) = clock else {
            log::warn!("{}: message from {} has no clock, dropping", p.id, src);
            return Ok(());
        };
        p.clock = p.clock.max(clock) + 1;
    }
    let event = Event {
        kind: EventKind::Received,
        clock,
        from: src,
        to: vec![p.id.clone()],
        message,
    };
    p.trigger(event);
    Ok(())
}

fn cmd_new(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::New(request) = body else {
        return Err(malformed(command));
    };
    let children = if p.runtime.classes().contains(&request.class) {
        p.spawn_children(
            &request.class,
            &request.names,
            &src,
            request.seqno,
            request.method,
            request.daemon,
            request.props,
        )?
    } else {
        log::error!("{}: {} asks for unknown class {}", p.id, src, request.class);
        Vec::new()
    };
    p.send1(
        Command::RPCReply,
        Body::Ack {
            seqno: request.seqno,
            value: AckValue::Children(children),
        },
        &[src],
        ChannelCaps::RELIABLEFIFO,
    )?;
    Ok(())
}

fn cmd_backup(p: &mut DistProcess, command: Command, _src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Backup { tag, .. } = body else {
        return Err(malformed(command));
    };
    if !p.config.enable_backup {
        log::warn!("{}: backup is disabled", p.id);
        return Ok(());
    }
    let base = p.runtime.config().backup_dir.clone();
    match write_snapshot(&base, &p.id, &tag, &p.state, &p.histories) {
        Ok(dir) => log::info!("{}: backed up into {}", p.id, dir.display()),
        Err(e) => log::error!("{}: backup failed: {}", p.id, e),
    }
    Ok(())
}

fn cmd_restore(p: &mut DistProcess, command: Command, _src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Restore { tag, full, .. } = body else {
        return Err(malformed(command));
    };
    if !p.config.enable_backup {
        log::warn!("{}: restore is disabled", p.id);
        return Ok(());
    }
    let dir = if full {
        Some(PathBuf::from(&tag))
    } else {
        latest_snapshot(&p.runtime.config().backup_dir, &p.id, &tag)
    };
    let Some(dir) = dir else {
        log::error!("{}: no snapshot with tag '{}'", p.id, tag);
        return Ok(());
    };
    match read_snapshot(&dir, &p.id, &mut p.state, &mut p.histories) {
        Ok(()) => log::info!("{}: restored from {}", p.id, dir.display()),
        Err(e) => log::error!("{}: restore failed: {}", p.id, e),
    }
    Ok(())
}

fn cmd_crash(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    if !matches!(body, Body::Crash) {
        return Err(malformed(command));
    }
    if p.config.enable_crash {
        log::info!("{}: crashed by {}", p.id, src);
        p.crashed = true;
    } else {
        log::warn!("{}: crash is disabled", p.id);
    }
    Ok(())
}

fn cmd_recover(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    if !matches!(body, Body::Recover) {
        return Err(malformed(command));
    }
    if p.crashed {
        log::info!("{}: recovered by {}", p.id, src);
    }
    p.crashed = false;
    Ok(())
}
