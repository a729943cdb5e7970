//! Node role: the first process of an execution unit, which keeps
//! the peer node set and answers name resolution.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use super::dispatch::CommandTable;
use super::DistProcess;
use crate::common::command::{AckValue, Body, Command, Packet};
use crate::common::pid::{PendingResolve, ProcessId};
use crate::error::ProcessResult;
use crate::transport::ChannelCaps;

pub(crate) struct NodeRole {
    nodes: Arc<Mutex<BTreeSet<ProcessId>>>,
    args: Vec<Value>,
}

impl NodeRole {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            nodes: Arc::default(),
            args,
        }
    }
}

pub(crate) fn extend_table(table: &mut CommandTable) {
    table.set(Command::Resolve, cmd_resolve);
    table.set(Command::NodeJoin, cmd_node_join);
    table.set(Command::NodeLeave, cmd_node_leave);
    table.set(Command::NodePing, cmd_node_ping);
}

fn peers_of(nodes: &Mutex<BTreeSet<ProcessId>>) -> Vec<ProcessId> {
    nodes.lock().iter().cloned().collect()
}

impl DistProcess {
    fn node_set(&self) -> Arc<Mutex<BTreeSet<ProcessId>>> {
        self.node
            .as_ref()
            .map(|role| role.nodes.clone())
            .unwrap_or_default()
    }

    /// Known peer nodes. Empty for regular processes.
    pub fn peer_nodes(&self) -> Vec<ProcessId> {
        self.node
            .as_ref()
            .map(|role| peers_of(&role.nodes))
            .unwrap_or_default()
    }

    pub(crate) fn node_delayed_start(&mut self) -> ProcessResult<i32> {
        if self.router.bootstrap_peer().is_some() {
            self.bootstrap()?;
        }

        let args = self
            .node
            .as_ref()
            .map(|role| role.args.clone())
            .unwrap_or_default();
        let result = if self.runtime.config().idle {
            self.hanged().map(|_| 0)
        } else {
            match self.setup_algorithm(&args) {
                Ok(()) => {
                    self.setup_called = true;
                    self.running = true;
                    self.run_algorithm()
                }
                Err(e) => {
                    log::error!("{}: setup failed: {}", self.id, e);
                    Ok(-1)
                }
            }
        };

        let peers = self.peer_nodes();
        if !peers.is_empty() {
            if let Err(e) = self.send1(
                Command::NodeLeave,
                Body::NodeLeave,
                &peers,
                ChannelCaps::RELIABLEFIFO,
            ) {
                log::warn!("{}: can not notify peers: {}", self.id, e);
            }
        }
        result
    }

    /// Joins the node the router bootstrapped to, exchanging named processes
    /// and peer sets. Returns `false` if there is no such node or it did not answer.
    pub(crate) fn bootstrap(&mut self) -> ProcessResult<bool> {
        let Some(target) = self.router.bootstrap_peer() else {
            return Ok(false);
        };
        let nodes = self.node_set();
        nodes.lock().insert(target.clone());

        let seqno = self.create_seqno();
        self.register_event(Command::NodeAck, seqno);
        let named = self.runtime.names().all_named();
        let targets = [target.clone()];
        if !self.send1(
            Command::NodeJoin,
            Body::NodeJoin { named, seqno },
            &targets,
            ChannelCaps::RELIABLEFIFO,
        )? {
            self.events.deregister(Command::NodeAck, seqno);
            log::error!("{}: can not join {}", self.id, target);
            return Ok(false);
        }

        let results = self.sync(Command::NodeAck, seqno, &targets)?;
        if let Some(AckValue::Peers { nodes: peers, named }) = results.get(&target) {
            self.runtime.names().register_all(named);
            let mut nodes = nodes.lock();
            nodes.extend(peers.iter().filter(|p| **p != self.id).cloned());
        }
        log::info!("{}: joined {}", self.id, target);
        Ok(true)
    }
}

////////////////////////////////////////////////////////////////////////////////

fn cmd_resolve(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::Resolve(request) = body else {
        return Err(super::dispatch::malformed(command));
    };
    let seqno = request.seqno;
    let node = if request.node.is_empty() {
        p.runtime.node_name()
    } else {
        request.node.clone()
    };

    let router = p.router.clone();
    let me = p.id.clone();
    let nodes = p.node_set();
    let asker = src.clone();
    let callback = Box::new(move |pid: &ProcessId| {
        let answer = Packet::ack(Command::ResolveAck, seqno, AckValue::Resolved(pid.clone()));
        if !router.send(&me, &asker, &answer, ChannelCaps::RELIABLEFIFO) {
            log::warn!("{}: can not answer {} about {}", me, asker, pid);
        }
        let ping = Packet::new(
            Command::NodePing,
            Body::NodePing {
                seqno,
                pid: Some(pid.clone()),
            },
        );
        for peer in peers_of(&nodes) {
            router.send(&me, &peer, &ping, ChannelCaps::RELIABLEFIFO);
        }
    });

    let timeout = p.runtime.config().resolve_timeout;
    let deadline = (timeout > 0.0).then(|| Instant::now() + Duration::from_secs_f64(timeout));
    let pending = PendingResolve::new(src.clone(), seqno, deadline, callback);
    let found = p
        .runtime
        .names()
        .lookup_or_register_callback(&request.name, &node, pending);
    if let Some(pid) = found {
        p.send1(
            Command::ResolveAck,
            Body::Ack {
                seqno,
                value: AckValue::Resolved(pid),
            },
            &[src],
            ChannelCaps::RELIABLEFIFO,
        )?;
        return Ok(());
    }

    if let Some(host) = request.host {
        let port = request
            .port
            .unwrap_or(p.runtime.config().default_master_port);
        let timeout = Duration::from_secs_f64(p.runtime.config().bootstrap_timeout);
        match p.router.bootstrap_node(&host, port, timeout) {
            Ok(peer) => {
                log::debug!("{}: bootstrapped to {} to resolve {}", p.id, peer, request.name);
                p.bootstrap()?;
            }
            Err(e) => log::error!("{}: can not bootstrap to {}:{}: {}", p.id, host, port, e),
        }
    }
    Ok(())
}

fn cmd_node_join(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::NodeJoin { named, seqno } = body else {
        return Err(super::dispatch::malformed(command));
    };
    p.runtime.names().register_all(&named);
    let nodes = p.node_set();
    let value = AckValue::Peers {
        nodes: peers_of(&nodes),
        named: p.runtime.names().all_named(),
    };
    p.send1(
        Command::NodeAck,
        Body::Ack { seqno, value },
        &[src.clone()],
        ChannelCaps::RELIABLEFIFO,
    )?;
    log::info!("{}: {} joined", p.id, src);
    nodes.lock().insert(src);
    Ok(())
}

fn cmd_node_leave(p: &mut DistProcess, _command: Command, src: ProcessId, _body: Body) -> ProcessResult<()> {
    p.node_set().lock().remove(&src);
    p.runtime.names().drop_entry(&src);
    p.runtime.names().drop_node(src.node());
    log::info!("{}: {} left", p.id, src);
    Ok(())
}

fn cmd_node_ping(p: &mut DistProcess, command: Command, src: ProcessId, body: Body) -> ProcessResult<()> {
    let Body::NodePing { pid, .. } = body else {
        return Err(super::dispatch::malformed(command));
    };
    if src != p.id && src.name() == src.node() {
        p.node_set().lock().insert(src);
    }
    if let Some(pid) = pid {
        p.runtime.names().register(&pid);
    }
    Ok(())
}
