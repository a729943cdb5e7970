//! Process containers: execution units hosting one process each,
//! and the entry points of node, child and replay runs.

use std::io::{self, BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process::{Child, Command as OsCommand, Stdio};
use std::sync::{Arc, Once, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::command::RouterCommand;
use crate::common::pid::{check_name, ProcessId};
use crate::common::queue::Mailbox;
use crate::config::{ProcImpl, RuntimeConfig, StartMethod, TransportKind};
use crate::error::{ProcessError, ProcessResult};
use crate::process::fault::FaultProps;
use crate::process::{DistProcess, ProcessParts, TraceMode};
use crate::router::Router;
use crate::runtime::{ClassRegistry, Runtime};
use crate::trace::ReplayMailbox;
use crate::transport::{self, ChannelCaps, TransportHandoff, TransportManager};

/// Exit code of a process interrupted by its execution unit.
pub const EXIT_INTERRUPTED: i32 = 1;
/// Exit code of a routing failure.
pub const EXIT_ROUTING: i32 = 2;
/// Exit code of a trace failure.
pub const EXIT_TRACE: i32 = 3;
/// Exit code of an unexpected failure.
pub const EXIT_UNEXPECTED: i32 = 5;

/// Set in the environment of child OS processes.
const CHILD_ENV: &str = "PROCNET_CHILD";

/// Line a child prints once its transports are bound.
const CHILD_READY: &str = "done";

/// Children finished within this period are considered failed to start.
const GRACE_PERIOD: Duration = Duration::from_millis(10);

////////////////////////////////////////////////////////////////////////////////

/// Everything a child OS process needs to host its process.
#[derive(Serialize, Deserialize)]
struct SpawnHandoff {
    pid: ProcessId,
    parent: ProcessId,
    seqno: u64,
    props: FaultProps,
    node: ProcessId,
    config: RuntimeConfig,
    transport: TransportHandoff,
}

/// Creates children on behalf of a process.
#[derive(Clone)]
pub(crate) struct Spawner {
    runtime: Arc<Runtime>,
    router: Arc<Router>,
}

impl Spawner {
    pub fn new(runtime: Arc<Runtime>, router: Arc<Router>) -> Self {
        Self { runtime, router }
    }

    /// Spawns one child per name, returning ids of children which started.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        &self,
        owner: &ProcessId,
        is_node: bool,
        class: &str,
        names: &[String],
        parent: &ProcessId,
        props: FaultProps,
        seqno: u64,
        method: ProcImpl,
        daemon: bool,
    ) -> Vec<ProcessId> {
        if !self.runtime.classes().contains(class) {
            log::error!("{}: can not spawn unknown class {}", owner, class);
            return Vec::new();
        }
        if let Some(bad) = names.iter().find(|n| !n.is_empty() && !check_name(n)) {
            log::error!("{}: illegal process name '{}'", owner, bad);
            return Vec::new();
        }

        let children: Vec<ProcessId> = names
            .iter()
            .filter_map(|name| {
                let spawned = match method {
                    ProcImpl::Thread => self.spawn_thread(class, name, parent, props, seqno, daemon),
                    ProcImpl::Process => self.spawn_process(class, name, parent, props, seqno, daemon),
                };
                spawned
                    .map_err(|e| log::error!("{}: can not spawn {} '{}': {}", owner, class, name, e))
                    .ok()
            })
            .collect();

        let named: Vec<ProcessId> = children.iter().filter(|c| c.is_named()).cloned().collect();
        if !named.is_empty() && !is_node {
            if let Some(node) = self.runtime.node_id() {
                self.router.send_router(
                    owner,
                    &node,
                    &RouterCommand::Ping { named },
                    ChannelCaps::BROADCAST | ChannelCaps::RELIABLEFIFO,
                );
            }
        }
        children
    }

    fn spawn_thread(
        &self,
        class: &str,
        name: &str,
        parent: &ProcessId,
        props: FaultProps,
        seqno: u64,
        daemon: bool,
    ) -> Result<ProcessId, String> {
        let tm = self.router.transport_manager();
        let pid = ProcessId::create(
            class,
            tm.host(),
            tm.transport_addresses(),
            name,
            &self.runtime.node_name(),
        );
        self.runtime.names().register(&pid);

        let container = ProcessContainer {
            runtime: self.runtime.clone(),
            router: self.router.clone(),
            pid: pid.clone(),
            parent: Some(parent.clone()),
            seqno: Some(seqno),
            props,
            replay: None,
            node_args: None,
        };
        let handle = thread::Builder::new()
            .name(pid.to_string())
            .spawn(move || container.run())
            .map_err(|e| e.to_string())?;

        thread::sleep(GRACE_PERIOD);
        if handle.is_finished() {
            let code = handle.join().unwrap_or(EXIT_UNEXPECTED);
            self.runtime.names().drop_entry(&pid);
            return Err(format!("terminated prematurely with code {}", code));
        }
        self.runtime.adopt_thread(handle, daemon);
        Ok(pid)
    }

    fn spawn_process(
        &self,
        class: &str,
        name: &str,
        parent: &ProcessId,
        props: FaultProps,
        seqno: u64,
        daemon: bool,
    ) -> Result<ProcessId, String> {
        let mut config = self.runtime.config().clone();
        if config.start_method == StartMethod::Fork {
            log::debug!("Fork start method is served with spawn semantics");
        }
        if config.transport == TransportKind::Memory {
            return Err("memory transport can not reach other OS processes".to_owned());
        }
        config.cookie = Some(self.runtime.cookie().to_owned());
        config.port = None;
        let node = self
            .runtime
            .node_id()
            .ok_or_else(|| "node is unknown".to_owned())?;

        // Bind the ports here so the id is known before the child starts.
        // The listeners are closed again and the child rebinds the same port
        // numbers, so another program may take a port in between. The child
        // then fails to get ready and the spawn is reported as failed.
        let tm = transport::create_manager(&config, self.runtime.cookie());
        tm.initialize().map_err(|e| e.to_string())?;
        let pid = ProcessId::create(
            class,
            tm.host(),
            tm.transport_addresses(),
            name,
            &self.runtime.node_name(),
        );
        let handoff = tm.handoff().map_err(|e| e.to_string());
        tm.close();
        let handoff = SpawnHandoff {
            pid: pid.clone(),
            parent: parent.clone(),
            seqno,
            props,
            node,
            config,
            transport: handoff?,
        };

        let mut child = launch_child(&handoff)?;
        thread::sleep(GRACE_PERIOD);
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("terminated prematurely: {}", status));
        }
        self.runtime.names().register(&pid);
        self.runtime.adopt_process(child, daemon);
        Ok(pid)
    }
}

fn launch_child(handoff: &SpawnHandoff) -> Result<Child, String> {
    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    let mut child = OsCommand::new(exe)
        .env(CHILD_ENV, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| e.to_string())?;

    let payload = serde_json::to_string(handoff).map_err(|e| e.to_string())?;
    if let Some(mut stdin) = child.stdin.take() {
        writeln!(stdin, "{}", payload).map_err(|e| e.to_string())?;
    }

    let Some(stdout) = child.stdout.take() else {
        return Err("child stdout is not captured".to_owned());
    };
    let mut lines = BufReader::new(stdout).lines();
    match lines.next() {
        Some(Ok(line)) if line.trim() == CHILD_READY => {}
        other => {
            let _ = child.kill();
            return Err(format!("child did not get ready: {:?}", other));
        }
    }
    thread::spawn(move || {
        for line in lines.map_while(Result::ok) {
            println!("{}", line);
        }
    });
    Ok(child)
}

////////////////////////////////////////////////////////////////////////////////

/// Execution unit hosting one process.
pub struct ProcessContainer {
    runtime: Arc<Runtime>,
    router: Arc<Router>,
    pid: ProcessId,
    parent: Option<ProcessId>,
    seqno: Option<u64>,
    props: FaultProps,
    replay: Option<Arc<ReplayMailbox>>,
    node_args: Option<Vec<Value>>,
}

impl ProcessContainer {
    /// Id of the hosted process.
    pub fn pid(&self) -> &ProcessId {
        &self.pid
    }

    /// Runs the process to completion, returning its exit code.
    pub fn run(self) -> i32 {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_process()));
        self.router.deregister_local_process(&self.pid);
        match result {
            Ok(Ok(code)) => {
                log::debug!("{} finished with code {}", self.pid, code);
                code
            }
            Ok(Err(e)) => exit_code(&self.pid, e),
            Err(_) => {
                log::error!("{} panicked", self.pid);
                EXIT_UNEXPECTED
            }
        }
    }

    fn run_process(&self) -> ProcessResult<i32> {
        let (mailbox, mode): (Arc<dyn Mailbox>, TraceMode) = match &self.replay {
            Some(replay) => {
                let mailbox: Arc<dyn Mailbox> = replay.clone();
                self.router.replace_local_process(&self.pid, mailbox.clone());
                (mailbox, TraceMode::Replay)
            }
            None => {
                let mailbox = self
                    .router
                    .register_local_process(&self.pid, self.parent.as_ref())?;
                let mode = if self.runtime.config().record_trace {
                    TraceMode::Record
                } else {
                    TraceMode::Live
                };
                (mailbox, mode)
            }
        };
        self.router.start()?;

        let algorithm = self
            .runtime
            .classes()
            .instantiate(self.pid.class())
            .ok_or_else(|| ProcessError::Failed(format!("unknown class {}", self.pid.class())))?;
        let mut process = DistProcess::new(ProcessParts {
            runtime: self.runtime.clone(),
            router: self.router.clone(),
            mailbox,
            mode,
            pid: self.pid.clone(),
            parent: self.parent.clone(),
            algorithm,
            props: self.props,
            newcmd_seqno: self.seqno,
            node_args: self.node_args.clone(),
        });
        process.delayed_start()
    }
}

fn exit_code(pid: &ProcessId, error: ProcessError) -> i32 {
    match error {
        ProcessError::Exit(code) => {
            log::debug!("{} exited with code {}", pid, code);
            code
        }
        ProcessError::Routing(e) => {
            log::error!("{}: routing failed: {}", pid, e);
            EXIT_ROUTING
        }
        ProcessError::Trace(e) => {
            log::error!("{}: trace failed: {}", pid, e);
            EXIT_TRACE
        }
        ProcessError::Interrupted => {
            log::info!("{} interrupted", pid);
            EXIT_INTERRUPTED
        }
        ProcessError::Failed(e) => {
            log::error!("{}: {}", pid, e);
            EXIT_UNEXPECTED
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Routers whose processes are interrupted by ctrl-c.
static INTERRUPTIBLE: Mutex<Vec<Weak<Router>>> = const_mutex(Vec::new());
static SIGNAL_WATCHER: Once = Once::new();

/// Interrupts every process hosted by this OS process.
///
/// Processes waiting for messages exit with [`EXIT_INTERRUPTED`].
/// Called on ctrl-c once a node or child run is started.
pub fn interrupt() {
    let routers: Vec<Arc<Router>> = INTERRUPTIBLE.lock().iter().filter_map(Weak::upgrade).collect();
    for router in routers {
        router.interrupt_local_processes();
    }
}

fn watch_interrupts(router: &Arc<Router>) {
    {
        let mut routers = INTERRUPTIBLE.lock();
        routers.retain(|r| r.strong_count() > 0);
        routers.push(Arc::downgrade(router));
    }
    SIGNAL_WATCHER.call_once(|| {
        let spawned = thread::Builder::new()
            .name("procnet-signal".to_owned())
            .spawn(|| {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!("Can not watch for ctrl-c: {}", e);
                        return;
                    }
                };
                loop {
                    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
                        log::error!("Can not watch for ctrl-c: {}", e);
                        return;
                    }
                    log::info!("Interrupted, stopping local processes");
                    interrupt();
                }
            });
        if let Err(e) = spawned {
            log::error!("Can not start ctrl-c watcher: {}", e);
        }
    });
}

////////////////////////////////////////////////////////////////////////////////

/// Turns the current OS process into a process container if it was
/// launched as a child, never returning in that case.
///
/// Must be called at the start of `main` of programs creating
/// processes with [`ProcImpl::Process`].
pub fn init(classes: ClassRegistry) {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    crate::logging::enable_console_log();
    let code = run_child(classes);
    std::process::exit(code);
}

fn run_child(classes: ClassRegistry) -> i32 {
    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        log::error!("Can not read spawn handoff: {}", e);
        return EXIT_UNEXPECTED;
    }
    let handoff: SpawnHandoff = match serde_json::from_str(&line) {
        Ok(handoff) => handoff,
        Err(e) => {
            log::error!("Malformed spawn handoff: {}", e);
            return EXIT_UNEXPECTED;
        }
    };

    let runtime = Runtime::new(handoff.config, classes);
    runtime.set_node_id(handoff.node);
    let tm = match transport::from_handoff(&handoff.transport) {
        Ok(tm) => tm,
        Err(e) => {
            log::error!("{}: {}", handoff.pid, e);
            return EXIT_ROUTING;
        }
    };
    if let Err(e) = tm.initialize() {
        log::error!("{}: can not rebind transports: {}", handoff.pid, e);
        return EXIT_ROUTING;
    }
    if tm.transport_addresses() != handoff.pid.transports() {
        log::error!("{}: transports were rebound on other ports", handoff.pid);
        tm.close();
        return EXIT_ROUTING;
    }
    println!("{}", CHILD_READY);
    let _ = io::stdout().flush();

    let router = Router::new(runtime.clone(), tm.clone());
    watch_interrupts(&router);
    let container = ProcessContainer {
        runtime: runtime.clone(),
        router: router.clone(),
        pid: handoff.pid,
        parent: Some(handoff.parent),
        seqno: Some(handoff.seqno),
        props: handoff.props,
        replay: None,
        node_args: None,
    };
    let code = container.run();
    shutdown(&runtime, &router, tm.as_ref());
    code
}

/// Waits for non-daemon children, then ends the rest and unbinds transports.
fn shutdown(runtime: &Runtime, router: &Router, tm: &dyn TransportManager) {
    runtime.reap_children();
    router.stop();
    tm.close();
}

/// Runs the node process of class `main_class` named `node_name`
/// with setup arguments `args`, returning its exit code.
///
/// Joins the configured peer first and fails with the routing exit code
/// if it is unreachable. Waits for non-daemon children before returning.
pub fn run_node(runtime: Arc<Runtime>, main_class: &str, node_name: &str, args: Vec<Value>) -> i32 {
    let tm = transport::create_manager(runtime.config(), runtime.cookie());
    if let Err(e) = tm.initialize() {
        log::error!("Can not initialize transports: {}", e);
        return EXIT_ROUTING;
    }
    let node = ProcessId::create(
        main_class,
        tm.host(),
        tm.transport_addresses(),
        node_name,
        node_name,
    );
    runtime.set_node_id(node.clone());
    let router = Router::new(runtime.clone(), tm.clone());
    watch_interrupts(&router);

    if let Some(peer) = runtime.config().peer_address() {
        let timeout = Duration::from_secs_f64(runtime.config().bootstrap_timeout);
        let joined = peer.and_then(|(host, port)| {
            router
                .bootstrap_node(&host, port, timeout)
                .map_err(|e| e.to_string())
        });
        if let Err(e) = joined {
            log::error!("{}: can not join peer: {}", node, e);
            tm.close();
            return EXIT_ROUTING;
        }
    }

    let container = ProcessContainer {
        runtime: runtime.clone(),
        router: router.clone(),
        pid: node,
        parent: None,
        seqno: None,
        props: FaultProps::default(),
        replay: None,
        node_args: Some(args),
    };
    let code = container.run();
    shutdown(&runtime, &router, tm.as_ref());
    code
}

/// Replays the process recorded in the receive trace `path`.
///
/// Node processes are replayed with `node_args` as their setup arguments.
pub fn replay_trace(runtime: Arc<Runtime>, path: &Path, node_args: Vec<Value>) -> i32 {
    let replay = match ReplayMailbox::open(path, runtime.codec()) {
        Ok(replay) => Arc::new(replay),
        Err(e) => {
            log::error!("Can not open trace {}: {}", path.display(), e);
            return EXIT_TRACE;
        }
    };
    let pid = replay.pid().clone();
    if !runtime.classes().contains(pid.class()) {
        log::error!(
            "Class {} of {} is not registered, consider class substitution",
            pid.class(),
            pid
        );
        return EXIT_TRACE;
    }
    let parent = replay.parent().cloned();

    // Private transports: replayed sends never leave the process.
    let mut config = runtime.config().clone();
    config.transport = TransportKind::Memory;
    config.hostname = format!("replay-{}", pid.filename_form());
    config.port = None;
    let tm = transport::create_manager(&config, runtime.cookie());
    if let Err(e) = tm.initialize() {
        log::error!("Can not initialize replay transports: {}", e);
        return EXIT_ROUTING;
    }
    if parent.is_none() {
        runtime.set_node_id(pid.clone());
    }
    let router = Router::new(runtime.clone(), tm.clone());

    log::info!("Replaying {} from {}", pid, path.display());
    let container = ProcessContainer {
        runtime: runtime.clone(),
        router: router.clone(),
        seqno: parent.as_ref().map(|_| 0),
        node_args: parent.is_none().then_some(node_args),
        pid,
        parent,
        props: FaultProps::default(),
        replay: Some(replay),
    };
    let code = container.run();
    router.stop();
    tm.close();
    code
}
