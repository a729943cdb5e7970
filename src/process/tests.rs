use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::dispatch::CommandTable;
use super::pattern::{EventBinding, Handler, TipPattern};
use super::{Algorithm, DistProcess, NewSpec, Target, Targets};
use crate::common::command::Command;
use crate::common::pid::ProcessId;
use crate::config::{ClockKind, RuntimeConfig};
use crate::container::run_node;
use crate::error::ProcessResult;
use crate::runtime::{ClassRegistry, Runtime};

type Script = Arc<dyn Fn(&mut DistProcess) -> ProcessResult<()> + Send + Sync>;

/// Algorithm running a closure, with optional bindings and class config.
#[derive(Clone)]
struct Scripted {
    script: Script,
    bindings: Vec<EventBinding>,
    config: BTreeMap<String, Value>,
}

impl Scripted {
    fn new<F>(script: F) -> Self
    where
        F: Fn(&mut DistProcess) -> ProcessResult<()> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            bindings: Vec::new(),
            config: BTreeMap::new(),
        }
    }

    fn binding(mut self, binding: EventBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    fn config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_owned(), value);
        self
    }
}

impl Algorithm for Scripted {
    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        (self.script)(ctx)
    }

    fn events(&self) -> Vec<EventBinding> {
        self.bindings.clone()
    }

    fn config(&self) -> BTreeMap<String, Value> {
        self.config.clone()
    }
}

fn run_main(host: &str, main: Scripted, tweak: impl FnOnce(&mut RuntimeConfig)) -> i32 {
    let mut config = RuntimeConfig {
        hostname: host.to_owned(),
        resolve_timeout: 0.3,
        seed: Some(7),
        ..Default::default()
    };
    tweak(&mut config);
    let runtime = Runtime::new(config, ClassRegistry::new().with("Main", main));
    run_node(runtime, "Main", "main", vec![])
}

fn counting_binding(tip: &str, counter: Arc<Mutex<usize>>, labels: Option<&[&str]>) -> EventBinding {
    let mut handler = Handler::new("count", move |_, _| {
        *counter.lock() += 1;
        Ok(())
    });
    if let Some(labels) = labels {
        handler = handler.at_labels(labels.iter().copied());
    }
    EventBinding::new(TipPattern::received(tip)).handler(handler)
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn node_table_has_node_commands() {
    let regular = CommandTable::build(false);
    let node = CommandTable::build(true);
    for command in [Command::Resolve, Command::NodeJoin, Command::NodeAck] {
        assert!(regular.get(command).is_none());
        assert!(node.get(command).is_some());
    }
    for command in [Command::Start, Command::Message, Command::NewAck, Command::RPCReply] {
        assert!(regular.get(command).is_some());
        assert!(node.get(command).is_some());
    }
}

#[test]
fn new_spec_child_names() {
    assert_eq!(NewSpec::default().child_names(), vec![String::new()]);
    assert_eq!(NewSpec::default().count(3).child_names().len(), 3);
    assert_eq!(
        NewSpec::default().count(5).names(["a", "b"]).child_names(),
        vec!["a".to_owned(), "b".to_owned()]
    );
}

#[test]
fn targets_from_ids_and_names() {
    let pid = ProcessId::create("P", "h", vec![1], "p", "n");
    let targets: Targets = vec![pid.clone(), pid.clone()].into();
    assert_eq!(targets.iter().count(), 2);
    let targets: Targets = "alice@n1".into();
    assert_eq!(
        targets.iter().next(),
        Some(&Target::Name("alice@n1".to_owned()))
    );
}

#[test]
fn unmatched_jobs_are_dropped() {
    let counter = Arc::new(Mutex::new(0));
    let main = Scripted::new(|ctx| {
        let me = ctx.id().clone();
        ctx.send("tick", &me)?;
        ctx.label("other")?;
        ctx.label("work")
    })
    .binding(counting_binding("info", counter.clone(), Some(&["work"])));

    assert_eq!(run_main("engine-drop", main, |_| {}), 0);
    assert_eq!(*counter.lock(), 0);
}

#[test]
fn unmatched_jobs_are_kept() {
    let counter = Arc::new(Mutex::new(0));
    let main = Scripted::new(|ctx| {
        let me = ctx.id().clone();
        ctx.send("tick", &me)?;
        ctx.label("other")?;
        ctx.label("work")
    })
    .binding(counting_binding("info", counter.clone(), Some(&["work"])))
    .config("unmatched", json!("keep"));

    assert_eq!(run_main("engine-keep", main, |_| {}), 0);
    assert_eq!(*counter.lock(), 1);
}

#[test]
fn one_handler_per_label() {
    let counter = Arc::new(Mutex::new(0));
    let seen = counter.clone();
    let main = Scripted::new(move |ctx| {
        let me = ctx.id().clone();
        for _ in 0..3 {
            ctx.send("tick", &me)?;
        }
        // Sends are delivered locally, so the jobs wait for labels.
        ctx.label("a")?;
        let after_one = *seen.lock();
        ctx.label("b")?;
        ctx.label("c")?;
        if after_one != 1 {
            return ctx.exit(7);
        }
        Ok(())
    })
    .binding(counting_binding("info", counter.clone(), None));

    assert_eq!(run_main("engine-one", main, |_| {}), 0);
    assert_eq!(*counter.lock(), 3);
}

#[test]
fn wait_until_times_out() {
    let outcome = Arc::new(Mutex::new(None));
    let result = outcome.clone();
    let main = Scripted::new(move |ctx| {
        let started = Instant::now();
        let reached = ctx.wait_until("never", Some(Duration::from_millis(200)), |_| false)?;
        *result.lock() = Some((reached, ctx.timer_expired(), started.elapsed()));
        Ok(())
    });

    assert_eq!(run_main("engine-timeout", main, |_| {}), 0);
    let (reached, expired, elapsed) = outcome.lock().take().unwrap();
    assert!(!reached);
    assert!(expired);
    assert!(elapsed >= Duration::from_millis(200));
}

#[test]
fn resolve_local_and_unknown_names() {
    let outcome = Arc::new(Mutex::new(Vec::new()));
    let result = outcome.clone();
    let main = Scripted::new(move |ctx| {
        let me = ctx.resolve("main")?;
        let ghost = ctx.resolve("ghost")?;
        let malformed = ctx.resolve("not a name")?;
        result.lock().push(me == Some(ctx.id().clone()));
        result.lock().push(ghost.is_none());
        result.lock().push(malformed.is_none());
        Ok(())
    });

    assert_eq!(run_main("engine-resolve", main, |_| {}), 0);
    assert_eq!(*outcome.lock(), vec![true, true, true]);
}

#[test]
fn config_command_updates_process() {
    let clock = Arc::new(Mutex::new(None));
    let result = clock.clone();
    let main = Scripted::new(move |ctx| {
        let me = ctx.id().clone();
        ctx.configure(&me, "clock", &json!("lamport"))?;
        ctx.label("config")?;
        *result.lock() = Some(ctx.process_config().clock);
        Ok(())
    });

    assert_eq!(run_main("engine-config", main, |_| {}), 0);
    assert_eq!(*clock.lock(), Some(ClockKind::Lamport));
}

#[test]
fn backup_and_restore_state() {
    let dir = tempfile::tempdir().unwrap();
    let values = Arc::new(Mutex::new(Vec::new()));
    let result = values.clone();
    let main = Scripted::new(move |ctx| {
        let me = ctx.id().clone();
        ctx.state_mut().declare("count", 1)?;
        ctx.backup(&me, "t")?;
        ctx.label("backup")?;

        ctx.state_mut().set("count", 5)?;
        result.lock().push(ctx.state().get::<i32>("count"));
        ctx.restore(&me, "t", false)?;
        ctx.label("restore")?;
        result.lock().push(ctx.state().get::<i32>("count"));
        Ok(())
    })
    .config("enable_backup", json!(true));

    let backup_dir = dir.path().to_owned();
    let code = run_main("engine-backup", main, |config| config.backup_dir = backup_dir);
    assert_eq!(code, 0);
    assert_eq!(*values.lock(), vec![Some(5), Some(1)]);
}

#[test]
fn failed_run_exits_with_minus_one() {
    let main = Scripted::new(|_| Err("broken".into()));
    assert_eq!(run_main("engine-failed", main, |_| {}), -1);
}

#[test]
fn exit_code_is_propagated() {
    let main = Scripted::new(|ctx| ctx.exit(42));
    assert_eq!(run_main("engine-exit", main, |_| {}), 42);
}
