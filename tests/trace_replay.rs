use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use procnet::{
    replay_trace, run_node, Algorithm, ClassRegistry, DistProcess, EventBinding, Handler, Message,
    NewSpec, ProcessResult, Runtime, RuntimeConfig, TipPattern,
};

/// Remembers its setup argument and sends its square to the parent.
#[derive(Clone)]
struct Squarer {
    seen: Arc<Mutex<Vec<u64>>>,
    value: u64,
}

impl Algorithm for Squarer {
    fn setup(&mut self, _ctx: &mut DistProcess, args: &[Value]) -> Result<(), String> {
        self.value = args.first().and_then(Value::as_u64).ok_or("expected number")?;
        self.seen.lock().push(self.value);
        Ok(())
    }

    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        let parent = ctx.parent().cloned().ok_or("no parent")?;
        let sent = ctx.send(Message::new("Square", &(self.value * self.value))?, &parent)?;
        self.seen.lock().push(u64::from(sent));
        Ok(())
    }
}

#[derive(Clone)]
struct Main {
    squares: Arc<Mutex<Vec<u64>>>,
}

impl Algorithm for Main {
    fn setup(&mut self, ctx: &mut DistProcess, _args: &[Value]) -> Result<(), String> {
        ctx.state_mut().declare("got", false)
    }

    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        let child = ctx.new_processes("Squarer", NewSpec::default().args(vec![json!(7)]))?;
        ctx.start(&child)?;
        ctx.wait_until("square", Some(Duration::from_secs(5)), |p| {
            p.state().get::<bool>("got") == Some(true)
        })?;
        Ok(())
    }

    fn events(&self) -> Vec<EventBinding> {
        let squares = self.squares.clone();
        vec![EventBinding::new(TipPattern::received("Square")).handler(Handler::new(
            "square",
            move |p, b| {
                squares.lock().extend(b.get("msg").and_then(Value::as_u64));
                p.state_mut().set("got", true)?;
                Ok(())
            },
        ))]
    }
}

fn classes(seen: &Arc<Mutex<Vec<u64>>>, squares: &Arc<Mutex<Vec<u64>>>) -> ClassRegistry {
    ClassRegistry::new()
        .with(
            "Main",
            Main {
                squares: squares.clone(),
            },
        )
        .with(
            "Squarer",
            Squarer {
                seen: seen.clone(),
                value: 0,
            },
        )
}

fn find_trace(dir: &Path, class: &str) -> PathBuf {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            name.starts_with(class) && name.ends_with(".trace")
        })
        .unwrap()
}

fn config(host: &str, logdir: &Path, record: bool) -> RuntimeConfig {
    RuntimeConfig {
        hostname: host.to_owned(),
        logdir: logdir.to_owned(),
        record_trace: record,
        ..Default::default()
    }
}

#[test]
fn recorded_child_replays_identically() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let squares = Arc::new(Mutex::new(Vec::new()));
    let runtime = Runtime::new(
        config("trace-record", dir.path(), true),
        classes(&seen, &squares),
    );
    assert_eq!(run_node(runtime, "Main", "main", vec![]), 0);
    assert_eq!(*seen.lock(), vec![7, 1]);
    assert_eq!(*squares.lock(), vec![49]);

    let trace = find_trace(dir.path(), "Squarer");
    assert!(trace.with_extension("snd").exists());

    let replay_seen = Arc::new(Mutex::new(Vec::new()));
    let replay_squares = Arc::new(Mutex::new(Vec::new()));
    let runtime = Runtime::new(
        config("trace-replay", dir.path(), false),
        classes(&replay_seen, &replay_squares),
    );
    assert_eq!(replay_trace(runtime, &trace, vec![]), 0);
    assert_eq!(*replay_seen.lock(), vec![7, 1]);
    assert!(replay_squares.lock().is_empty());
}

#[test]
fn replay_needs_registered_class() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let squares = Arc::new(Mutex::new(Vec::new()));
    let runtime = Runtime::new(
        config("trace-class-record", dir.path(), true),
        classes(&seen, &squares),
    );
    assert_eq!(run_node(runtime, "Main", "main", vec![]), 0);
    let trace = find_trace(dir.path(), "Squarer");

    let only_main = ClassRegistry::new().with(
        "Main",
        Main {
            squares: squares.clone(),
        },
    );
    let runtime = Runtime::new(config("trace-class-replay", dir.path(), false), only_main);
    assert_eq!(replay_trace(runtime, &trace, vec![]), 3);
}

#[test]
fn replay_rejects_send_trace_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Squarer_x_1.snd");
    std::fs::write(&path, b"").unwrap();
    let runtime = Runtime::new(
        config("trace-bad-path", dir.path(), false),
        ClassRegistry::new(),
    );
    assert_eq!(replay_trace(runtime, &path, vec![]), 3);
}
