//! Ping-pong between two processes created by one node.
//!
//! Usage: `ping-pong [<config.json>] [<rounds>]`. With
//! `"default_proc_impl": "process"` and `"transport": "tcp"` in the config
//! the players run as separate OS processes.

use std::time::Duration;

use procnet::{
    Algorithm, Bindings, ClassRegistry, DistProcess, EventBinding, Handler, Message, NewSpec,
    ProcessId, ProcessResult, Runtime, RuntimeConfig, TipPattern,
};
use serde_json::{json, Value};

fn sender(bindings: &Bindings) -> Result<ProcessId, String> {
    let from = bindings.get("from").ok_or("no sender")?;
    serde_json::from_value(from.clone()).map_err(|e| e.to_string())
}

////////////////////////////////////////////////////////////////////////////////

/// Answers every ping until told to stop.
#[derive(Clone)]
struct Ponger;

impl Algorithm for Ponger {
    fn setup(&mut self, ctx: &mut DistProcess, _args: &[Value]) -> Result<(), String> {
        ctx.state_mut().declare("stopped", false)
    }

    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        ctx.wait_until("serve", None, |p| p.state().get::<bool>("stopped") == Some(true))?;
        ctx.output("ponger done");
        Ok(())
    }

    fn events(&self) -> Vec<EventBinding> {
        vec![
            EventBinding::new(TipPattern::received("Ping")).handler(Handler::new(
                "pong",
                |p, b| {
                    let round = b.get("msg").and_then(Value::as_u64).ok_or("bad ping")?;
                    p.send(Message::new("Pong", &round)?, &sender(b)?)?;
                    Ok(())
                },
            )),
            EventBinding::new(TipPattern::received("Stop")).handler(Handler::new(
                "stop",
                |p, _| {
                    p.state_mut().set("stopped", true)?;
                    Ok(())
                },
            )),
        ]
    }
}

/// Sends numbered pings to `ponger` and waits for each pong.
#[derive(Clone, Default)]
struct Pinger {
    rounds: u64,
}

impl Algorithm for Pinger {
    fn setup(&mut self, ctx: &mut DistProcess, args: &[Value]) -> Result<(), String> {
        self.rounds = args.first().and_then(Value::as_u64).ok_or("expected rounds")?;
        ctx.state_mut().declare("last", 0u64)
    }

    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        let ponger = ctx.resolve("ponger")?.ok_or("ponger is not known")?;
        for round in 1..=self.rounds {
            ctx.send(Message::new("Ping", &round)?, &ponger)?;
            let answered = ctx.wait_until("ping", Some(Duration::from_secs(5)), move |p| {
                p.state().get::<u64>("last") == Some(round)
            })?;
            if !answered {
                ctx.error(format!("no pong for round {}", round));
                return ctx.exit(1);
            }
        }
        ctx.send(Message::new("Stop", &())?, &ponger)?;
        ctx.output(format!("{} rounds done", self.rounds));
        Ok(())
    }

    fn events(&self) -> Vec<EventBinding> {
        vec![EventBinding::new(TipPattern::received("Pong")).handler(Handler::new(
            "pong",
            |p, b| {
                let round = b.get("msg").and_then(Value::as_u64).ok_or("bad pong")?;
                p.state_mut().set("last", round)?;
                Ok(())
            },
        ))]
    }
}

/// Creates both players and starts them.
#[derive(Clone, Default)]
struct Main {
    rounds: u64,
}

impl Algorithm for Main {
    fn setup(&mut self, _ctx: &mut DistProcess, args: &[Value]) -> Result<(), String> {
        self.rounds = args.first().and_then(Value::as_u64).unwrap_or(10);
        Ok(())
    }

    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        let rounds = json!(self.rounds);
        let ponger = ctx.new_processes("Ponger", NewSpec::default().names(["ponger"]).args(vec![]))?;
        let pinger = ctx.new_processes("Pinger", NewSpec::default().args(vec![rounds]))?;
        ctx.start(&ponger)?;
        ctx.start(&pinger)?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////

fn main() {
    let classes = ClassRegistry::new()
        .with("Main", Main::default())
        .with("Pinger", Pinger::default())
        .with("Ponger", Ponger);
    procnet::init(classes.clone());
    procnet::logging::enable_console_log();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => match RuntimeConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => RuntimeConfig::default(),
    };
    let rounds = args.get(2).and_then(|r| r.parse::<u64>().ok()).unwrap_or(10);

    let runtime = Runtime::new(config, classes);
    let code = procnet::run_node(runtime, "Main", "main", vec![json!(rounds)]);
    std::process::exit(code);
}
