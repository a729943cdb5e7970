use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use procnet::{
    interrupt, run_node, Algorithm, ClassRegistry, DistProcess, NewSpec, ProcessResult, Runtime,
    RuntimeConfig,
};

/// Waits for a message which never comes.
#[derive(Clone)]
struct Waiter {
    started: Arc<AtomicBool>,
}

impl Algorithm for Waiter {
    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        self.started.store(true, Ordering::SeqCst);
        ctx.wait_until("forever", None, |_| false)?;
        Ok(())
    }
}

#[derive(Clone)]
struct Main {
    children: Arc<Mutex<usize>>,
    started: Arc<AtomicBool>,
}

impl Algorithm for Main {
    fn run(&mut self, ctx: &mut DistProcess) -> ProcessResult<()> {
        let waiters = ctx.new_processes("Waiter", NewSpec::default().count(2).args(vec![]))?;
        *self.children.lock() = waiters.len();
        ctx.start(&waiters)?;
        self.started.store(true, Ordering::SeqCst);
        ctx.wait_until("forever", None, |_| false)?;
        Ok(())
    }
}

#[test]
fn ctrl_c_interrupts_blocked_processes() {
    let main = Main {
        children: Arc::default(),
        started: Arc::default(),
    };
    let waiter = Waiter {
        started: Arc::default(),
    };
    let classes = ClassRegistry::new()
        .with("Main", main.clone())
        .with("Waiter", waiter.clone());
    let config = RuntimeConfig {
        hostname: "interrupt-node".to_owned(),
        ..Default::default()
    };
    let runtime = Runtime::new(config, classes);

    let finished = Arc::new(AtomicBool::new(false));
    let interrupter = {
        let finished = finished.clone();
        let ready = main.started.clone();
        thread::spawn(move || {
            while !ready.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(20));
            }
            while !finished.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
                interrupt();
            }
        })
    };

    let start = Instant::now();
    let code = run_node(runtime, "Main", "main", vec![]);
    finished.store(true, Ordering::SeqCst);
    interrupter.join().unwrap();

    assert_eq!(code, 1);
    assert_eq!(*main.children.lock(), 2);
    assert!(waiter.started.load(Ordering::SeqCst));
    assert!(start.elapsed() < Duration::from_secs(10));
}
