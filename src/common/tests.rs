use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::command::{Body, Command, Packet};
use super::pid::{check_name, parse_name, NameRegistry, PendingResolve, ProcessId};
use super::queue::{LiveMailbox, Mailbox, WaitableQueue};
use crate::error::ProcessError;

fn pid(name: &str, node: &str) -> ProcessId {
    ProcessId::create("Worker", "127.0.0.1", vec![10001], name, node)
}

#[test]
fn process_id_display() {
    let named = pid("alice", "n1");
    assert_eq!(named.to_string(), "<Worker:alice>");

    let anonymous = pid("", "n1");
    let display = anonymous.to_string();
    assert!(display.starts_with("<Worker:"));
    assert_eq!(display.len(), "<Worker:>".len() + 5);
}

#[test]
fn process_ids_are_unique() {
    let first = pid("alice", "n1");
    let second = pid("alice", "n1");
    assert_ne!(first, second);
    assert_eq!(first.key(), second.key());
}

#[test]
fn filename_form_is_sanitized() {
    let p = ProcessId::create("my.Class", "h", vec![1], "a-b", "n");
    let form = p.filename_form();
    assert!(form.starts_with("my_Class_a-b_"));
    assert!(form.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
}

#[test]
fn name_grammar() {
    let parsed = parse_name("bob").unwrap();
    assert_eq!(parsed.name, "bob");
    assert_eq!(parsed.node, "");
    assert_eq!(parsed.host, None);

    let parsed = parse_name("bob@node1:host-a:1234").unwrap();
    assert_eq!(parsed.name, "bob");
    assert_eq!(parsed.node, "node1");
    assert_eq!(parsed.host.as_deref(), Some("host-a"));
    assert_eq!(parsed.port, Some(1234));

    let parsed = parse_name("bob@node1:host-a").unwrap();
    assert_eq!(parsed.port, None);

    assert!(parse_name("").is_err());
    assert!(parse_name("@node").is_err());
    assert!(parse_name("bob::1").is_err());
    assert!(parse_name("bob:host:port").is_err());
}

#[test]
fn illegal_names() {
    assert!(check_name("worker_1"));
    assert!(!check_name(""));
    assert!(!check_name("a b"));
    assert!(!check_name("a/b"));
    assert!(!check_name("a@b"));
    assert!(!check_name("a:b"));
}

#[test]
fn registry_callbacks_fire_once() {
    let registry = NameRegistry::default();
    let asker = pid("asker", "n1");
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let found = registry.lookup_or_register_callback(
        "bob",
        "n1",
        PendingResolve::new(
            asker.clone(),
            1,
            None,
            Box::new(move |p| {
                assert_eq!(p.name(), "bob");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ),
    );
    assert!(found.is_none());
    assert_eq!(registry.pending_callbacks(), 1);

    let bob = pid("bob", "n1");
    registry.register(&bob);
    registry.register(&bob);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(registry.pending_callbacks(), 0);
    assert_eq!(registry.lookup("bob", "n1"), Some(bob.clone()));

    let found = registry.lookup_or_register_callback(
        "bob",
        "n1",
        PendingResolve::new(asker, 2, None, Box::new(|_| unreachable!())),
    );
    assert_eq!(found, Some(bob));
    assert_eq!(registry.pending_callbacks(), 0);
}

#[test]
fn cancelled_resolve_never_fires() {
    let registry = NameRegistry::default();
    let asker = pid("asker", "n1");
    let other = pid("other", "n1");
    let fired = Arc::new(AtomicUsize::new(0));

    for (requester, seqno) in [(&asker, 1), (&asker, 2), (&other, 1)] {
        let counter = fired.clone();
        registry.lookup_or_register_callback(
            "late",
            "n1",
            PendingResolve::new(
                requester.clone(),
                seqno,
                None,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            ),
        );
    }
    assert_eq!(registry.pending_callbacks(), 3);

    assert!(registry.cancel_callback(&asker, 1));
    assert!(!registry.cancel_callback(&asker, 1));
    assert!(registry.cancel_callback(&other, 1));
    assert_eq!(registry.pending_callbacks(), 1);

    registry.register(&pid("late", "n1"));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(registry.pending_callbacks(), 0);
}

#[test]
fn expired_resolve_is_dropped() {
    let registry = NameRegistry::default();
    let asker = pid("asker", "n1");
    let past = Instant::now();
    thread::sleep(Duration::from_millis(5));

    registry.lookup_or_register_callback(
        "ghost",
        "n1",
        PendingResolve::new(asker.clone(), 1, Some(past), Box::new(|_| unreachable!())),
    );
    assert_eq!(registry.pending_callbacks(), 1);

    // Registering another request sweeps the expired one.
    registry.lookup_or_register_callback(
        "phantom",
        "n1",
        PendingResolve::new(
            asker,
            2,
            Some(Instant::now() + Duration::from_secs(60)),
            Box::new(|_| {}),
        ),
    );
    assert_eq!(registry.pending_callbacks(), 1);
    registry.register(&pid("ghost", "n1"));
}

#[test]
fn registry_drop_node() {
    let registry = NameRegistry::default();
    registry.register_all(&[pid("a", "n1"), pid("b", "n1"), pid("c", "n2"), pid("", "n1")]);
    assert_eq!(registry.all_named().len(), 3);

    registry.drop_node("n1");
    let left = registry.all_named();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].name(), "c");

    registry.drop_entry(&left[0]);
    assert!(registry.all_named().is_empty());
}

#[test]
fn command_tags_are_stable() {
    assert_eq!(Command::Start.tag(), 1);
    assert_eq!(Command::Message.tag(), 20);
    assert_eq!(Command::Recover.tag(), 35);
    assert!(Command::COUNT > Command::Recover.index());
    assert_eq!(Command::try_from(31).unwrap(), Command::RPCReply);
    assert!(Command::try_from(4).is_err());
}

#[test]
fn queue_is_fifo() {
    let queue = WaitableQueue::new();
    for i in 0..10 {
        queue.push(i);
    }
    let popped: Vec<i32> = (0..10).filter_map(|_| queue.pop(false, None)).collect();
    assert_eq!(popped, (0..10).collect::<Vec<_>>());
    assert_eq!(queue.pop(false, None), None);
}

#[test]
fn queue_pop_timeout() {
    let queue: WaitableQueue<u8> = WaitableQueue::new();
    let start = Instant::now();
    assert_eq!(queue.pop(true, Some(Duration::from_millis(50))), None);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn queue_wakes_blocked_reader() {
    let queue = Arc::new(WaitableQueue::new());
    let reader = {
        let queue = queue.clone();
        thread::spawn(move || queue.pop(true, None))
    };
    thread::sleep(Duration::from_millis(20));
    queue.push(42);
    assert_eq!(reader.join().unwrap(), Some(42));
}

#[test]
fn closed_mailbox_interrupts_reader() {
    let mailbox = LiveMailbox::new();
    let src = pid("a", "n1");
    mailbox.push(src.clone(), Packet::new(Command::End, Body::End { code: 0 }));
    mailbox.close();
    mailbox.push(src, Packet::new(Command::End, Body::End { code: 1 }));

    let (_, packet) = mailbox.pop(true, None).unwrap().unwrap();
    assert_eq!(packet.body, Body::End { code: 0 });
    assert!(matches!(
        mailbox.pop(true, None),
        Err(ProcessError::Interrupted)
    ));
}
