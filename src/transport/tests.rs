use std::time::Duration;

use super::memory::MemoryTransportManager;
use super::tcp::TcpTransportManager;
use super::{ChannelCaps, TransportManager};
use crate::config::TransportKind;
use crate::error::TransportError;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[test]
fn channel_caps() {
    let caps = ChannelCaps::BROADCAST | ChannelCaps::RELIABLEFIFO;
    assert!(caps.contains(ChannelCaps::BROADCAST));
    assert!(caps.contains(ChannelCaps::NONE));
    assert!(!caps.contains(ChannelCaps::INTERHOST));
    assert!(!caps.contains(ChannelCaps::INTERHOST | ChannelCaps::BROADCAST));
    assert_eq!(caps & ChannelCaps::RELIABLEFIFO, ChannelCaps::RELIABLEFIFO);
    assert_eq!(ChannelCaps::from_name("FIFO"), Some(ChannelCaps::RELIABLEFIFO));
    assert_eq!(ChannelCaps::from_name("carrier-pigeon"), None);
}

#[test]
fn memory_transport_delivers_in_order() {
    let first = MemoryTransportManager::new("memory-order.test", None, (100, 200), "secret");
    let second = MemoryTransportManager::new("memory-order.test", None, (100, 200), "secret");
    first.initialize().unwrap();
    second.initialize().unwrap();

    let target = second.transport_addresses()[0];
    assert_ne!(first.transport_addresses()[0], target);

    let (_, transport) = first.get_transport(ChannelCaps::RELIABLEFIFO).unwrap();
    for i in 0..20u8 {
        transport.send(&[i], "memory-order.test", target).unwrap();
    }
    let queue = second.queue();
    let received: Vec<u8> = (0..20).map(|_| queue.pop(true, WAIT).unwrap().data[0]).collect();
    assert_eq!(received, (0..20).collect::<Vec<_>>());

    first.close();
    second.close();
}

#[test]
fn memory_transport_errors() {
    let first = MemoryTransportManager::new("memory-errors.test", Some(7), (0, 0), "secret");
    let second = MemoryTransportManager::new("memory-errors.test", Some(8), (0, 0), "other");
    let clash = MemoryTransportManager::new("memory-errors.test", Some(7), (0, 0), "secret");
    first.initialize().unwrap();
    second.initialize().unwrap();
    assert!(clash.initialize().is_err());

    assert!(first.get_transport(ChannelCaps::INTERHOST).is_none());
    let (_, transport) = first.get_transport(ChannelCaps::NONE).unwrap();
    assert!(matches!(
        transport.send(b"x", "memory-errors.test", 8),
        Err(TransportError::Authentication { .. })
    ));
    assert!(matches!(
        transport.send(b"x", "memory-errors.test", 9),
        Err(TransportError::Unreachable { .. })
    ));
    assert!(matches!(
        first.handoff(),
        Err(TransportError::NotTransferable(_))
    ));

    second.close();
    assert!(matches!(
        transport.send(b"x", "memory-errors.test", 8),
        Err(TransportError::Unreachable { .. })
    ));
    first.close();
}

#[test]
fn tcp_transport_delivers_in_order() {
    let first = TcpTransportManager::new("127.0.0.1", None, (41000, 41500), "secret");
    let second = TcpTransportManager::new("127.0.0.1", None, (41000, 41500), "secret");
    first.initialize().unwrap();
    second.initialize().unwrap();

    let target = second.transport_addresses()[0];
    let (index, transport) = first.get_transport(ChannelCaps::INTERHOST).unwrap();
    assert_eq!(index, 0);
    for i in 0..50u32 {
        transport.send(&i.to_be_bytes(), "127.0.0.1", target).unwrap();
    }

    let queue = second.queue();
    for i in 0..50u32 {
        let chunk = queue.pop(true, WAIT).unwrap();
        assert_eq!(chunk.data, i.to_be_bytes());
    }

    first.close();
    second.close();
}

#[test]
fn tcp_transport_rejects_wrong_cookie() {
    let first = TcpTransportManager::new("127.0.0.1", None, (41500, 42000), "secret");
    let second = TcpTransportManager::new("127.0.0.1", None, (41500, 42000), "other");
    first.initialize().unwrap();
    second.initialize().unwrap();

    let target = second.transport_addresses()[0];
    let (_, transport) = first.get_transport(ChannelCaps::NONE).unwrap();
    assert!(matches!(
        transport.send(b"hello", "127.0.0.1", target),
        Err(TransportError::Authentication { .. })
    ));
    assert!(second.queue().pop(true, Some(Duration::from_millis(100))).is_none());

    first.close();
    second.close();
    assert!(matches!(
        transport.send(b"hello", "127.0.0.1", target),
        Err(TransportError::NotInitialized)
    ));
}

#[test]
fn tcp_handoff_rebinds_port() {
    let parent = TcpTransportManager::new("127.0.0.1", None, (42000, 42500), "secret");
    parent.initialize().unwrap();
    let handoff = parent.handoff().unwrap();
    assert_eq!(handoff.kind, TransportKind::Tcp);
    assert_eq!(handoff.ports, parent.transport_addresses());
    parent.close();

    let child = super::from_handoff(&handoff).unwrap();
    child.initialize().unwrap();
    assert_eq!(child.transport_addresses(), handoff.ports);
    assert_eq!(child.cookie(), "secret");
    child.close();
}

#[test]
fn tcp_handoff_fails_when_port_is_taken() {
    let parent = TcpTransportManager::new("127.0.0.1", None, (42500, 43000), "secret");
    parent.initialize().unwrap();
    let handoff = parent.handoff().unwrap();
    parent.close();

    let intruder = TcpTransportManager::new("127.0.0.1", Some(handoff.ports[0]), (0, 0), "other");
    intruder.initialize().unwrap();

    let child = super::from_handoff(&handoff).unwrap();
    assert!(child.initialize().is_err());
    assert!(child.transport_addresses().is_empty());
    intruder.close();
}
