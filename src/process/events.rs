//! Synchronization on acknowledgements.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::command::{AckValue, Command};
use crate::common::pid::ProcessId;

enum Slot {
    /// Acknowledgements received before anybody waits for them.
    Pending(Vec<(ProcessId, AckValue)>),
    /// Someone waits for acknowledgements of `remaining` processes.
    Syncing {
        remaining: HashSet<ProcessId>,
        results: HashMap<ProcessId, AckValue>,
    },
}

/// Table of outstanding request/acknowledgement exchanges,
/// keyed by the acknowledgement command and request sequence number.
#[derive(Default)]
pub(crate) struct AsyncEvents {
    table: Mutex<HashMap<(Command, u64), Slot>>,
}

impl AsyncEvents {
    pub fn register(&self, command: Command, seqno: u64) {
        self.table
            .lock()
            .insert((command, seqno), Slot::Pending(Vec::new()));
    }

    pub fn deregister(&self, command: Command, seqno: u64) {
        self.table.lock().remove(&(command, seqno));
    }

    #[cfg(test)]
    pub fn is_registered(&self, command: Command, seqno: u64) -> bool {
        self.table.lock().contains_key(&(command, seqno))
    }

    /// Checks if some event uses the sequence number.
    pub fn uses_seqno(&self, seqno: u64) -> bool {
        self.table.lock().keys().any(|(_, s)| *s == seqno)
    }

    /// Stores acknowledgement. Returns `false` if the event is unknown.
    pub fn ack(&self, command: Command, seqno: u64, src: ProcessId, value: AckValue) -> bool {
        match self.table.lock().get_mut(&(command, seqno)) {
            Some(Slot::Pending(acks)) => {
                acks.push((src, value));
                true
            }
            Some(Slot::Syncing { remaining, results }) => {
                remaining.remove(&src);
                results.insert(src, value);
                true
            }
            None => false,
        }
    }

    /// Starts waiting for acknowledgements of `srcs`,
    /// folding in those which already arrived.
    pub fn begin_sync(&self, command: Command, seqno: u64, srcs: &[ProcessId]) -> bool {
        let mut table = self.table.lock();
        let Some(slot) = table.get_mut(&(command, seqno)) else {
            return false;
        };
        if let Slot::Pending(acks) = slot {
            let results: HashMap<ProcessId, AckValue> = std::mem::take(acks).into_iter().collect();
            let remaining = srcs
                .iter()
                .filter(|src| !results.contains_key(*src))
                .cloned()
                .collect();
            *slot = Slot::Syncing { remaining, results };
        }
        true
    }

    pub fn is_complete(&self, command: Command, seqno: u64) -> bool {
        match self.table.lock().get(&(command, seqno)) {
            Some(Slot::Syncing { remaining, .. }) => remaining.is_empty(),
            Some(Slot::Pending(_)) => false,
            None => true,
        }
    }

    /// Removes the event and returns collected acknowledgements.
    pub fn finish(&self, command: Command, seqno: u64) -> HashMap<ProcessId, AckValue> {
        match self.table.lock().remove(&(command, seqno)) {
            Some(Slot::Syncing { results, .. }) => results,
            Some(Slot::Pending(acks)) => acks.into_iter().collect(),
            None => HashMap::new(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Counter is reset once it passes this value.
pub(crate) const SEQNO_RESET_THRESHOLD: u64 = 0xFFFF_FFF0;

/// Sequence number reserved for waits nobody answers.
pub(crate) const HANG_SEQNO: u64 = u64::MAX;

/// Source of request sequence numbers.
pub(crate) struct SeqCounter {
    next: AtomicU64,
}

impl SeqCounter {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Next sequence number for which `in_use` is false.
    pub fn next(&self, in_use: impl Fn(u64) -> bool) -> u64 {
        loop {
            let seqno = self.next.fetch_add(1, Ordering::SeqCst);
            if seqno > SEQNO_RESET_THRESHOLD {
                // Only the thread which observed the overflow resets.
                let _ = self
                    .next
                    .compare_exchange(seqno + 1, 0, Ordering::SeqCst, Ordering::SeqCst);
            }
            if !in_use(seqno) {
                return seqno;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::{AsyncEvents, SeqCounter, SEQNO_RESET_THRESHOLD};
    use crate::common::command::{AckValue, Command};
    use crate::common::pid::ProcessId;

    fn pids(count: usize) -> Vec<ProcessId> {
        (0..count)
            .map(|i| ProcessId::create("Child", "h", vec![1], &format!("c{}", i), "n"))
            .collect()
    }

    #[test]
    fn acks_before_and_after_sync() {
        let events = AsyncEvents::default();
        let children = pids(3);
        events.register(Command::NewAck, 1);

        assert!(events.ack(Command::NewAck, 1, children[0].clone(), AckValue::Unit));
        assert!(events.begin_sync(Command::NewAck, 1, &children));
        assert!(!events.is_complete(Command::NewAck, 1));

        events.ack(Command::NewAck, 1, children[1].clone(), AckValue::Unit);
        events.ack(Command::NewAck, 1, children[2].clone(), AckValue::Flag(true));
        assert!(events.is_complete(Command::NewAck, 1));

        let results = events.finish(Command::NewAck, 1);
        assert_eq!(results.len(), 3);
        assert_eq!(results[&children[2]], AckValue::Flag(true));
        assert!(!events.is_registered(Command::NewAck, 1));
    }

    #[test]
    fn unknown_events_are_ignored() {
        let events = AsyncEvents::default();
        let children = pids(1);
        assert!(!events.ack(Command::StartAck, 5, children[0].clone(), AckValue::Unit));
        assert!(!events.begin_sync(Command::StartAck, 5, &children));
        assert!(events.is_complete(Command::StartAck, 5));
    }

    #[test]
    fn empty_sync_completes_immediately() {
        let events = AsyncEvents::default();
        events.register(Command::SetupAck, 2);
        assert!(events.begin_sync(Command::SetupAck, 2, &[]));
        assert!(events.is_complete(Command::SetupAck, 2));
    }

    #[test]
    fn seqno_reset_skips_used_numbers() {
        let counter = SeqCounter::new(SEQNO_RESET_THRESHOLD);
        assert_eq!(counter.next(|_| false), SEQNO_RESET_THRESHOLD);
        assert_eq!(counter.next(|_| false), SEQNO_RESET_THRESHOLD + 1);

        let used: HashSet<u64> = [0, 1].into_iter().collect();
        assert_eq!(counter.next(|s| used.contains(&s)), 2);
        assert_eq!(counter.next(|s| used.contains(&s)), 3);
    }

    proptest! {
        #[test]
        fn merge_does_not_depend_on_arrival_order(
            before in proptest::collection::vec(any::<bool>(), 1..12),
            values in proptest::collection::vec(any::<bool>(), 12),
        ) {
            // before[i] tells whether the i-th ack arrives before sync starts.
            let children = pids(before.len());
            let events = AsyncEvents::default();
            events.register(Command::SetupAck, 9);

            for (i, child) in children.iter().enumerate() {
                if before[i] {
                    events.ack(Command::SetupAck, 9, child.clone(), AckValue::Flag(values[i]));
                }
            }
            prop_assert!(events.begin_sync(Command::SetupAck, 9, &children));
            for (i, child) in children.iter().enumerate() {
                if !before[i] {
                    prop_assert!(!events.is_complete(Command::SetupAck, 9));
                    events.ack(Command::SetupAck, 9, child.clone(), AckValue::Flag(values[i]));
                }
            }
            prop_assert!(events.is_complete(Command::SetupAck, 9));

            let results = events.finish(Command::SetupAck, 9);
            prop_assert_eq!(results.len(), children.len());
            for (i, child) in children.iter().enumerate() {
                prop_assert_eq!(&results[child], &AckValue::Flag(values[i]));
            }
        }
    }
}
