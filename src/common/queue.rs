//! Blocking queues used between the router and processes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::command::Packet;
use super::pid::ProcessId;
use crate::error::{ProcessError, ProcessResult, TraceError};
use crate::trace::{Recorder, SendRecord};

////////////////////////////////////////////////////////////////////////////////

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO queue with blocking pop.
pub struct WaitableQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> Default for WaitableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitableQueue<T> {
    /// Create empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Appends item and wakes up one waiter.
    /// Items pushed into closed queue are dropped.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        self.ready.notify_one();
        true
    }

    /// Pops the first item.
    ///
    /// If `block` is set, waits until an item arrives, the queue is closed
    /// or `timeout` elapses.
    pub fn pop(&self, block: bool, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if !block || state.closed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return state.items.pop_front();
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Checks if there are no queued items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue and wakes up all waiters. Queued items can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Checks if the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Inbound queue of a process together with its trace streams.
pub trait Mailbox: Send + Sync {
    /// Delivers packet to the process.
    fn push(&self, src: ProcessId, packet: Packet);

    /// Takes the next packet, see [`WaitableQueue::pop`].
    fn pop(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> ProcessResult<Option<(ProcessId, Packet)>>;

    /// Number of pending packets.
    fn len(&self) -> usize;

    /// Checks if there are no pending packets.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting packets.
    fn close(&self);

    /// Appends the result of an outbound operation to the send trace.
    fn record_send(&self, record: SendRecord) -> Result<(), TraceError>;

    /// Reads the next recorded result of an outbound operation.
    fn replay_send(&self) -> Result<SendRecord, TraceError>;
}

/// Mailbox of a live process, optionally recording traces.
pub struct LiveMailbox {
    queue: WaitableQueue<(ProcessId, Packet)>,
    recorder: Option<Recorder>,
}

impl LiveMailbox {
    /// Create mailbox without recording.
    pub fn new() -> Self {
        Self {
            queue: WaitableQueue::new(),
            recorder: None,
        }
    }

    /// Create mailbox which records every popped packet and every send.
    pub fn recording(recorder: Recorder) -> Self {
        Self {
            queue: WaitableQueue::new(),
            recorder: Some(recorder),
        }
    }
}

impl Default for LiveMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox for LiveMailbox {
    fn push(&self, src: ProcessId, packet: Packet) {
        if !self.queue.push((src, packet)) {
            log::debug!("Dropping packet for closed mailbox");
        }
    }

    fn pop(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> ProcessResult<Option<(ProcessId, Packet)>> {
        match self.queue.pop(block, timeout) {
            Some((src, packet)) => {
                if let Some(recorder) = &self.recorder {
                    recorder.record_receive(&src, &packet)?;
                }
                Ok(Some((src, packet)))
            }
            None if self.queue.is_closed() => Err(ProcessError::Interrupted),
            None => Ok(None),
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn close(&self) {
        self.queue.close();
    }

    fn record_send(&self, record: SendRecord) -> Result<(), TraceError> {
        match &self.recorder {
            Some(recorder) => recorder.record_send(&record),
            None => Ok(()),
        }
    }

    fn replay_send(&self) -> Result<SendRecord, TraceError> {
        Err(TraceError::Mismatch(
            "live mailbox has no send trace to replay".to_owned(),
        ))
    }
}
