//! Event bindings: patterns matched against sent and received messages,
//! and handlers scheduled when they match.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use procnet_message::Message;

use super::state::StateBag;
use super::DistProcess;
use crate::common::pid::ProcessId;
use crate::error::ProcessResult;

/// Kind of message event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Message sent by the process.
    Sent,
    /// Message received by the process.
    Received,
}

/// Message event as seen by patterns and stored in histories.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Kind of the event.
    pub kind: EventKind,
    /// Logical clock attached to the message.
    pub clock: Option<u64>,
    /// Sender.
    pub from: ProcessId,
    /// Receivers.
    pub to: Vec<ProcessId>,
    /// Message.
    pub message: Message,
}

/// Values bound by a matched pattern.
pub type Bindings = BTreeMap<String, Value>;

/// Process state visible to patterns.
pub struct MatchScope<'a> {
    /// Matching process.
    pub self_id: &'a ProcessId,
    /// State of the matching process.
    pub state: &'a StateBag,
}

/// Matches events, producing bindings for the handlers.
pub trait EventPattern: Send + Sync {
    /// Bindings if the event matches.
    fn matches(&self, event: &Event, scope: &MatchScope<'_>) -> Option<Bindings>;
}

////////////////////////////////////////////////////////////////////////////////

/// Function of a handler.
pub type HandlerFn = dyn Fn(&mut DistProcess, &Bindings) -> ProcessResult<()> + Send + Sync;

/// Handler run at labels after its pattern matched.
#[derive(Clone)]
pub struct Handler {
    name: String,
    labels: Option<HashSet<String>>,
    notlabels: Option<HashSet<String>>,
    func: Arc<HandlerFn>,
}

impl Handler {
    /// Create handler allowed at any label.
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut DistProcess, &Bindings) -> ProcessResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            labels: None,
            notlabels: None,
            func: Arc::new(func),
        }
    }

    /// Allow the handler only at the given labels.
    pub fn at_labels<I: IntoIterator<Item = S>, S: Into<String>>(mut self, labels: I) -> Self {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Forbid the handler at the given labels.
    pub fn not_at_labels<I: IntoIterator<Item = S>, S: Into<String>>(mut self, labels: I) -> Self {
        self.notlabels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Name of the handler.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks label constraints.
    pub fn permits(&self, label: &str) -> bool {
        self.labels.as_ref().map_or(true, |l| l.contains(label))
            && self.notlabels.as_ref().map_or(true, |l| !l.contains(label))
    }

    pub(crate) fn func(&self) -> Arc<HandlerFn> {
        self.func.clone()
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .field("notlabels", &self.notlabels)
            .finish()
    }
}

/// Pattern with its history name and handlers.
#[derive(Clone)]
pub struct EventBinding {
    pattern: Arc<dyn EventPattern>,
    history: Option<String>,
    handlers: Vec<Handler>,
}

impl EventBinding {
    /// Create binding without history and handlers.
    pub fn new<P: EventPattern + 'static>(pattern: P) -> Self {
        Self {
            pattern: Arc::new(pattern),
            history: None,
            handlers: Vec::new(),
        }
    }

    /// Record matched events into the named history.
    pub fn record_as(mut self, history: &str) -> Self {
        self.history = Some(history.to_owned());
        self
    }

    /// Add handler.
    pub fn handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub(crate) fn pattern(&self) -> &dyn EventPattern {
        self.pattern.as_ref()
    }

    pub(crate) fn history(&self) -> Option<&str> {
        self.history.as_deref()
    }

    pub(crate) fn handlers(&self) -> &[Handler] {
        &self.handlers
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Matches events by message tip and optionally by peer.
///
/// Binds `msg` to the message data, `from` to the sender and `clock`
/// to the logical clock if present.
#[derive(Clone, Debug)]
pub struct TipPattern {
    kind: EventKind,
    tip: String,
    from: Option<ProcessId>,
}

impl TipPattern {
    /// Matches received messages with the tip.
    pub fn received(tip: &str) -> Self {
        Self {
            kind: EventKind::Received,
            tip: tip.to_owned(),
            from: None,
        }
    }

    /// Matches sent messages with the tip.
    pub fn sent(tip: &str) -> Self {
        Self {
            kind: EventKind::Sent,
            tip: tip.to_owned(),
            from: None,
        }
    }

    /// Require the given sender.
    pub fn from(mut self, pid: ProcessId) -> Self {
        self.from = Some(pid);
        self
    }
}

impl EventPattern for TipPattern {
    fn matches(&self, event: &Event, _scope: &MatchScope<'_>) -> Option<Bindings> {
        if event.kind != self.kind || event.message.get_tip() != &self.tip {
            return None;
        }
        if self.from.as_ref().is_some_and(|from| from != &event.from) {
            return None;
        }

        let mut bindings = Bindings::new();
        bindings.insert("msg".to_owned(), event.message.get_value().ok()?);
        bindings.insert("from".to_owned(), serde_json::to_value(&event.from).ok()?);
        if let Some(clock) = event.clock {
            bindings.insert("clock".to_owned(), Value::from(clock));
        }
        Some(bindings)
    }
}
