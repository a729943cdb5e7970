//! Process identities and node-local name registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

////////////////////////////////////////////////////////////////////////////////

static NEXT_SEQNO: AtomicU64 = AtomicU64::new(1);

/// Globally unique identity of a process.
///
/// Carries everything needed to reach the process: the host
/// and the port of each transport, in the transport manager's order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId {
    uid: Uuid,
    seqno: u64,
    class: String,
    name: String,
    node: String,
    host: String,
    transports: Vec<u16>,
}

impl ProcessId {
    pub(crate) fn create(
        class: &str,
        host: &str,
        transports: Vec<u16>,
        name: &str,
        node: &str,
    ) -> Self {
        Self {
            uid: Uuid::new_v4(),
            seqno: NEXT_SEQNO.fetch_add(1, Ordering::Relaxed),
            class: class.to_owned(),
            name: name.to_owned(),
            node: node.to_owned(),
            host: host.to_owned(),
            transports,
        }
    }

    /// Throwaway id addressing whatever listens at the given port.
    pub(crate) fn placeholder(host: &str, port: u16, transports_count: usize) -> Self {
        Self {
            uid: Uuid::nil(),
            seqno: 0,
            class: String::new(),
            name: String::new(),
            node: String::new(),
            host: host.to_owned(),
            transports: vec![port; transports_count.max(1)],
        }
    }

    /// Unique id.
    pub fn uid(&self) -> u128 {
        self.uid.as_u128()
    }

    /// Class tag of the process algorithm.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Name, empty for anonymous processes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the node the process was spawned on.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Host of the execution unit hosting the process.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Transport ports in the transport manager's order.
    pub fn transports(&self) -> &[u16] {
        &self.transports
    }

    /// Checks if the process has a name.
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    /// Key of the process in [`NameRegistry`].
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.node.clone())
    }

    /// Port of the transport with the given index.
    pub fn address_for_transport(&self, index: usize) -> Option<u16> {
        self.transports.get(index).copied()
    }

    pub(crate) fn with_class(mut self, class: &str) -> Self {
        self.class = class.to_owned();
        self
    }

    /// Id converted into a string usable as a file name.
    pub fn filename_form(&self) -> String {
        let name = if self.is_named() {
            self.name.clone()
        } else {
            self.uid.simple().to_string()
        };
        format!("{}_{}_{}", self.class, name, self.seqno)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_named() {
            write!(f, "<{}:{}>", self.class, self.name)
        } else {
            let uid = self.uid.simple().to_string();
            write!(f, "<{}:{}>", self.class, &uid[..5])
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Checks that the name can be used for a process.
pub fn check_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| matches!(c, '@' | ':' | '/') || c.is_whitespace())
}

/// Parsed form of `name[@node][:host[:port]]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedName {
    /// Process name.
    pub name: String,
    /// Node name, empty for the local node.
    pub node: String,
    /// Bootstrap host hint.
    pub host: Option<String>,
    /// Bootstrap port hint.
    pub port: Option<u16>,
}

/// Parses process address string.
pub fn parse_name(input: &str) -> Result<ParsedName, String> {
    let mut parts = input.splitn(3, ':');
    let fullname = parts.next().unwrap_or_default();
    let host = parts.next();
    let port = parts.next();

    let (name, node) = match fullname.split_once('@') {
        Some((name, node)) => (name, node),
        None => (fullname, ""),
    };
    if !check_name(name) {
        return Err(format!("Invalid process name in '{}'", input));
    }
    if node.contains('@') {
        return Err(format!("Invalid node name in '{}'", input));
    }

    let host = match host {
        Some("") => return Err(format!("Empty host in '{}'", input)),
        Some(host) => Some(host.to_owned()),
        None => None,
    };
    let port = match port {
        Some(port) => Some(
            port.parse::<u16>()
                .map_err(|_| format!("Invalid port in '{}'", input))?,
        ),
        None => None,
    };

    Ok(ParsedName {
        name: name.to_owned(),
        node: node.to_owned(),
        host,
        port,
    })
}

////////////////////////////////////////////////////////////////////////////////

/// Callback fired when name gets registered.
pub type ResolveCallback = Box<dyn FnOnce(&ProcessId) + Send>;

/// Resolve request waiting for its name to appear.
pub struct PendingResolve {
    requester: ProcessId,
    seqno: u64,
    deadline: Option<Instant>,
    callback: ResolveCallback,
}

impl PendingResolve {
    /// Create request of `requester` numbered `seqno`, which is dropped
    /// unanswered once `deadline` passes.
    pub fn new(
        requester: ProcessId,
        seqno: u64,
        deadline: Option<Instant>,
        callback: ResolveCallback,
    ) -> Self {
        Self {
            requester,
            seqno,
            deadline,
            callback,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Default)]
struct RegistryInner {
    named: HashMap<(String, String), ProcessId>,
    callbacks: HashMap<(String, String), Vec<PendingResolve>>,
}

impl RegistryInner {
    fn drop_expired(&mut self, now: Instant) {
        self.callbacks.retain(|_, pending| {
            pending.retain(|p| !p.expired(now));
            !pending.is_empty()
        });
    }
}

/// Node-local table of named processes.
#[derive(Default)]
pub struct NameRegistry {
    inner: Mutex<RegistryInner>,
}

impl NameRegistry {
    /// Registers named process. Anonymous ids are ignored.
    pub fn register(&self, pid: &ProcessId) {
        if !pid.is_named() {
            return;
        }
        let now = Instant::now();
        let pending = {
            let mut inner = self.inner.lock();
            inner.named.insert(pid.key(), pid.clone());
            inner.callbacks.remove(&pid.key()).unwrap_or_default()
        };
        for p in pending.into_iter().filter(|p| !p.expired(now)) {
            (p.callback)(pid);
        }
    }

    /// Registers every named process of the list.
    pub fn register_all<'a>(&self, pids: impl IntoIterator<Item = &'a ProcessId>) {
        pids.into_iter().for_each(|pid| self.register(pid));
    }

    /// Looks for the process by its name and node.
    pub fn lookup(&self, name: &str, node: &str) -> Option<ProcessId> {
        self.inner
            .lock()
            .named
            .get(&(name.to_owned(), node.to_owned()))
            .cloned()
    }

    /// Looks for the process, keeping `pending` to be fired
    /// on registration if the process is not known yet.
    ///
    /// Expired requests of every name are dropped on the way.
    pub fn lookup_or_register_callback(
        &self,
        name: &str,
        node: &str,
        pending: PendingResolve,
    ) -> Option<ProcessId> {
        let key = (name.to_owned(), node.to_owned());
        let mut inner = self.inner.lock();
        if let Some(pid) = inner.named.get(&key) {
            return Some(pid.clone());
        }
        inner.drop_expired(Instant::now());
        inner.callbacks.entry(key).or_default().push(pending);
        None
    }

    /// Drops the request `seqno` of `requester`, returning whether it was pending.
    pub fn cancel_callback(&self, requester: &ProcessId, seqno: u64) -> bool {
        let mut inner = self.inner.lock();
        let mut found = false;
        inner.callbacks.retain(|_, pending| {
            pending.retain(|p| {
                let matches = p.seqno == seqno && &p.requester == requester;
                found |= matches;
                !matches
            });
            !pending.is_empty()
        });
        found
    }

    /// Number of resolve requests waiting for their names.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.lock().callbacks.values().map(Vec::len).sum()
    }

    /// All registered processes.
    pub fn all_named(&self) -> Vec<ProcessId> {
        let mut pids: Vec<ProcessId> = self.inner.lock().named.values().cloned().collect();
        pids.sort();
        pids
    }

    /// Removes the process if it is registered.
    pub fn drop_entry(&self, pid: &ProcessId) {
        let mut inner = self.inner.lock();
        if inner.named.get(&pid.key()) == Some(pid) {
            inner.named.remove(&pid.key());
        }
    }

    /// Removes every process spawned on the node.
    pub fn drop_node(&self, node: &str) {
        self.inner.lock().named.retain(|(_, n), _| n != node);
    }
}
