//! Context shared by every process of one execution unit.

use std::collections::BTreeMap;
use std::process::Child;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::codec::Codec;
use crate::common::pid::{NameRegistry, ProcessId};
use crate::config::{ProcessConfig, RuntimeConfig};
use crate::process::Algorithm;

////////////////////////////////////////////////////////////////////////////////

/// Algorithms which can be instantiated by class name.
///
/// Every process of a class starts from a clone of the registered prototype.
#[derive(Clone, Default)]
pub struct ClassRegistry {
    classes: BTreeMap<String, Box<dyn Algorithm>>,
}

impl ClassRegistry {
    /// Create empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers prototype of the class.
    pub fn register<A: Algorithm + 'static>(&mut self, class: &str, prototype: A) -> &mut Self {
        self.classes.insert(class.to_owned(), Box::new(prototype));
        self
    }

    /// Same as [`ClassRegistry::register`], but consumes and returns the registry.
    pub fn with<A: Algorithm + 'static>(mut self, class: &str, prototype: A) -> Self {
        self.register(class, prototype);
        self
    }

    /// Checks if the class is registered.
    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// New instance of the class.
    pub fn instantiate(&self, class: &str) -> Option<Box<dyn Algorithm>> {
        self.classes.get(class).map(|p| dyn_clone::clone_box(&**p))
    }

    /// Config defaults declared by the class.
    pub fn defaults(&self, class: &str) -> BTreeMap<String, Value> {
        self.classes
            .get(class)
            .map(|p| p.config())
            .unwrap_or_default()
    }
}

////////////////////////////////////////////////////////////////////////////////

enum ChildHandle {
    Thread(JoinHandle<i32>),
    Process(Child),
}

/// Configuration, classes, names and node identity of an execution unit.
pub struct Runtime {
    config: RuntimeConfig,
    classes: ClassRegistry,
    names: NameRegistry,
    node: RwLock<Option<ProcessId>>,
    codec: Codec,
    cookie: String,
    children: Mutex<Vec<(ChildHandle, bool)>>,
}

impl Runtime {
    /// Create runtime. Missing cookie is generated.
    pub fn new(config: RuntimeConfig, classes: ClassRegistry) -> Arc<Self> {
        let cookie = config.cookie.clone().unwrap_or_else(|| {
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect()
        });
        let codec = Codec::new(config.substitute_classes.clone());
        Arc::new(Self {
            config,
            classes,
            names: NameRegistry::default(),
            node: RwLock::new(None),
            codec,
            cookie,
            children: Mutex::new(Vec::new()),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Registered classes.
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Named processes known to this execution unit.
    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    /// Codec of wire frames and traces.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Authentication cookie.
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Configuration of a new process of the class.
    pub fn process_config(&self, class: &str) -> ProcessConfig {
        ProcessConfig::resolve(&self.config.config, &self.classes.defaults(class))
    }

    /// Node process of the execution unit.
    pub fn node_id(&self) -> Option<ProcessId> {
        self.node.read().clone()
    }

    /// Name of the node, empty before the node process exists.
    pub fn node_name(&self) -> String {
        self.node
            .read()
            .as_ref()
            .map(|n| n.name().to_owned())
            .unwrap_or_default()
    }

    pub(crate) fn set_node_id(&self, pid: ProcessId) {
        self.names.register(&pid);
        *self.node.write() = Some(pid);
    }

    pub(crate) fn adopt_thread(&self, handle: JoinHandle<i32>, daemon: bool) {
        self.children.lock().push((ChildHandle::Thread(handle), daemon));
    }

    pub(crate) fn adopt_process(&self, child: Child, daemon: bool) {
        self.children.lock().push((ChildHandle::Process(child), daemon));
    }

    /// Waits for non-daemon children and kills daemon OS processes.
    pub fn reap_children(&self) {
        let children = std::mem::take(&mut *self.children.lock());
        for (child, daemon) in children {
            match child {
                ChildHandle::Thread(handle) if !daemon => match handle.join() {
                    Ok(code) => log::debug!("Child thread finished with code {}", code),
                    Err(_) => log::error!("Child thread panicked"),
                },
                ChildHandle::Thread(_) => {}
                ChildHandle::Process(mut child) => {
                    if daemon {
                        if let Err(e) = child.kill() {
                            log::debug!("Can not kill daemon child {}: {}", child.id(), e);
                        }
                    }
                    match child.wait() {
                        Ok(status) => log::debug!("Child {} exited: {}", child.id(), status),
                        Err(e) => log::error!("Can not wait for child {}: {}", child.id(), e),
                    }
                }
            }
        }
    }
}
