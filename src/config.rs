//! Runtime and per-process configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::ChannelCaps;

////////////////////////////////////////////////////////////////////////////////

/// How child processes are implemented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcImpl {
    /// Each child runs in its own OS process.
    Process,
    /// Each child runs on its own OS thread sharing the router of the parent.
    #[default]
    Thread,
}

/// How OS processes are started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMethod {
    /// Re-execute the current binary and hand over state through a pipe.
    #[default]
    Spawn,
    /// Accepted for compatibility, started with spawn semantics.
    Fork,
}

/// Which transport manager backs the router of an execution unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process hub, only usable within one OS process.
    #[default]
    Memory,
    /// Framed TCP.
    Tcp,
}

////////////////////////////////////////////////////////////////////////////////

/// Configuration shared by all processes of one execution unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Host name other nodes use to reach us.
    pub hostname: String,
    /// Fixed port of the first transport, overrides the port range.
    pub port: Option<u16>,
    /// Lower bound of the port range (inclusive).
    pub min_port: u16,
    /// Upper bound of the port range (exclusive).
    pub max_port: u16,
    /// Port assumed for bootstrap hints which do not name one.
    pub default_master_port: u16,
    /// Size of one serialization buffer, which bounds the frame size.
    pub message_buffer_size: usize,
    /// Authentication cookie, generated when absent.
    pub cookie: Option<String>,
    /// How OS processes are started.
    pub start_method: StartMethod,
    /// Implementation of children created without explicit method.
    pub default_proc_impl: ProcImpl,
    /// Node process hangs instead of running its algorithm.
    pub idle: bool,
    /// Transport backing the router.
    pub transport: TransportKind,
    /// Address `host[:port]` of a running node to join on start.
    pub peer: Option<String>,
    /// Seconds to wait for the bootstrap peer.
    pub bootstrap_timeout: f64,
    /// Seconds `resolve` waits for the node, non-positive waits forever.
    pub resolve_timeout: f64,
    /// Record receive and send traces of every process.
    pub record_trace: bool,
    /// Directory of trace files.
    pub logdir: PathBuf,
    /// Directory of backup snapshots.
    pub backup_dir: PathBuf,
    /// Seed of the per-process random generators.
    pub seed: Option<u64>,
    /// Class renames applied to process ids read from traces.
    pub substitute_classes: BTreeMap<String, String>,
    /// Process config entries, applied on top of class defaults.
    pub config: BTreeMap<String, Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_owned(),
            port: None,
            min_port: 10000,
            max_port: 40000,
            default_master_port: 15000,
            message_buffer_size: 4 << 10,
            cookie: None,
            start_method: StartMethod::default(),
            default_proc_impl: ProcImpl::default(),
            idle: false,
            transport: TransportKind::default(),
            peer: None,
            bootstrap_timeout: 3.0,
            resolve_timeout: 5.0,
            record_trace: false,
            logdir: PathBuf::from("."),
            backup_dir: PathBuf::from("."),
            seed: None,
            substitute_classes: BTreeMap::new(),
            config: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from json file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            format!(
                "Can not read config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        Self::from_json_str(&content)
    }

    /// Parse configuration from json string.
    pub fn from_json_str(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| format!("Can not parse config: {}", e))
    }

    /// Parses the peer hint into host and port.
    pub fn peer_address(&self) -> Option<Result<(String, u16), String>> {
        self.peer.as_ref().map(|peer| match peer.split_once(':') {
            None if !peer.is_empty() => Ok((peer.clone(), self.default_master_port)),
            Some((host, port)) if !host.is_empty() => port
                .parse::<u16>()
                .map(|port| (host.to_owned(), port))
                .map_err(|_| format!("Invalid peer port in '{}'", peer)),
            _ => Err(format!("Invalid peer address '{}'", peer)),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Whether one or all pending events are handled at a label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handling {
    /// At most one event and one successful handler per label.
    #[default]
    One,
    /// Every event queued when the label was reached.
    All,
}

/// What happens with jobs whose label constraints are not satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unmatched {
    /// Drop the job.
    #[default]
    Drop,
    /// Put the job back to the end of the queue.
    Keep,
}

/// Logical clock kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    /// No logical clock.
    #[default]
    None,
    /// Lamport clock.
    Lamport,
}

/// Configuration of one process.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessConfig {
    /// Event handling mode at labels.
    pub handling: Handling,
    /// Treatment of jobs not permitted at the current label.
    pub unmatched: Unmatched,
    /// Default channel of sends.
    pub channel: ChannelCaps,
    /// Sends are dropped with probability [`loss_rate`][ProcessConfig::loss_rate].
    pub lossy: bool,
    /// Probability of dropping a message on lossy channel.
    pub loss_rate: f64,
    /// Seconds each message is delayed by.
    pub delay: f64,
    /// Logical clock kind.
    pub clock: ClockKind,
    /// Crash and Recover commands are honoured.
    pub enable_crash: bool,
    /// Backup and Restore commands are honoured.
    pub enable_backup: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            handling: Handling::One,
            unmatched: Unmatched::Drop,
            channel: ChannelCaps::NONE,
            lossy: false,
            loss_rate: 0.0,
            delay: 0.0,
            clock: ClockKind::None,
            enable_crash: false,
            enable_backup: false,
        }
    }
}

impl ProcessConfig {
    /// Builds configuration from class defaults overridden by runtime entries.
    pub fn resolve(
        runtime: &BTreeMap<String, Value>,
        class_defaults: &BTreeMap<String, Value>,
    ) -> Self {
        let mut config = Self::default();
        for (key, value) in class_defaults.iter().chain(runtime.iter()) {
            if let Err(e) = config.set(key, value) {
                log::error!("Ignoring config entry '{}': {}", key, e);
            }
        }
        config
    }

    /// Updates one entry by its key.
    pub fn set(&mut self, key: &str, value: &Value) -> Result<(), String> {
        match key {
            "handling" => self.handling = from_value(value)?,
            "unmatched" => self.unmatched = from_value(value)?,
            "clock" => self.clock = from_value(value)?,
            "enable_crash" => self.enable_crash = from_value(value)?,
            "enable_backup" => self.enable_backup = from_value(value)?,
            "loss_rate" => self.loss_rate = from_value(value)?,
            "delay" => self.delay = from_value(value)?,
            "channel" => self.set_channel(value)?,
            _ => return Err(format!("unknown config key '{}'", key)),
        }
        Ok(())
    }

    fn set_channel(&mut self, value: &Value) -> Result<(), String> {
        let names: Vec<String> = match value {
            Value::String(name) => vec![name.clone()],
            Value::Array(_) => from_value(value)?,
            _ => return Err(format!("invalid channel {}", value)),
        };

        let mut caps = ChannelCaps::NONE;
        for name in names {
            if name == "lossy" {
                self.lossy = true;
                continue;
            }
            match ChannelCaps::from_name(&name) {
                Some(cap) => caps |= cap,
                None => log::error!("Unknown channel property '{}'", name),
            }
        }
        self.channel = caps;
        Ok(())
    }
}

fn from_value<T: for<'a> Deserialize<'a>>(value: &Value) -> Result<T, String> {
    T::deserialize(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{ClockKind, Handling, ProcessConfig, RuntimeConfig};
    use crate::transport::ChannelCaps;

    #[test]
    fn runtime_config_from_json() {
        let config =
            RuntimeConfig::from_json_str(r#"{"hostname": "node-a", "min_port": 20000}"#).unwrap();
        assert_eq!(config.hostname, "node-a");
        assert_eq!(config.min_port, 20000);
        assert_eq!(config.max_port, 40000);
        assert!(RuntimeConfig::from_json_str("{").is_err());
    }

    #[test]
    fn peer_address() {
        let mut config = RuntimeConfig::default();
        assert!(config.peer_address().is_none());

        config.peer = Some("host-a".to_owned());
        assert_eq!(
            config.peer_address().unwrap().unwrap(),
            ("host-a".to_owned(), config.default_master_port)
        );

        config.peer = Some("host-a:1234".to_owned());
        assert_eq!(config.peer_address().unwrap().unwrap().1, 1234);

        config.peer = Some("host-a:port".to_owned());
        assert!(config.peer_address().unwrap().is_err());
    }

    #[test]
    fn process_config_precedence() {
        let mut class_defaults = BTreeMap::new();
        class_defaults.insert("handling".to_owned(), json!("all"));
        class_defaults.insert("clock".to_owned(), json!("lamport"));

        let mut runtime = BTreeMap::new();
        runtime.insert("handling".to_owned(), json!("one"));
        runtime.insert("channel".to_owned(), json!(["fifo", "reliable", "lossy"]));

        let config = ProcessConfig::resolve(&runtime, &class_defaults);
        assert_eq!(config.handling, Handling::One);
        assert_eq!(config.clock, ClockKind::Lamport);
        assert!(config.lossy);
        assert!(config.channel.contains(ChannelCaps::RELIABLEFIFO));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut config = ProcessConfig::default();
        assert!(config.set("colour", &json!("red")).is_err());
        assert!(config.set("loss_rate", &json!("high")).is_err());
        assert!(config.set("loss_rate", &json!(0.25)).is_ok());
        assert_eq!(config.loss_rate, 0.25);
    }
}
