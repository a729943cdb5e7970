//! Declared process state and its snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::pattern::Event;
use crate::common::pid::ProcessId;

/// Explicitly declared fields of a process.
///
/// The bag is what backup saves and restore loads,
/// and what event patterns can inspect.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateBag {
    fields: BTreeMap<String, Value>,
}

impl StateBag {
    /// Declares field with its initial value, overwriting previous declaration.
    pub fn declare<T: Serialize>(&mut self, name: &str, initial: T) -> Result<(), String> {
        let value = serde_json::to_value(initial).map_err(|e| e.to_string())?;
        self.fields.insert(name.to_owned(), value);
        Ok(())
    }

    /// Sets value of declared field.
    pub fn set<T: Serialize>(&mut self, name: &str, value: T) -> Result<(), String> {
        let slot = self
            .fields
            .get_mut(name)
            .ok_or_else(|| format!("field '{}' is not declared", name))?;
        *slot = serde_json::to_value(value).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Value of the field.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.fields
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Modifies declared field in place.
    pub fn update<T, F>(&mut self, name: &str, f: F) -> Result<(), String>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let mut value: T = self
            .get(name)
            .ok_or_else(|| format!("field '{}' is not declared or has other type", name))?;
        f(&mut value);
        self.set(name, value)
    }

    /// Raw value of the field.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Names and values of all fields.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub(crate) fn insert_raw(&mut self, name: String, value: Value) {
        self.fields.insert(name, value);
    }
}

/// Recorded events by history name.
pub type Histories = BTreeMap<String, Vec<Event>>;

////////////////////////////////////////////////////////////////////////////////

const STATE_DIR: &str = "_state";

/// Length of the nanosecond timestamp suffix of snapshot directories.
const TIMESTAMP_LEN: usize = 19;

fn snapshot_prefix(pid: &ProcessId, tag: &str) -> String {
    format!("backup_{}_{}_", pid.filename_form(), tag)
}

fn check_tag(tag: &str) -> Result<(), String> {
    if tag.contains(['/', '\\']) {
        return Err(format!("illegal snapshot tag '{}'", tag));
    }
    Ok(())
}

/// Checks that `name` is `prefix` followed by nothing but the timestamp.
fn is_snapshot_of(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix).is_some_and(|rest| {
        rest.len() == TIMESTAMP_LEN && rest.bytes().all(|b| b.is_ascii_digit())
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let bytes = serde_json::to_vec(value).map_err(|e| e.to_string())?;
    fs::write(path, bytes).map_err(|e| e.to_string())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Writes state and histories into a new snapshot directory.
/// Items which can not be written are logged and skipped.
pub(crate) fn write_snapshot(
    base: &Path,
    pid: &ProcessId,
    tag: &str,
    state: &StateBag,
    histories: &Histories,
) -> Result<PathBuf, String> {
    check_tag(tag)?;
    let timestamp = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .max(0);
    let dir = base.join(format!(
        "{}{:0width$}",
        snapshot_prefix(pid, tag),
        timestamp,
        width = TIMESTAMP_LEN
    ));
    let state_dir = dir.join(STATE_DIR);
    fs::create_dir_all(&state_dir).map_err(|e| format!("{}: {}", state_dir.display(), e))?;

    for (name, value) in state.fields() {
        if let Err(e) = write_json(&state_dir.join(name), value) {
            log::error!("{}: can not back up field {}: {}", pid, name, e);
        }
    }
    for (name, events) in histories {
        if let Err(e) = write_json(&dir.join(name), events) {
            log::error!("{}: can not back up history {}: {}", pid, name, e);
        }
    }
    Ok(dir)
}

/// Latest snapshot of the process with the tag.
pub(crate) fn latest_snapshot(base: &Path, pid: &ProcessId, tag: &str) -> Option<PathBuf> {
    if let Err(e) = check_tag(tag) {
        log::error!("{}: {}", pid, e);
        return None;
    }
    let prefix = snapshot_prefix(pid, tag);
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("{}: can not list {}: {}", pid, base.display(), e);
            return None;
        }
    };
    let timestamp = |name: &str| name[name.len().saturating_sub(TIMESTAMP_LEN)..].to_owned();
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_snapshot_of(name, &prefix))
        .max_by_key(|name| timestamp(name))
        .map(|name| base.join(name))
}

/// Loads snapshot into state and histories.
/// Items which can not be read are logged and skipped.
pub(crate) fn read_snapshot(
    dir: &Path,
    pid: &ProcessId,
    state: &mut StateBag,
    histories: &mut Histories,
) -> Result<(), String> {
    let entries = fs::read_dir(dir).map_err(|e| format!("{}: {}", dir.display(), e))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name == STATE_DIR {
            continue;
        }
        match read_json::<Vec<Event>>(&entry.path()) {
            Ok(events) => {
                histories.insert(name, events);
            }
            Err(e) => log::error!("{}: can not restore history {}: {}", pid, name, e),
        }
    }

    let state_dir = dir.join(STATE_DIR);
    let fields = match fs::read_dir(&state_dir) {
        Ok(fields) => fields,
        Err(e) => {
            log::error!("{}: can not restore state: {}", pid, e);
            return Ok(());
        }
    };
    for entry in fields.filter_map(|entry| entry.ok()) {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        match read_json::<Value>(&entry.path()) {
            Ok(value) => state.insert_raw(name, value),
            Err(e) => log::error!("{}: can not restore field {}: {}", pid, name, e),
        }
    }
    Ok(())
}
