//! Durable snapshot of every subscriber's notification state.
//!
//! Layout: one JSON file (`state.json`) holding all subscribers. Writes go
//! to `state.json.tmp` and are renamed into place, so an interrupted run
//! leaves either the old or the new snapshot, never a truncated one.
//!
//! A file that cannot be parsed is moved aside to `state.json.quarantined`
//! and the run starts from defaults. A file written by a newer schema is
//! refused instead, since rewriting it would drop fields this version does
//! not know about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use ratewatch_core::notify::SubscriberBook;

/// Current schema version of `state.json`.
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state file {path} has schema_version {found}, newer than supported {supported}")]
    NewerSchema {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscribers: BTreeMap<String, SubscriberBook>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            updated_at: None,
            subscribers: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn book_mut(&mut self, subscriber_id: &str) -> &mut SubscriberBook {
        self.subscribers
            .entry(subscriber_id.to_string())
            .or_default()
    }
}

/// How a load went. `Quarantined` still yields a usable (default) snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loaded,
    Missing,
    Quarantined { moved_to: PathBuf, reason: String },
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<(StateSnapshot, LoadStatus), StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((StateSnapshot::default(), LoadStatus::Missing));
            }
            Err(e) => return Err(self.io_err(e)),
        };

        match serde_json::from_str::<StateSnapshot>(&content) {
            Ok(snapshot) if snapshot.schema_version > STATE_SCHEMA_VERSION => {
                Err(StateError::NewerSchema {
                    path: self.path.clone(),
                    found: snapshot.schema_version,
                    supported: STATE_SCHEMA_VERSION,
                })
            }
            Ok(snapshot) => Ok((snapshot, LoadStatus::Loaded)),
            Err(e) => {
                let moved_to = quarantine_path(&self.path);
                log::warn!(
                    "quarantining unreadable state file {}: {e}",
                    self.path.display()
                );
                fs::rename(&self.path, &moved_to).map_err(|e| self.io_err(e))?;
                Ok((
                    StateSnapshot::default(),
                    LoadStatus::Quarantined {
                        moved_to,
                        reason: e.to_string(),
                    },
                ))
            }
        }
    }

    /// Stamp `updated_at` and write the snapshot atomically.
    pub fn save(&self, snapshot: &mut StateSnapshot, now: DateTime<Utc>) -> Result<(), StateError> {
        snapshot.schema_version = STATE_SCHEMA_VERSION;
        snapshot.updated_at = Some(now);
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &json).map_err(|e| self.io_err(e))
    }

    fn io_err(&self, source: io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".quarantined");
    PathBuf::from(name)
}

/// Write `bytes` to `{path}.tmp`, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        // Clean up temp file on rename failure
        let _ = fs::remove_file(&tmp_path);
        e
    })
}
