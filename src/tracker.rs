//! Durable record of device files that have already been transferred.
//!
//! The whole set is rewritten on every mutation: serialized with `bincode`
//! into a sibling temp file, fsynced, then renamed over the previous state
//! file. A reader therefore sees either the old set or the new one, never a
//! partial write. Loading is fail-open: a missing or unreadable file yields an
//! empty set.

use crate::device::DeviceFileRef;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    refs: HashSet<DeviceFileRef>,
}

impl TransferRecord {
    pub fn contains(&self, file: &DeviceFileRef) -> bool {
        self.refs.contains(file)
    }

    pub fn insert(&mut self, file: DeviceFileRef) -> bool {
        self.refs.insert(file)
    }

    pub fn remove(&mut self, file: &DeviceFileRef) -> bool {
        self.refs.remove(file)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    record: TransferRecord,
}

pub struct TransferTracker {
    /// `None` disables tracking: nothing is remembered or persisted.
    path: Option<PathBuf>,
    record: TransferRecord,
}

impl TransferTracker {
    /// Open the tracker backed by `path`, loading whatever state is there.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = Self::load(&path);
        debug!(
            "Loaded {} transferred refs from {}",
            record.len(),
            path.display()
        );
        Self {
            path: Some(path),
            record,
        }
    }

    /// A tracker that never reports a file as transferred.
    pub fn disabled() -> Self {
        Self {
            path: None,
            record: TransferRecord::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn record(&self) -> &TransferRecord {
        &self.record
    }

    pub fn contains(&self, file: &DeviceFileRef) -> bool {
        self.record.contains(file)
    }

    /// Record `file` as transferred and persist before returning. If the
    /// state cannot be persisted the in-memory mark is rolled back.
    pub fn mark_transferred(&mut self, file: &DeviceFileRef) -> Result<(), Error> {
        if self.path.is_none() || !self.record.insert(file.clone()) {
            return Ok(());
        }
        if let Err(err) = self.persist() {
            self.record.remove(file);
            return Err(err);
        }
        Ok(())
    }

    /// Forget `file` and persist before returning.
    pub fn unmark(&mut self, file: &DeviceFileRef) -> Result<(), Error> {
        if self.path.is_none() || !self.record.remove(file) {
            return Ok(());
        }
        if let Err(err) = self.persist() {
            self.record.insert(file.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Read the state file. Missing or corrupt state yields an empty record.
    pub fn load(path: &Path) -> TransferRecord {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return TransferRecord::default(),
            Err(err) => {
                warn!(
                    "Cannot read transfer state {}, starting empty: {}",
                    path.display(),
                    err
                );
                return TransferRecord::default();
            }
        };

        match bincode::deserialize::<StateFile>(&bytes) {
            Ok(state) if state.version == STATE_VERSION => state.record,
            Ok(state) => {
                warn!(
                    "Transfer state {} has unknown version {}, starting empty",
                    path.display(),
                    state.version
                );
                TransferRecord::default()
            }
            Err(err) => {
                warn!(
                    "Transfer state {} is corrupt, starting empty: {}",
                    path.display(),
                    err
                );
                TransferRecord::default()
            }
        }
    }

    /// Atomically replace the state file with the current record.
    pub fn persist(&self) -> Result<(), Error> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        write_atomically(path, &self.record).map_err(|source| {
            error!(
                "Could not persist transfer state to {}: {}",
                path.display(),
                source
            );
            Error::StateDurability {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

fn write_atomically(path: &Path, record: &TransferRecord) -> io::Result<()> {
    let state = StateFile {
        version: STATE_VERSION,
        record: record.clone(),
    };
    let bytes = bincode::serialize(&state)
        .map_err(|e| io::Error::new(ErrorKind::Other, format!("Serialize error: {}", e)))?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{}.tmp", file_name));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    sync_directory(&parent);
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) {}
