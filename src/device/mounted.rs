//! Device backend for camera storage exposed as a local directory tree
//! (USB mass storage, or an MTP/PTP mount provided by the desktop).
//!
//! Events come from a recursive `notify` watcher. A file is reported as added
//! once it has been closed after writing or renamed into the tree, so a file
//! that is still being written by the camera is never picked up half-way.

use super::{
    normalize_directory, Device, DeviceConnector, DeviceError, DeviceEvent, DeviceFileMetadata,
    DeviceFileRef,
};
use chrono::{DateTime, Utc};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub struct MountedConnector {
    root: PathBuf,
}

impl MountedConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DeviceConnector for MountedConnector {
    type Device = MountedDevice;

    fn connect(&mut self) -> Result<MountedDevice, DeviceError> {
        if !self.root.is_dir() {
            return Err(DeviceError::disconnected(format!(
                "mount point {} is not available",
                self.root.display()
            )));
        }
        let root = fs::canonicalize(&self.root).map_err(|e| {
            DeviceError::disconnected(format!("cannot resolve {}: {}", self.root.display(), e))
        })?;
        MountedDevice::open(root)
    }
}

pub struct MountedDevice {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    events: Receiver<notify::Result<Event>>,
    pending: VecDeque<DeviceFileRef>,
}

impl MountedDevice {
    pub fn open(root: PathBuf) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)
            .map_err(|e| DeviceError::protocol(format!("cannot create watcher: {}", e)))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| DeviceError::protocol(format!("cannot watch {}: {}", root.display(), e)))?;
        debug!("Watching {} for new files", root.display());

        Ok(Self {
            root,
            watcher: Some(watcher),
            events: rx,
            pending: VecDeque::new(),
        })
    }

    fn local_path(&self, device_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in device_path.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    fn file_path(&self, file: &DeviceFileRef) -> PathBuf {
        self.local_path(&file.device_path())
    }

    /// Map a local path under the mount root back into the device namespace.
    fn device_ref(&self, path: &Path) -> Option<DeviceFileRef> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let name = relative.file_name()?.to_str()?;
        let mut directory = String::new();
        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                match component {
                    Component::Normal(segment) => {
                        directory.push('/');
                        directory.push_str(segment.to_str()?);
                    }
                    _ => return None,
                }
            }
        }
        Some(DeviceFileRef::new(&directory, name))
    }

    fn mount_lost(&self) -> DeviceError {
        DeviceError::disconnected(format!("mount point {} disappeared", self.root.display()))
    }

    fn map_io_error(&self, context: &str, err: io::Error) -> DeviceError {
        if !self.root.is_dir() {
            return self.mount_lost();
        }
        match err.kind() {
            io::ErrorKind::NotFound => DeviceError::not_found(format!("{}: {}", context, err)),
            _ => DeviceError::protocol(format!("{}: {}", context, err)),
        }
    }

    fn read_entries(&self, path: &str, want_dirs: bool) -> Result<Vec<String>, DeviceError> {
        let local = self.local_path(&normalize_directory(path));
        let entries = fs::read_dir(&local).map_err(|e| self.map_io_error(path, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.map_io_error(path, e))?;
            let file_type = entry.file_type().map_err(|e| self.map_io_error(path, e))?;
            let wanted = if want_dirs {
                file_type.is_dir()
            } else {
                file_type.is_file()
            };
            if !wanted {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!("Skipping non UTF-8 entry {:?} in {}", raw, path),
            }
        }
        names.sort();
        Ok(names)
    }

    fn queue_added(&mut self, event: Event) -> Option<&'static str> {
        let paths: Vec<PathBuf> = match event.kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
            // Always paired with a `To` event for the same destination.
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Some("renamed"),
            EventKind::Create(_) => return Some("created"),
            EventKind::Remove(_) => return Some("removed"),
            EventKind::Modify(_) => return Some("modified"),
            EventKind::Access(_) => return Some("accessed"),
            _ => return Some("other"),
        };

        for path in paths {
            if !path.is_file() {
                continue;
            }
            match self.device_ref(&path) {
                Some(file) => self.pending.push_back(file),
                None => trace!("Ignoring event for {}", path.display()),
            }
        }
        None
    }
}

impl Device for MountedDevice {
    fn list_subdirectories(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        self.read_entries(path, true)
    }

    fn list_files(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        self.read_entries(path, false)
    }

    fn file_metadata(&mut self, file: &DeviceFileRef) -> Result<DeviceFileMetadata, DeviceError> {
        let path = self.file_path(file);
        let metadata = fs::metadata(&path).map_err(|e| self.map_io_error(&file.device_path(), e))?;
        if !metadata.is_file() {
            return Err(DeviceError::not_found(format!("{} is not a file", file)));
        }
        let modified = metadata
            .modified()
            .map_err(|e| self.map_io_error(&file.device_path(), e))?;

        Ok(DeviceFileMetadata {
            file: file.clone(),
            modified: DateTime::<Utc>::from(modified),
            size_bytes: Some(metadata.len()),
        })
    }

    fn fetch_file(&mut self, file: &DeviceFileRef) -> Result<Vec<u8>, DeviceError> {
        fs::read(self.file_path(file)).map_err(|e| self.map_io_error(&file.device_path(), e))
    }

    fn delete_file(&mut self, file: &DeviceFileRef) -> Result<(), DeviceError> {
        fs::remove_file(self.file_path(file))
            .map_err(|e| self.map_io_error(&file.device_path(), e))
    }

    fn wait_for_event(&mut self, timeout: Duration) -> Result<DeviceEvent, DeviceError> {
        if let Some(file) = self.pending.pop_front() {
            return Ok(DeviceEvent::FileAdded(file));
        }

        match self.events.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if let Some(kind) = self.queue_added(event) {
                    return Ok(DeviceEvent::Other(kind.to_string()));
                }
                Ok(self
                    .pending
                    .pop_front()
                    .map(DeviceEvent::FileAdded)
                    .unwrap_or_else(|| DeviceEvent::Other("directory".to_string())))
            }
            Ok(Err(err)) if self.root.is_dir() => {
                Err(DeviceError::protocol(format!("watch error: {}", err)))
            }
            Ok(Err(_)) => Err(self.mount_lost()),
            Err(RecvTimeoutError::Timeout) => {
                if self.root.is_dir() {
                    Ok(DeviceEvent::Timeout)
                } else {
                    Err(self.mount_lost())
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(DeviceError::disconnected("file watcher stopped"))
            }
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(mut watcher) = self.watcher.take() {
            watcher
                .unwatch(&self.root)
                .map_err(|e| DeviceError::protocol(format!("unwatch failed: {}", e)))?;
        }
        self.pending.clear();
        Ok(())
    }
}
