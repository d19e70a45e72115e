//! In-memory device with a scripted event queue, used to exercise the engine
//! without hardware.

use super::{
    join_device_path, normalize_directory, Device, DeviceError, DeviceEvent, DeviceFileMetadata,
    DeviceFileRef,
};
use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// Every call made against a [`MemoryDevice`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    ListSubdirectories(String),
    ListFiles(String),
    Metadata(DeviceFileRef),
    Fetch(DeviceFileRef),
    Delete(DeviceFileRef),
    WaitForEvent,
    Close,
}

#[derive(Debug, Clone)]
struct MemoryFile {
    modified: DateTime<Utc>,
    content: Vec<u8>,
}

type DeleteHook = Box<dyn FnMut(&DeviceFileRef)>;

/// What `wait_for_event` does once the scripted queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleBehavior {
    Timeout,
    Disconnect,
}

pub struct MemoryDevice {
    directories: BTreeSet<String>,
    files: BTreeMap<DeviceFileRef, MemoryFile>,
    events: VecDeque<DeviceEvent>,
    calls: Vec<DeviceCall>,
    idle: IdleBehavior,
    delete_failure: Option<DeviceError>,
    before_delete: Option<DeleteHook>,
    closed: Rc<Cell<bool>>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    pub fn new() -> Self {
        let mut directories = BTreeSet::new();
        directories.insert("/".to_string());
        Self {
            directories,
            files: BTreeMap::new(),
            events: VecDeque::new(),
            calls: Vec::new(),
            idle: IdleBehavior::Timeout,
            delete_failure: None,
            before_delete: None,
            closed: Rc::new(Cell::new(false)),
        }
    }

    /// Create a directory and all of its ancestors.
    pub fn add_directory(&mut self, path: &str) {
        let path = normalize_directory(path);
        let mut current = String::from("/");
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join_device_path(&current, segment);
            self.directories.insert(current.clone());
        }
    }

    pub fn add_file(
        &mut self,
        directory: &str,
        name: &str,
        modified: DateTime<Utc>,
        content: &[u8],
    ) -> DeviceFileRef {
        self.add_directory(directory);
        let file = DeviceFileRef::new(directory, name);
        self.files.insert(
            file.clone(),
            MemoryFile {
                modified,
                content: content.to_vec(),
            },
        );
        file
    }

    /// Add a file and queue the matching "file added" event.
    pub fn capture(
        &mut self,
        directory: &str,
        name: &str,
        modified: DateTime<Utc>,
        content: &[u8],
    ) -> DeviceFileRef {
        let file = self.add_file(directory, name, modified, content);
        self.push_event(DeviceEvent::FileAdded(file.clone()));
        file
    }

    pub fn push_event(&mut self, event: DeviceEvent) {
        self.events.push_back(event);
    }

    pub fn set_idle_behavior(&mut self, idle: IdleBehavior) {
        self.idle = idle;
    }

    /// Make every subsequent delete fail with `error`.
    pub fn fail_deletes_with(&mut self, error: DeviceError) {
        self.delete_failure = Some(error);
    }

    /// Run `hook` right before each delete is applied (or fails).
    pub fn on_before_delete(&mut self, hook: impl FnMut(&DeviceFileRef) + 'static) {
        self.before_delete = Some(Box::new(hook));
    }

    pub fn contains(&self, file: &DeviceFileRef) -> bool {
        self.files.contains_key(file)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn count_calls(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Shared view of the closed flag that stays readable after the device
    /// has been moved or dropped.
    pub fn closed_flag(&self) -> Rc<Cell<bool>> {
        self.closed.clone()
    }

    fn ensure_directory(&self, path: &str) -> Result<String, DeviceError> {
        let path = normalize_directory(path);
        if self.directories.contains(&path) {
            Ok(path)
        } else {
            Err(DeviceError::not_found(format!("no such folder {}", path)))
        }
    }

    fn lookup(&self, file: &DeviceFileRef) -> Result<&MemoryFile, DeviceError> {
        self.files
            .get(file)
            .ok_or_else(|| DeviceError::not_found(format!("no such file {}", file)))
    }
}

fn parent_of(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let (parent, name) = path.rsplit_once('/')?;
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

impl Device for MemoryDevice {
    fn list_subdirectories(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        self.calls.push(DeviceCall::ListSubdirectories(path.to_string()));
        let path = self.ensure_directory(path)?;
        Ok(self
            .directories
            .iter()
            .filter_map(|dir| parent_of(dir))
            .filter(|(parent, _)| *parent == path)
            .map(|(_, name)| name.to_string())
            .collect())
    }

    fn list_files(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        self.calls.push(DeviceCall::ListFiles(path.to_string()));
        let path = self.ensure_directory(path)?;
        Ok(self
            .files
            .keys()
            .filter(|file| file.directory == path)
            .map(|file| file.name.clone())
            .collect())
    }

    fn file_metadata(&mut self, file: &DeviceFileRef) -> Result<DeviceFileMetadata, DeviceError> {
        self.calls.push(DeviceCall::Metadata(file.clone()));
        let stored = self.lookup(file)?;
        Ok(DeviceFileMetadata {
            file: file.clone(),
            modified: stored.modified,
            size_bytes: Some(stored.content.len() as u64),
        })
    }

    fn fetch_file(&mut self, file: &DeviceFileRef) -> Result<Vec<u8>, DeviceError> {
        self.calls.push(DeviceCall::Fetch(file.clone()));
        Ok(self.lookup(file)?.content.clone())
    }

    fn delete_file(&mut self, file: &DeviceFileRef) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::Delete(file.clone()));
        if let Some(hook) = self.before_delete.as_mut() {
            hook(file);
        }
        if let Some(err) = &self.delete_failure {
            return Err(err.clone());
        }
        self.files
            .remove(file)
            .map(|_| ())
            .ok_or_else(|| DeviceError::not_found(format!("no such file {}", file)))
    }

    fn wait_for_event(&mut self, _timeout: Duration) -> Result<DeviceEvent, DeviceError> {
        self.calls.push(DeviceCall::WaitForEvent);
        match self.events.pop_front() {
            Some(event) => Ok(event),
            None => match self.idle {
                IdleBehavior::Timeout => Ok(DeviceEvent::Timeout),
                IdleBehavior::Disconnect => Err(DeviceError::disconnected("device unplugged")),
            },
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::Close);
        self.closed.set(true);
        Ok(())
    }
}
