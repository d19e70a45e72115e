//! Device collaborator boundary.
//!
//! The sync engine never talks to a camera driver directly. Everything it
//! needs from the device goes through the [`Device`] trait, and every session
//! starts from a [`DeviceConnector`]. Paths on the device use a flat,
//! forward-slash namespace rooted at `/`.

pub mod memory;
pub mod mounted;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Identifies a file on the device. This is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceFileRef {
    pub directory: String,
    pub name: String,
}

impl DeviceFileRef {
    pub fn new(directory: &str, name: &str) -> Self {
        Self {
            directory: normalize_directory(directory),
            name: name.to_string(),
        }
    }

    /// Full device path of the file, e.g. `/DCIM/100CANON/IMG_0001.JPG`.
    pub fn device_path(&self) -> String {
        join_device_path(&self.directory, &self.name)
    }

    /// Lowercased extension including the leading dot, if the name has one.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
    }
}

impl fmt::Display for DeviceFileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFileMetadata {
    pub file: DeviceFileRef,
    pub modified: DateTime<Utc>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    FileAdded(DeviceFileRef),
    /// The bounded wait elapsed with nothing to report.
    Timeout,
    /// Any event kind the engine does not act on.
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The requested file or folder does not exist on the device.
    NotFound,
    /// The device went away (unplugged, mount lost, powered off).
    Disconnected,
    /// The device answered, but not in a way we can use.
    Protocol,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Protocol => write!(f, "protocol error"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::NotFound, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Disconnected, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Protocol, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == DeviceErrorKind::NotFound
    }

    pub fn is_disconnected(&self) -> bool {
        self.kind == DeviceErrorKind::Disconnected
    }
}

/// Capability set the engine expects from a connected device.
///
/// All calls are blocking. `wait_for_event` is the only one expected to take
/// a noticeable amount of time, and it must return [`DeviceEvent::Timeout`]
/// once `timeout` has elapsed.
pub trait Device {
    fn list_subdirectories(&mut self, path: &str) -> Result<Vec<String>, DeviceError>;
    fn list_files(&mut self, path: &str) -> Result<Vec<String>, DeviceError>;
    fn file_metadata(&mut self, file: &DeviceFileRef) -> Result<DeviceFileMetadata, DeviceError>;
    fn fetch_file(&mut self, file: &DeviceFileRef) -> Result<Vec<u8>, DeviceError>;
    fn delete_file(&mut self, file: &DeviceFileRef) -> Result<(), DeviceError>;
    fn wait_for_event(&mut self, timeout: Duration) -> Result<DeviceEvent, DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Opens and initializes a device session.
pub trait DeviceConnector {
    type Device: Device;

    fn connect(&mut self) -> Result<Self::Device, DeviceError>;
}

/// Join a device directory and a child name without doubling separators.
pub fn join_device_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Leading slash, no trailing slash (except for the root itself).
pub fn normalize_directory(directory: &str) -> String {
    let trimmed = directory.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
