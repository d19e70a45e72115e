use crate::device::{DeviceError, DeviceFileRef};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device communication error: {0}")]
    Device(#[from] DeviceError),

    #[error("Unable to read {file} from device: {source}")]
    DeviceRead {
        file: DeviceFileRef,
        source: DeviceError,
    },

    #[error("Failed to write {}: {source}", path.display())]
    TransferIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to persist transfer state to {}: {source}", path.display())]
    StateDurability {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid directory pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl Error {
    /// Errors that end the current device session and hand control back to
    /// the connection supervisor. Everything else is contained to one file.
    pub fn is_session_error(&self) -> bool {
        matches!(self, Error::Device(_))
    }

    /// Classify a device failure that happened while handling one file.
    /// A vanished file only affects that file; anything else ends the session.
    pub fn from_file_access(file: &DeviceFileRef, err: DeviceError) -> Self {
        if err.is_not_found() {
            Error::DeviceRead {
                file: file.clone(),
                source: err,
            }
        } else {
            Error::Device(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_access_classification() {
        let file = DeviceFileRef::new("/DCIM", "IMG_0001.JPG");

        let vanished = Error::from_file_access(&file, DeviceError::not_found("gone"));
        assert!(matches!(vanished, Error::DeviceRead { .. }));
        assert!(!vanished.is_session_error());

        let unplugged = Error::from_file_access(&file, DeviceError::disconnected("usb reset"));
        assert!(unplugged.is_session_error());
    }
}
