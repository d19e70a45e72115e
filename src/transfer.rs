use crate::device::{Device, DeviceFileMetadata, DeviceFileRef};
use crate::error::Error;
use crate::naming;
use crate::tracker::TransferTracker;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Fresh names tried before giving up when a derived name is already taken.
const NAME_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub transferred: bool,
    pub local_path: Option<PathBuf>,
    /// False when the file could not be removed from the device afterwards.
    pub deleted_from_device: bool,
}

impl TransferOutcome {
    fn skipped() -> Self {
        Self {
            transferred: false,
            local_path: None,
            deleted_from_device: false,
        }
    }
}

/// Moves one device file into the target directory: fetch, write, mark as
/// transferred, then delete from the device. The mark is always durable
/// before the device delete is issued.
pub struct MediaTransferEngine {
    target_dir: PathBuf,
}

impl MediaTransferEngine {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
        }
    }

    pub fn transfer_if_new<D: Device + ?Sized>(
        &self,
        device: &mut D,
        tracker: &mut TransferTracker,
        file: &DeviceFileRef,
    ) -> Result<TransferOutcome, Error> {
        if tracker.contains(file) {
            debug!("{} already transferred, skipping", file);
            return Ok(TransferOutcome::skipped());
        }

        let metadata = device
            .file_metadata(file)
            .map_err(|e| Error::from_file_access(file, e))?;
        let content = device
            .fetch_file(file)
            .map_err(|e| Error::from_file_access(file, e))?;

        let local_path = self.write_local(&metadata, &content)?;
        info!(
            "Downloaded {} to {} ({} bytes)",
            file,
            local_path.display(),
            content.len()
        );
        set_shared_permissions(&local_path);

        if let Err(err) = tracker.mark_transferred(file) {
            // The copy is not recorded, so it must not outlive this attempt or
            // the next scan would leave a second copy next to it.
            if let Err(remove_err) = fs::remove_file(&local_path) {
                warn!(
                    "Could not remove unrecorded copy {}: {}",
                    local_path.display(),
                    remove_err
                );
            }
            return Err(err);
        }

        let deleted_from_device = match device.delete_file(file) {
            Ok(()) => {
                info!("Deleted {} from device", file);
                true
            }
            Err(err) => {
                warn!(
                    "Downloaded {} but could not delete it from the device: {}",
                    file, err
                );
                false
            }
        };

        Ok(TransferOutcome {
            transferred: true,
            local_path: Some(local_path),
            deleted_from_device,
        })
    }

    fn write_local(
        &self,
        metadata: &DeviceFileMetadata,
        content: &[u8],
    ) -> Result<PathBuf, Error> {
        let mut last_err = None;
        for _ in 0..NAME_ATTEMPTS {
            let path = self.target_dir.join(naming::derive_local_name(metadata));
            match write_new_file(&path, content) {
                Ok(()) => return Ok(path),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} already exists, deriving another name", path.display());
                    last_err = Some((path, err));
                }
                Err(source) => return Err(Error::TransferIo { path, source }),
            }
        }

        let (path, source) = last_err.unwrap_or_else(|| {
            (
                self.target_dir.clone(),
                io::Error::new(ErrorKind::AlreadyExists, "no free local name"),
            )
        });
        Err(Error::TransferIo { path, source })
    }
}

/// Create `path` (never overwriting) and write `content` durably. A partial
/// file is removed on failure.
fn write_new_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let result = file.write_all(content).and_then(|_| file.sync_all());
    if result.is_err() {
        drop(file);
        let _ = fs::remove_file(path);
    }
    result
}

/// Make the copy readable and writable by every local user.
#[cfg(unix)]
fn set_shared_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
        warn!("Could not set permissions on {}: {}", path.display(), err);
    }
}

#[cfg(not(unix))]
fn set_shared_permissions(path: &Path) {
    match fs::metadata(path) {
        Ok(metadata) => {
            let mut permissions = metadata.permissions();
            permissions.set_readonly(false);
            if let Err(err) = fs::set_permissions(path, permissions) {
                warn!("Could not set permissions on {}: {}", path.display(), err);
            }
        }
        Err(err) => warn!("Could not read permissions of {}: {}", path.display(), err),
    }
}
