use crate::device::{Device, DeviceFileRef};
use crate::error::Error;
use crate::indexer;
use crate::tracker::TransferTracker;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub directories: usize,
    pub examined: usize,
    pub deleted: usize,
    pub failed: usize,
    /// True when the pass ended early because a stop was requested.
    pub interrupted: bool,
}

/// Deletes device files older than the retention threshold from every
/// matching directory, whether or not they were transferred.
pub struct RetentionPurger {
    pattern: Regex,
    threshold: Duration,
    stop: Option<Arc<AtomicBool>>,
}

impl RetentionPurger {
    pub fn new(pattern: Regex, threshold: Duration) -> Self {
        Self {
            pattern,
            threshold,
            stop: None,
        }
    }

    /// End a pass at the next file once `stop` is raised.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|stop| stop.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn purge_older_than<D: Device + ?Sized>(
        &self,
        device: &mut D,
        tracker: &mut TransferTracker,
    ) -> Result<PurgeReport, Error> {
        self.purge_at(device, tracker, Utc::now())
    }

    /// Same as [`purge_older_than`](Self::purge_older_than) with an explicit
    /// notion of "now". Files modified strictly before `now - threshold` are
    /// deleted.
    ///
    /// Per-file failures are logged and skipped. Losing the device ends the
    /// pass with an error.
    pub fn purge_at<D: Device + ?Sized>(
        &self,
        device: &mut D,
        tracker: &mut TransferTracker,
        now: DateTime<Utc>,
    ) -> Result<PurgeReport, Error> {
        let cutoff = now
            .checked_sub_signed(self.threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = PurgeReport::default();

        'dirs: for dir in indexer::list_matching_directories(device, &self.pattern)? {
            report.directories += 1;
            for name in device.list_files(&dir)? {
                if self.stop_requested() {
                    debug!("Stop requested, ending purge pass early");
                    report.interrupted = true;
                    break 'dirs;
                }
                let file = DeviceFileRef::new(&dir, &name);
                report.examined += 1;

                let metadata = match device.file_metadata(&file) {
                    Ok(metadata) => metadata,
                    Err(err) if err.is_disconnected() => return Err(err.into()),
                    Err(err) => {
                        warn!("Skipping {} during purge, no metadata: {}", file, err);
                        report.failed += 1;
                        continue;
                    }
                };

                if metadata.modified >= cutoff {
                    continue;
                }

                match device.delete_file(&file) {
                    Ok(()) => {
                        info!(
                            "Purged {} (modified {})",
                            file,
                            metadata.modified.format("%Y-%m-%d %H:%M:%S")
                        );
                        report.deleted += 1;
                    }
                    Err(err) if err.is_disconnected() => return Err(err.into()),
                    Err(err) => {
                        warn!("Could not purge {}: {}", file, err);
                        report.failed += 1;
                        continue;
                    }
                }

                if let Err(err) = tracker.unmark(&file) {
                    // A stale entry is harmless; it only costs space.
                    warn!("Purged {} but could not update transfer state: {}", file, err);
                }
            }
        }

        debug!(
            "Purge pass: {} dirs, {} files examined, {} deleted, {} failed",
            report.directories, report.examined, report.deleted, report.failed
        );
        Ok(report)
    }
}
