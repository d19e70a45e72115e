use crate::config::{ExtensionFilter, Settings};
use crate::device::{Device, DeviceEvent, DeviceFileRef};
use crate::error::Error;
use crate::indexer;
use crate::retention::{PurgeReport, RetentionPurger};
use crate::tracker::TransferTracker;
use crate::transfer::MediaTransferEngine;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub discovered: usize,
    pub transferred: usize,
    pub skipped: usize,
    pub failed: usize,
    /// True when the scan ended early because a stop was requested.
    pub interrupted: bool,
}

/// Per-session control loop. Owns the tracker for the life of the process so
/// state carries over from one connected session to the next.
pub struct EventLoop {
    engine: MediaTransferEngine,
    purger: RetentionPurger,
    tracker: TransferTracker,
    pattern: Regex,
    extensions: ExtensionFilter,
    event_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new(settings: &Settings, tracker: TransferTracker, stop: Arc<AtomicBool>) -> Self {
        Self {
            engine: MediaTransferEngine::new(&settings.target_dir),
            purger: RetentionPurger::new(settings.directory_pattern.clone(), settings.retention)
                .with_stop(stop.clone()),
            tracker,
            pattern: settings.directory_pattern.clone(),
            extensions: settings.extensions.clone(),
            event_timeout: settings.event_timeout,
            stop,
        }
    }

    pub fn tracker(&self) -> &TransferTracker {
        &self.tracker
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run one connected session: bootstrap pass, then wait for events until
    /// the stop flag is raised. Device errors end the session with `Err`.
    pub fn run<D: Device + ?Sized>(&mut self, device: &mut D) -> Result<(), Error> {
        self.bootstrap(device)?;
        if !self.stop_requested() {
            info!("Monitoring for new photos...");
        }

        while !self.stop_requested() {
            match device.wait_for_event(self.event_timeout)? {
                DeviceEvent::FileAdded(file) => {
                    self.handle_file_added(device, &file)?;
                    self.purge(device)?;
                }
                DeviceEvent::Timeout => trace!("No device event within {:?}", self.event_timeout),
                DeviceEvent::Other(kind) => trace!("Ignoring device event: {}", kind),
            }
        }

        info!("Stop requested, leaving event loop");
        Ok(())
    }

    /// Catch up on everything that arrived while disconnected, then purge.
    pub fn bootstrap<D: Device + ?Sized>(&mut self, device: &mut D) -> Result<ScanReport, Error> {
        let report = self.scan(device)?;
        if report.interrupted {
            return Ok(report);
        }
        info!(
            "Bootstrap scan: {} found, {} transferred, {} already handled, {} failed",
            report.discovered, report.transferred, report.skipped, report.failed
        );
        self.purge(device)?;
        Ok(report)
    }

    /// Transfer every recognized file in every matching directory. A stop
    /// request ends the scan before the next file.
    pub fn scan<D: Device + ?Sized>(&mut self, device: &mut D) -> Result<ScanReport, Error> {
        let mut report = ScanReport::default();
        'dirs: for dir in indexer::list_matching_directories(device, &self.pattern)? {
            for name in device.list_files(&dir)? {
                if self.stop_requested() {
                    debug!("Stop requested, ending scan early");
                    report.interrupted = true;
                    break 'dirs;
                }
                if !self.extensions.accepts(&name) {
                    trace!("Ignoring {}/{}, extension not recognized", dir, name);
                    continue;
                }
                report.discovered += 1;
                let file = DeviceFileRef::new(&dir, &name);
                match self.engine.transfer_if_new(device, &mut self.tracker, &file) {
                    Ok(outcome) if outcome.transferred => report.transferred += 1,
                    Ok(_) => report.skipped += 1,
                    Err(err) if err.is_session_error() => return Err(err),
                    Err(err) => {
                        log_file_error(&file, &err);
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    pub fn handle_file_added<D: Device + ?Sized>(
        &mut self,
        device: &mut D,
        file: &DeviceFileRef,
    ) -> Result<bool, Error> {
        if !self.pattern.is_match(&file.directory) {
            debug!("Ignoring {}, folder does not match pattern", file);
            return Ok(false);
        }
        if !self.extensions.accepts(&file.name) {
            debug!("Ignoring {}, extension not recognized", file);
            return Ok(false);
        }

        info!("New file on device: {}", file);
        match self.engine.transfer_if_new(device, &mut self.tracker, file) {
            Ok(outcome) => Ok(outcome.transferred),
            Err(err) if err.is_session_error() => Err(err),
            Err(err) => {
                log_file_error(file, &err);
                Ok(false)
            }
        }
    }

    pub fn purge<D: Device + ?Sized>(&mut self, device: &mut D) -> Result<PurgeReport, Error> {
        let report = self.purger.purge_older_than(device, &mut self.tracker)?;
        if report.deleted > 0 || report.failed > 0 {
            info!(
                "Retention purge: {} deleted, {} failed",
                report.deleted, report.failed
            );
        }
        Ok(report)
    }
}

fn log_file_error(file: &DeviceFileRef, err: &Error) {
    match err {
        Error::StateDurability { .. } => {
            error!("Transfer state NOT saved for {}, device copy kept: {}", file, err)
        }
        _ => warn!("Skipping {}: {}", file, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::device::memory::{DeviceCall, IdleBehavior, MemoryDevice};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::fs;
    use tempfile::tempdir;

    fn settings(target: &std::path::Path, pattern: &str) -> Settings {
        let config = AppConfig {
            device_root: Some("/media/camera".to_string()),
            directory_pattern: pattern.to_string(),
            extensions: "jpg,cr2".to_string(),
            retention: std::time::Duration::from_secs(24 * 60 * 60),
            ..AppConfig::default()
        };
        Settings::resolve(&config, target).unwrap()
    }

    #[test]
    fn test_bootstrap_catches_up_on_existing_files() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        let now = Utc::now();
        device.add_file("/DCIM/100CANON", "IMG_0001.JPG", now, b"1");
        device.add_file("/DCIM/100CANON", "IMG_0002.CR2", now, b"2");
        device.add_file("/DCIM/100CANON", "NOTES.TXT", now, b"t");
        device.add_file("/MISC", "IMG_0003.JPG", now, b"3");

        let tracker = TransferTracker::open(&settings.state_path);
        let mut event_loop = EventLoop::new(&settings, tracker, Arc::new(AtomicBool::new(false)));
        let report = event_loop.bootstrap(&mut device).unwrap();

        assert_eq!(report.discovered, 2);
        assert_eq!(report.transferred, 2);
        assert_eq!(device.file_count(), 2);
        assert_eq!(event_loop.tracker().record().len(), 2);
    }

    #[test]
    fn test_session_transfers_new_files_and_purges_stale_ones() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        let now = Utc::now();
        let stale = device.add_file(
            "/DCIM/100CANON",
            "OLD.NEF",
            now - ChronoDuration::days(3),
            b"old",
        );
        let shot = device.capture("/DCIM/100CANON", "IMG_0100.JPG", now, b"new");
        device.set_idle_behavior(IdleBehavior::Disconnect);

        let tracker = TransferTracker::open(&settings.state_path);
        let mut event_loop = EventLoop::new(&settings, tracker, Arc::new(AtomicBool::new(false)));
        let err = event_loop.run(&mut device).unwrap_err();

        assert!(err.is_session_error());
        assert!(!device.contains(&shot));
        assert!(!device.contains(&stale));
        assert!(event_loop.tracker().contains(&shot));
    }

    #[test]
    fn test_events_outside_pattern_are_ignored() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        let file = device.add_file("/MISC", "IMG_0001.JPG", Utc::now(), b"x");

        let tracker = TransferTracker::open(&settings.state_path);
        let mut event_loop = EventLoop::new(&settings, tracker, Arc::new(AtomicBool::new(false)));
        assert!(!event_loop.handle_file_added(&mut device, &file).unwrap());
        assert!(device.contains(&file));
        assert_eq!(device.count_calls(|c| matches!(c, DeviceCall::Fetch(_))), 0);
    }

    #[test]
    fn test_vanished_file_does_not_end_session() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        device.add_directory("/DCIM/100CANON");
        device.push_event(DeviceEvent::FileAdded(DeviceFileRef::new(
            "/DCIM/100CANON",
            "GHOST.JPG",
        )));
        let real = device.capture("/DCIM/100CANON", "IMG_0001.JPG", Utc::now(), b"x");
        device.set_idle_behavior(IdleBehavior::Disconnect);

        let tracker = TransferTracker::open(&settings.state_path);
        let mut event_loop = EventLoop::new(&settings, tracker, Arc::new(AtomicBool::new(false)));
        let _ = event_loop.run(&mut device);

        assert!(event_loop.tracker().contains(&real));
    }

    #[test]
    fn test_stop_flag_ends_session_cleanly() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        let stop = Arc::new(AtomicBool::new(true));

        let tracker = TransferTracker::open(&settings.state_path);
        let mut event_loop = EventLoop::new(&settings, tracker, stop);
        event_loop.run(&mut device).unwrap();
        assert_eq!(device.count_calls(|c| *c == DeviceCall::WaitForEvent), 0);
    }

    #[test]
    fn test_stop_before_run_leaves_card_untouched() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        let old = Utc::now() - ChronoDuration::days(3);
        for i in 0..200 {
            device.add_file("/DCIM/100CANON", &format!("IMG_{:04}.JPG", i), old, b"x");
        }

        let tracker = TransferTracker::open(&settings.state_path);
        let stop = Arc::new(AtomicBool::new(true));
        let mut event_loop = EventLoop::new(&settings, tracker, stop);
        event_loop.run(&mut device).unwrap();

        assert_eq!(device.count_calls(|c| matches!(c, DeviceCall::Fetch(_))), 0);
        assert_eq!(device.count_calls(|c| matches!(c, DeviceCall::Delete(_))), 0);
        assert_eq!(device.file_count(), 200);
    }

    #[test]
    fn test_stop_during_scan_ends_it_at_next_file() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        for i in 0..200 {
            device.add_file("/DCIM/100CANON", &format!("IMG_{:04}.JPG", i), Utc::now(), b"x");
        }
        let stop = Arc::new(AtomicBool::new(false));
        let hook_stop = stop.clone();
        device.on_before_delete(move |_| hook_stop.store(true, Ordering::SeqCst));

        let tracker = TransferTracker::open(&settings.state_path);
        let mut event_loop = EventLoop::new(&settings, tracker, stop);
        let report = event_loop.bootstrap(&mut device).unwrap();

        assert!(report.interrupted);
        assert_eq!(report.transferred, 1);
        assert_eq!(device.count_calls(|c| matches!(c, DeviceCall::Fetch(_))), 1);
        assert_eq!(device.file_count(), 199);
    }

    #[test]
    fn test_other_events_are_ignored() {
        let tmp = tempdir().unwrap();
        let settings = settings(tmp.path(), "^/DCIM/.*");
        let mut device = MemoryDevice::new();
        device.push_event(DeviceEvent::Other("capture complete".to_string()));
        device.push_event(DeviceEvent::Timeout);
        device.set_idle_behavior(IdleBehavior::Disconnect);

        let tracker = TransferTracker::open(&settings.state_path);
        let mut event_loop = EventLoop::new(&settings, tracker, Arc::new(AtomicBool::new(false)));
        assert!(event_loop.run(&mut device).unwrap_err().is_session_error());
        assert_eq!(device.count_calls(|c| *c == DeviceCall::WaitForEvent), 3);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
