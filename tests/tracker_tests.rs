use std::fs;

use tempfile::tempdir;
use tether_sync::{DeviceFileRef, TransferRecord, TransferTracker};

fn sample_refs() -> Vec<DeviceFileRef> {
    vec![
        DeviceFileRef::new("/DCIM/100CANON", "IMG_0001.JPG"),
        DeviceFileRef::new("/DCIM/100CANON", "IMG_0001.CR2"),
        DeviceFileRef::new("/DCIM/101CANON", "img_0001.jpg"),
        DeviceFileRef::new("/", "MVI_0002.MOV"),
    ]
}

#[test]
fn test_round_trip_across_restart() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("state");

    let mut expected = TransferRecord::default();
    {
        let mut tracker = TransferTracker::open(&path);
        for file in sample_refs() {
            tracker.mark_transferred(&file).unwrap();
            expected.insert(file);
        }
    }

    let reopened = TransferTracker::open(&path);
    assert_eq!(reopened.record(), &expected);
    assert_eq!(reopened.record().len(), 4);
}

#[test]
fn test_missing_state_loads_empty() {
    let tmp = tempdir().unwrap();
    let tracker = TransferTracker::open(tmp.path().join("never-written"));
    assert!(tracker.record().is_empty());
}

#[test]
fn test_corrupt_state_loads_empty() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("state");
    fs::write(&path, b"this is not a transfer record").unwrap();

    let tracker = TransferTracker::open(&path);
    assert!(tracker.record().is_empty());
}

#[test]
fn test_truncated_state_loads_empty() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("state");
    {
        let mut tracker = TransferTracker::open(&path);
        for file in sample_refs() {
            tracker.mark_transferred(&file).unwrap();
        }
    }
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    assert!(TransferTracker::load(&path).is_empty());
}

#[test]
fn test_corrupt_state_is_replaced_on_next_mark() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("state");
    fs::write(&path, [0xFFu8; 3]).unwrap();

    let file = DeviceFileRef::new("/DCIM", "IMG_0001.JPG");
    let mut tracker = TransferTracker::open(&path);
    tracker.mark_transferred(&file).unwrap();

    let reloaded = TransferTracker::load(&path);
    assert!(reloaded.contains(&file));
    assert_eq!(reloaded.len(), 1);
}
