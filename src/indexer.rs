use crate::device::{join_device_path, Device, DeviceError};
use regex::Regex;
use std::collections::HashSet;

/// Depth-first walk of the device's directory tree from `/`, returning every
/// directory whose full path matches `pattern`, in visit order.
///
/// The root itself is evaluated too. Nothing on the device is modified.
pub fn list_matching_directories<D: Device + ?Sized>(
    device: &mut D,
    pattern: &Regex,
) -> Result<Vec<String>, DeviceError> {
    let mut visited = HashSet::new();
    let mut matches = Vec::new();
    visit_dirs(device, "/", pattern, &mut visited, &mut matches)?;
    Ok(matches)
}

fn visit_dirs<D: Device + ?Sized>(
    device: &mut D,
    dir: &str,
    pattern: &Regex,
    visited: &mut HashSet<String>,
    matches: &mut Vec<String>,
) -> Result<(), DeviceError> {
    if !visited.insert(dir.to_string()) {
        return Ok(());
    }

    if pattern.is_match(dir) {
        matches.push(dir.to_string());
    }

    for child in device.list_subdirectories(dir)? {
        let path = join_device_path(dir, &child);
        visit_dirs(device, &path, pattern, visited, matches)?;
    }

    Ok(())
}
