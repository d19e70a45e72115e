use crate::device::DeviceFileMetadata;
use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;

const NAME_PREFIX: &str = "photo_";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const TOKEN_LEN: usize = 6;

/// Derive the local file name for a device file:
/// `photo_<YYYY-MM-DD_HH-MM-SS>_<token><.ext>`.
///
/// The timestamp is the device-reported modification time in local time and
/// the token is random per call, so two calls for the same file give
/// different names. Collisions between distinct files are unlikely but not
/// impossible; the caller never overwrites an existing file.
pub fn derive_local_name(metadata: &DeviceFileMetadata) -> String {
    let timestamp = metadata
        .modified
        .with_timezone(&Local)
        .format(TIMESTAMP_FORMAT);
    format!(
        "{}{}_{}{}",
        NAME_PREFIX,
        timestamp,
        random_token(),
        extension_of(&metadata.file.name)
    )
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Extension with its leading dot, original case kept. Empty if none.
fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}
