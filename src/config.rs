use crate::error::Error;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_EXTENSIONS: &str =
    ".jpg,.jpeg,.png,.heic,.tif,.tiff,.cr2,.cr3,.nef,.arw,.raf,.orf,.rw2,.dng,.mov,.mp4";
const STATE_FILE_NAME: &str = ".tether-state";

/// Raw configuration as read from `Tether.*` and `TETHER_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub device_root: Option<String>,
    #[serde(default = "default_directory_pattern")]
    pub directory_pattern: String,
    #[serde(default = "default_extensions")]
    pub extensions: String,
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
    pub state_path: Option<String>,
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_track_transfers")]
    pub track_transfers: bool,
}

fn default_directory_pattern() -> String {
    "^/.*".to_string()
}

fn default_extensions() -> String {
    DEFAULT_EXTENSIONS.to_string()
}

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_event_timeout_ms() -> u64 {
    3000
}

fn default_reconnect_backoff_secs() -> u64 {
    5
}

fn default_track_transfers() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_root: None,
            directory_pattern: default_directory_pattern(),
            extensions: default_extensions(),
            retention: default_retention(),
            state_path: None,
            event_timeout_ms: default_event_timeout_ms(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            track_transfers: default_track_transfers(),
        }
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Tether").required(false))
        .add_source(Environment::with_prefix("TETHER"))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Load from an explicit file only, without the environment overlay.
pub fn load_configuration_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::from(path))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Case-insensitive set of recognized extensions, each with a leading dot.
/// An empty filter accepts every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn parse(list: &str) -> Self {
        let mut extensions: Vec<String> = list
            .split(',')
            .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .map(|ext| format!(".{}", ext))
            .collect();
        extensions.sort();
        extensions.dedup();
        Self { extensions }
    }

    pub fn accepts(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = format!(".{}", ext.to_lowercase());
        self.extensions.iter().any(|known| *known == ext)
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }
}

/// Compile a directory pattern: anchored at the start of the full device
/// path and matched case-insensitively.
pub fn compile_directory_pattern(pattern: &str) -> Result<Regex, Error> {
    // Wrapped even when it already starts with `^`, so every top-level
    // alternative is anchored too.
    let anchored = format!("^(?:{})", pattern);
    Ok(RegexBuilder::new(&anchored).case_insensitive(true).build()?)
}

/// Validated configuration handed to the components at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub device_root: PathBuf,
    pub target_dir: PathBuf,
    pub state_path: PathBuf,
    pub directory_pattern: Regex,
    pub extensions: ExtensionFilter,
    pub retention: chrono::Duration,
    pub event_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub track_transfers: bool,
}

impl Settings {
    pub fn resolve(config: &AppConfig, target_dir: &Path) -> Result<Settings, Error> {
        let device_root = match config.device_root.as_deref().map(str::trim) {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => {
                return Err(Error::InvalidConfig(
                    "device_root is not set (set it in Tether.toml or TETHER_DEVICE_ROOT)"
                        .to_string(),
                ))
            }
        };

        let directory_pattern = compile_directory_pattern(&config.directory_pattern)?;

        if config.retention.is_zero() {
            return Err(Error::InvalidConfig(
                "retention must be greater than zero".to_string(),
            ));
        }
        let retention = chrono::Duration::from_std(config.retention).map_err(|_| {
            Error::InvalidConfig(format!("retention {:?} is out of range", config.retention))
        })?;

        if config.event_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "event_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if config.reconnect_backoff_secs == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_backoff_secs must be greater than zero".to_string(),
            ));
        }

        let state_path = match config.state_path.as_deref() {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => target_dir.join(STATE_FILE_NAME),
        };

        Ok(Settings {
            device_root,
            target_dir: target_dir.to_path_buf(),
            state_path,
            directory_pattern,
            extensions: ExtensionFilter::parse(&config.extensions),
            retention,
            event_timeout: Duration::from_millis(config.event_timeout_ms),
            reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
            track_transfers: config.track_transfers,
        })
    }
}
