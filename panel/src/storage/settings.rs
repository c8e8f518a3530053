//! Settings file management

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::PanelError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/micropanel/settings.json";

const MIB: u64 = 1024 * 1024;

/// Panel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rotated log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub sites: SitesSettings,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub limits: LimitSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            sites: SitesSettings::default(),
            ledger: LedgerSettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

/// Sites base directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitesSettings {
    #[serde(default = "default_sites_path")]
    pub path: PathBuf,
}

fn default_sites_path() -> PathBuf {
    PathBuf::from("/var/www/panel/sites")
}

impl Default for SitesSettings {
    fn default() -> Self {
        Self {
            path: default_sites_path(),
        }
    }
}

/// Deploy ledger location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("/var/lib/micropanel/deploys")
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

/// Upload and extraction limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum size of the uploaded archive in bytes
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: u64,

    /// Maximum uncompressed size of a single entry in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum number of entries in an archive
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum length of an entry name in characters
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,

    /// Maximum total uncompressed bytes written to staging
    #[serde(default = "default_max_extracted_size")]
    pub max_extracted_size: u64,
}

fn default_max_archive_size() -> u64 {
    100 * MIB
}

fn default_max_file_size() -> u64 {
    10 * MIB
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_path_length() -> usize {
    500
}

fn default_max_extracted_size() -> u64 {
    1024 * MIB
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_archive_size: default_max_archive_size(),
            max_file_size: default_max_file_size(),
            max_entries: default_max_entries(),
            max_path_length: default_max_path_length(),
            max_extracted_size: default_max_extracted_size(),
        }
    }
}

/// Runtime limits used by the release pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_archive_size: u64,
    pub max_file_size: u64,
    pub max_entries: usize,
    pub max_path_length: usize,
    pub max_extracted_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        LimitSettings::default().into()
    }
}

impl From<LimitSettings> for Limits {
    fn from(s: LimitSettings) -> Self {
        Self {
            max_archive_size: s.max_archive_size,
            max_file_size: s.max_file_size,
            max_entries: s.max_entries,
            max_path_length: s.max_path_length,
            max_extracted_size: s.max_extracted_size,
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing, then apply environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PanelError> {
        let file = File::new(path.as_ref());
        let mut settings = if file.exists().await {
            debug!("Loading settings from {}", file.path().display());
            file.read_json::<Settings>().await.map_err(|e| {
                PanelError::ConfigError(format!("{}: {}", file.path().display(), e))
            })?
        } else {
            debug!("No settings file at {}, using defaults", file.path().display());
            Settings::default()
        };

        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply overrides looked up through `var`.
    ///
    /// Numeric values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("SITES_PATH").filter(|v| !v.is_empty()) {
            self.sites.path = PathBuf::from(path);
        }
        if let Some(path) = var("LEDGER_PATH").filter(|v| !v.is_empty()) {
            self.ledger.path = PathBuf::from(path);
        }
        if let Some(level) = var("LOG_LEVEL") {
            match level.parse() {
                Ok(level) => self.log_level = level,
                Err(e) => warn!("Ignoring LOG_LEVEL: {}", e),
            }
        }
        if let Some(size) = var("MAX_ZIP_SIZE").and_then(|v| v.parse().ok()) {
            self.limits.max_archive_size = size;
        }
        if let Some(size) = var("MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
            self.limits.max_file_size = size;
        }
        if let Some(count) = var("MAX_ARCHIVE_ENTRIES").and_then(|v| v.parse().ok()) {
            self.limits.max_entries = count;
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits.clone().into()
    }
}
