//! Settings Storage
//!
//! Handles reading/writing the core settings file.
//! Data location: ~/.termunator on macOS/Linux, %APPDATA%\Termunator on Windows

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::vault::KdfParams;

/// Passphrase used when no master passphrase has been supplied
pub const FALLBACK_PASSPHRASE: &str = "default_key";

/// Environment variable consulted for the master passphrase
pub const DEFAULT_PASSPHRASE_ENV: &str = "TERMUNATOR_MASTER_KEY";

/// Settings storage errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to determine data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the data directory
pub fn data_dir() -> Result<PathBuf, SettingsError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("Termunator"));
        }
        dirs::home_dir()
            .map(|home| home.join(".termunator"))
            .ok_or(SettingsError::NoDataDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".termunator"))
            .ok_or(SettingsError::NoDataDir)
    }
}

/// Default trust store location, shared with OpenSSH
pub fn default_known_hosts_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".ssh").join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from("known_hosts"))
}

/// Where the master passphrase comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassphraseSource {
    /// Read from an environment variable
    Env { var: String },
    /// Fixed passphrase
    Literal { passphrase: String },
}

impl Default for PassphraseSource {
    fn default() -> Self {
        Self::Env {
            var: DEFAULT_PASSPHRASE_ENV.to_string(),
        }
    }
}

impl PassphraseSource {
    /// Resolve the passphrase, falling back to the placeholder when the
    /// environment variable is unset
    pub fn resolve(&self) -> String {
        match self {
            PassphraseSource::Env { var } => match std::env::var(var) {
                Ok(value) if !value.is_empty() => value,
                _ => {
                    tracing::warn!(
                        "{} not set, using placeholder master passphrase",
                        var
                    );
                    FALLBACK_PASSPHRASE.to_string()
                }
            },
            PassphraseSource::Literal { passphrase } => passphrase.clone(),
        }
    }
}

/// Output pump timings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Bounded read deadline per pump iteration
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Delay after a read error before retrying
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Idle delay between iterations
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_error_backoff_ms() -> u64 {
    100
}

fn default_idle_delay_ms() -> u64 {
    10
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            idle_delay_ms: default_idle_delay_ms(),
        }
    }
}

/// Core settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the salt file and settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Trust store file (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    /// Dial + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_cols")]
    pub default_cols: u32,

    #[serde(default = "default_rows")]
    pub default_rows: u32,

    #[serde(default)]
    pub output: OutputSettings,

    #[serde(default)]
    pub kdf: KdfParams,

    #[serde(default)]
    pub passphrase: PassphraseSource,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            known_hosts_path: None,
            connect_timeout_secs: default_connect_timeout(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            output: OutputSettings::default(),
            kdf: KdfParams::default(),
            passphrase: PassphraseSource::default(),
        }
    }
}

impl Settings {
    pub fn resolved_data_dir(&self) -> Result<PathBuf, SettingsError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => data_dir(),
        }
    }

    pub fn salt_path(&self) -> Result<PathBuf, SettingsError> {
        Ok(self.resolved_data_dir()?.join("salt"))
    }

    pub fn resolved_known_hosts_path(&self) -> PathBuf {
        self.known_hosts_path
            .clone()
            .unwrap_or_else(default_known_hosts_path)
    }
}

/// Settings file manager
pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    /// Storage at the default location
    pub fn new() -> Result<Self, SettingsError> {
        Ok(Self {
            path: data_dir()?.join("settings.json"),
        })
    }

    /// Storage with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load settings from disk
    /// Returns defaults if the file doesn't exist
    /// If the file is corrupted, backs it up and returns defaults
    pub async fn load(&self) -> Result<Settings, SettingsError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(settings) => Ok(settings),
                Err(e) => {
                    tracing::warn!("Settings file corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted settings backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted settings: {}", backup_err);
                        }
                    }

                    Ok(Settings::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(SettingsError::Io(e)),
        }
    }

    /// Save settings to disk (write to temp file, then rename)
    pub async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current settings file aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, SettingsError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
