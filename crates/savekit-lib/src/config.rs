use crate::types::Job;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(rename = "job", default)]
    pub jobs: Vec<Job>,
}

/// Global settings shared by every job run.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GlobalConfig {
    /// Process names that prevent jobs from starting or progressing while running.
    #[serde(default)]
    pub blocked_processes: Vec<String>,
    /// Extensions whose files are copied before other jobs' regular files.
    #[serde(default)]
    pub priority_extensions: Vec<String>,
    /// Files at or above this size hold the transfer throttle while copying.
    #[serde(default = "default_large_file_threshold_kb")]
    pub large_file_threshold_kb: u64,
    /// Timeout of one crypto IPC round trip.
    #[serde(default = "default_ipc_timeout")]
    pub ipc_timeout_secs: u64,
    /// How often a blocked job re-checks the process list.
    #[serde(default = "default_blocked_poll")]
    pub blocked_poll_millis: u64,
    /// Override for the live-state document location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_state_path: Option<PathBuf>,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

fn default_large_file_threshold_kb() -> u64 {
    10 * 1024
}

fn default_ipc_timeout() -> u64 {
    60
}

fn default_blocked_poll() -> u64 {
    500
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            blocked_processes: Vec::new(),
            priority_extensions: Vec::new(),
            large_file_threshold_kb: default_large_file_threshold_kb(),
            ipc_timeout_secs: default_ipc_timeout(),
            blocked_poll_millis: default_blocked_poll(),
            live_state_path: None,
            encryption: EncryptionConfig::default(),
        }
    }
}

/// Snapshot encryption settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Allow-list of extensions to encrypt inside each snapshot.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl Config {
    /// Validates the configuration, ensuring unique job names and non-empty fields.
    /// Also expands `~/` in source and target paths.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for job in &mut self.jobs {
            validate_job(job)?;
            if !names.insert(job.name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate job name: {}",
                    job.name
                )));
            }
            job.source = expand_home(&job.source);
            job.target = expand_home(&job.target);
        }
        Ok(())
    }
}

/// Checks the invariants of a single job.
pub fn validate_job(job: &Job) -> Result<(), ConfigError> {
    if job.name.trim().is_empty() {
        return Err(ConfigError::Validation("Job name cannot be empty".into()));
    }
    if job.name.contains('/') {
        return Err(ConfigError::Validation(format!(
            "Job name '{}' cannot contain '/'",
            job.name
        )));
    }
    if job.source.as_os_str().is_empty() {
        return Err(ConfigError::Validation(format!(
            "Job '{}' must have a source",
            job.name
        )));
    }
    if job.target.as_os_str().is_empty() {
        return Err(ConfigError::Validation(format!(
            "Job '{}' must have a target",
            job.name
        )));
    }
    Ok(())
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Loads the configuration from the environment variable `SAVEKIT_CONFIG`
/// or the default system location (`~/.config/savekit/config.toml`).
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be found, read, or parsed,
/// or if validation fails.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&crate::paths::active_config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Config file not found: {:?}", path),
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Like [`load_config_from`], but a missing file yields an empty job list.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        load_config_from(path)
    } else {
        Ok(Config::default())
    }
}

/// Writes the configuration back to disk through a temporary sibling file.
pub fn save_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
