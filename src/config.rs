use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Port of the control server when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8087;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub log_dir: Option<String>,
    pub jobs_dir: Option<String>,
    pub server: ServerConfig,
    pub shutdown: ShutdownConfig,
    pub front_end: FrontEndConfig,
    pub discord: DiscordConfig,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FrontEndConfig {
    pub headless: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub token: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub chat_id: String,
}

/// One background job discovered under the jobs directory.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobConfig {
    #[serde(skip)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub autostart: bool,
}

impl Config {
    pub fn tether_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tether"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::tether_dir()?.join("tether.toml"))
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields defaults.
    ///
    /// The result is not validated, so that command-line overrides can be
    /// applied first. Call [`Config::validate`] on the final value.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Validation("server.port must not be 0".to_string()));
        }
        if self.shutdown.grace_secs == 0 {
            return Err(Error::Validation(
                "shutdown.grace_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_secs)
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::tether_dir()?.join("logs")),
        }
    }

    pub fn jobs_dir(&self) -> Result<PathBuf> {
        match &self.jobs_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::tether_dir()?.join("jobs")),
        }
    }

    /// Read every `<jobs_dir>/<name>/job.toml`.
    ///
    /// Sub-directories that are missing a job file or fail to parse are logged
    /// and skipped. A `template` directory is never loaded.
    pub fn load_jobs(&self) -> Result<Vec<JobConfig>> {
        load_jobs_from(&self.jobs_dir()?)
    }
}

pub fn load_jobs_from(dir: &Path) -> Result<Vec<JobConfig>> {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "jobs directory not found");
        return Ok(Vec::new());
    }

    let mut jobs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable jobs entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "template" {
            continue;
        }

        let file = path.join("job.toml");
        let raw = match fs::read_to_string(&file) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(job = %name, error = %e, "skipping job without a readable job.toml");
                continue;
            }
        };
        match toml::from_str::<JobConfig>(&raw) {
            Ok(mut job) => {
                job.name = name;
                jobs.push(job);
            }
            Err(e) => {
                tracing::warn!(job = %name, error = %e, "skipping job with invalid job.toml");
            }
        }
    }
    jobs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(jobs)
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
