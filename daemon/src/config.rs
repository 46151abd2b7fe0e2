use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_socket_path() -> PathBuf { PathBuf::from(common::DEFAULT_SOCKET_PATH) }
fn default_database_path() -> PathBuf { PathBuf::from(common::DEFAULT_DB_PATH) }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
    /// Receives only run outcome records.
    pub runs_output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            runs_output: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<log::LevelFilter> {
        self.level
            .parse()
            .map_err(|_| anyhow!("Invalid log level: {}", self.level))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Successful archives kept per job. Zero disables retention.
    #[serde(default = "default_max_backups_per_job")]
    pub max_backups_per_job: usize,
}

fn default_max_backups_per_job() -> usize { 5 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_backups_per_job: default_max_backups_per_job(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local wall-clock time for daily jobs, `HH:MM`.
    #[serde(default = "default_daily_at")]
    pub daily_at: String,
}

fn default_daily_at() -> String { "02:00".to_string() }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { daily_at: default_daily_at() }
    }
}

impl ScheduleConfig {
    pub fn daily_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.daily_at.trim(), "%H:%M")
            .with_context(|| format!("Invalid schedule.daily_at: {:?} (expected HH:MM)", self.daily_at))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// Resolve the configuration for the daemon.
    ///
    /// An explicitly requested file must exist. The default location is
    /// optional and falls back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(common::DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.logging.level_filter()?;
        self.schedule.daily_time()?;
        Ok(())
    }
}
