//! Configuration module for the scheduler service.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.
//!
//! The `[scheduler]` section is handed to the scheduler engine as-is; the
//! supervisor never interprets it beyond what the engine factory validates.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the scheduler service
#[derive(Parser, Debug, Default)]
#[command(name = "sched-service")]
#[command(author = "sched-service authors")]
#[command(version = "0.1.0")]
#[command(about = "Runs the job scheduler web server as a managed service", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address the HTTP server binds to (e.g., 0.0.0.0)
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Port the HTTP server binds to
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Number of scheduler dispatch threads
    #[arg(short = 't', long)]
    pub thread_pool_size: Option<usize>,

    /// Timezone used by the scheduler engine
    #[arg(long)]
    pub timezone: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_address")]
    pub address: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections held open by the event loop at once
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Settings passed through to the scheduler engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Engine implementation reference
    #[serde(default = "default_scheduler_class")]
    pub scheduler_class: String,
    /// Datastore implementation reference
    #[serde(default = "default_datastore_class")]
    pub datastore_class: String,
    /// Datastore connection parameters
    #[serde(default = "default_datastore")]
    pub datastore: BTreeMap<String, String>,
    /// Logical table name to physical table name
    #[serde(default = "default_tablenames")]
    pub tablenames: BTreeMap<String, String>,
    /// Collapse queued runs of the same job into one
    #[serde(default = "default_true")]
    pub job_coalesce: bool,
    /// Seconds a run may be late and still fire
    #[serde(default = "default_misfire_grace_sec")]
    pub job_misfire_grace_sec: u64,
    /// Concurrent runs allowed per job
    #[serde(default = "default_max_instances")]
    pub job_max_instances: usize,
    /// Dispatch threads
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Where job implementations are looked up
    #[serde(default = "default_job_class_packages")]
    pub job_class_packages: Vec<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            scheduler_class: default_scheduler_class(),
            datastore_class: default_datastore_class(),
            datastore: default_datastore(),
            tablenames: default_tablenames(),
            job_coalesce: true,
            job_misfire_grace_sec: default_misfire_grace_sec(),
            job_max_instances: default_max_instances(),
            thread_pool_size: default_thread_pool_size(),
            timezone: default_timezone(),
            job_class_packages: default_job_class_packages(),
        }
    }
}

/// Identity and pacing of the managed service
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_description")]
    pub description: String,
    /// How often the controlling thread re-checks the stop event
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            display_name: default_display_name(),
            description: default_description(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_max_connections() -> usize {
    1024
}

fn default_scheduler_class() -> String {
    "ndscheduler.corescheduler.core.base.BaseScheduler".to_string()
}

fn default_datastore_class() -> String {
    "ndscheduler.corescheduler.datastore.providers.sqlite.DatastoreSqlite".to_string()
}

fn default_datastore() -> BTreeMap<String, String> {
    BTreeMap::from([("file_path".to_string(), "datastore.db".to_string())])
}

fn default_tablenames() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("jobs_tablename".to_string(), "scheduler_jobs".to_string()),
        (
            "executions_tablename".to_string(),
            "scheduler_execution".to_string(),
        ),
        (
            "auditlogs_tablename".to_string(),
            "scheduler_jobauditlog".to_string(),
        ),
    ])
}

fn default_true() -> bool {
    true
}

fn default_misfire_grace_sec() -> u64 {
    3600
}

fn default_max_instances() -> usize {
    3
}

fn default_thread_pool_size() -> usize {
    4
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_job_class_packages() -> Vec<String> {
    vec!["simple_scheduler_win.jobs".to_string()]
}

fn default_service_name() -> String {
    "NDSchedulerService".to_string()
}

fn default_display_name() -> String {
    "NDScheduler".to_string()
}

fn default_description() -> String {
    "A service that runs the NDScheduler.".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "debug".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub max_connections: usize,
    pub scheduler: SchedulerSettings,
    pub service: ServiceConfig,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the file they name, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut scheduler = toml_config.scheduler;
        if let Some(size) = cli.thread_pool_size {
            scheduler.thread_pool_size = size;
        }
        if let Some(timezone) = cli.timezone {
            scheduler.timezone = timezone;
        }

        Config {
            address: cli.address.unwrap_or(toml_config.server.address),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: toml_config.server.max_connections,
            scheduler,
            service: toml_config.service,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("server address is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server max_connections must be at least 1".into(),
            ));
        }
        if self.service.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "service poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `address:port` as shown to operators.
    pub fn listen_display(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
