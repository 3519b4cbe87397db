//! Configuration for the automation engine.
//!
//! Read from `.automation/automation.toml` by default, then overridden by
//! `AUTOMATION_*` environment variables, then by CLI flags.
//!
//! ```toml
//! [environment]
//! name = "dev"
//! production_name = "prod"
//!
//! [store]
//! backend = "sqlite"
//! path = ".automation/metadata.db"
//! max_attempts = 20
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [schedule]
//! job_timeout_minutes = 30
//! job_grace_minutes = 5
//! task_ttl_minutes = 55
//! iteration_interval_minutes = 60
//! verify_delay_minutes = 120
//!
//! [identities]
//! capacity = 9
//! max_identities = 100
//! allocation_attempts = 100
//! allocation_delay_ms = 500
//! provisioning_pause_ms = 1000
//! prefix = "automation-sa"
//!
//! [tables]
//! prefix = "automation_dummy"
//! source_table = "billing_export_sample"
//! schema_template = "billing_export_v1"
//!
//! [dispatch]
//! mode = "inline"
//! base_url = "http://127.0.0.1:8080"
//!
//! [notifications]
//! webhook_url = ""
//! channel = "#billing-data-pipe-automation-results"
//!
//! [logging]
//! format = "pretty"
//! dir = ""
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::automation::identity::PoolSettings;
use crate::automation::manager::ManagerSettings;
use crate::automation::orchestrator::OrchestratorSettings;
use crate::automation::task::ExecutorSettings;

pub const DEFAULT_CONFIG_PATH: &str = ".automation/automation.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => anyhow::bail!("Invalid store backend '{}'. Valid values: sqlite, memory", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run tasks in process.
    #[default]
    Inline,
    /// POST tasks to the `/automation/task` endpoint.
    Http,
}

impl std::str::FromStr for DispatchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "http" => Ok(Self::Http),
            _ => anyhow::bail!("Invalid dispatch mode '{}'. Valid values: inline, http", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default = "default_env_name")]
    pub name: String,
    /// The engine refuses to run steps when `name` equals this.
    #[serde(default = "default_production_name")]
    pub production_name: String,
}

fn default_env_name() -> String {
    "dev".to_string()
}

fn default_production_name() -> String {
    "prod".to_string()
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            name: default_env_name(),
            production_name: default_production_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Retry bound for metadata transactions.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".automation/metadata.db")
}

fn default_max_attempts() -> u32 {
    crate::automation::store::DEFAULT_MAX_ATTEMPTS
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSection {
    #[serde(default = "default_job_timeout")]
    pub job_timeout_minutes: i64,
    #[serde(default = "default_job_grace")]
    pub job_grace_minutes: i64,
    #[serde(default = "default_task_ttl")]
    pub task_ttl_minutes: i64,
    /// Scheduler cadence; each task writes `rows_per_hour * interval / 60` rows per iteration.
    #[serde(default = "default_iteration_interval")]
    pub iteration_interval_minutes: i64,
    #[serde(default = "default_verify_delay")]
    pub verify_delay_minutes: i64,
}

fn default_job_timeout() -> i64 {
    30
}

fn default_job_grace() -> i64 {
    5
}

fn default_task_ttl() -> i64 {
    55
}

fn default_iteration_interval() -> i64 {
    60
}

fn default_verify_delay() -> i64 {
    120
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            job_timeout_minutes: default_job_timeout(),
            job_grace_minutes: default_job_grace(),
            task_ttl_minutes: default_task_ttl(),
            iteration_interval_minutes: default_iteration_interval(),
            verify_delay_minutes: default_verify_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitiesSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_identities")]
    pub max_identities: usize,
    #[serde(default = "default_allocation_attempts")]
    pub allocation_attempts: u32,
    #[serde(default = "default_allocation_delay_ms")]
    pub allocation_delay_ms: u64,
    #[serde(default = "default_provisioning_pause_ms")]
    pub provisioning_pause_ms: u64,
    #[serde(default = "default_identity_prefix")]
    pub prefix: String,
}

fn default_capacity() -> usize {
    9
}

fn default_max_identities() -> usize {
    100
}

fn default_allocation_attempts() -> u32 {
    100
}

fn default_allocation_delay_ms() -> u64 {
    500
}

fn default_provisioning_pause_ms() -> u64 {
    1000
}

fn default_identity_prefix() -> String {
    "automation-sa".to_string()
}

impl Default for IdentitiesSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_identities: default_max_identities(),
            allocation_attempts: default_allocation_attempts(),
            allocation_delay_ms: default_allocation_delay_ms(),
            provisioning_pause_ms: default_provisioning_pause_ms(),
            prefix: default_identity_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablesSection {
    #[serde(default = "default_table_prefix")]
    pub prefix: String,
    #[serde(default = "default_source_table")]
    pub source_table: String,
    #[serde(default = "default_schema_template")]
    pub schema_template: String,
}

fn default_table_prefix() -> String {
    "automation_dummy".to_string()
}

fn default_source_table() -> String {
    "billing_export_sample".to_string()
}

fn default_schema_template() -> String {
    "billing_export_v1".to_string()
}

impl Default for TablesSection {
    fn default() -> Self {
        Self {
            prefix: default_table_prefix(),
            source_table: default_source_table(),
            schema_template: default_schema_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsSection {
    /// Empty means log-only.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "#billing-data-pipe-automation-results".to_string()
}

impl Default for NotificationsSection {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            channel: default_channel(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a daily rolling log file; empty logs to stderr only.
    #[serde(default)]
    pub dir: String,
}

/// The complete automation.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationToml {
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub identities: IdentitiesSection,
    #[serde(default)]
    pub tables: TablesSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub notifications: NotificationsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AutomationToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse automation.toml")
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize automation.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `AUTOMATION_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; returns warnings for values that did not parse.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        if let Some(name) = lookup("AUTOMATION_ENV") {
            self.environment.name = name;
        }
        if let Some(backend) = lookup("AUTOMATION_STORE_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.store.backend = backend,
                Err(e) => warnings.push(format!("AUTOMATION_STORE_BACKEND: {}", e)),
            }
        }
        if let Some(path) = lookup("AUTOMATION_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(port) = lookup("AUTOMATION_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warnings.push(format!("AUTOMATION_PORT: invalid port '{}'", port)),
            }
        }
        if let Some(mode) = lookup("AUTOMATION_DISPATCH_MODE") {
            match mode.parse() {
                Ok(mode) => self.dispatch.mode = mode,
                Err(e) => warnings.push(format!("AUTOMATION_DISPATCH_MODE: {}", e)),
            }
        }
        if let Some(url) = lookup("AUTOMATION_DISPATCH_URL") {
            self.dispatch.base_url = url;
        }
        if let Some(url) = lookup("AUTOMATION_WEBHOOK_URL") {
            self.notifications.webhook_url = url;
        }
        if let Some(format) = lookup("AUTOMATION_LOG_FORMAT") {
            match format.parse() {
                Ok(format) => self.logging.format = format,
                Err(e) => warnings.push(format!("AUTOMATION_LOG_FORMAT: {}", e)),
            }
        }

        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.identities.capacity == 0 {
            warnings.push("identities.capacity is 0: no account can ever be allocated".to_string());
        }
        if self.identities.max_identities == 0 {
            warnings.push("identities.max_identities is 0: the identity pool stays empty".to_string());
        }
        if self.identities.allocation_attempts == 0 {
            warnings.push("identities.allocation_attempts is 0: allocation never retries".to_string());
        }
        if self.store.max_attempts == 0 {
            warnings.push("store.max_attempts is 0: treated as 1".to_string());
        }
        if self.schedule.task_ttl_minutes <= 0 {
            warnings.push(format!(
                "schedule.task_ttl_minutes {} should be positive",
                self.schedule.task_ttl_minutes
            ));
        }
        if self.schedule.job_timeout_minutes <= 0 {
            warnings.push(format!(
                "schedule.job_timeout_minutes {} should be positive",
                self.schedule.job_timeout_minutes
            ));
        }
        if self.schedule.iteration_interval_minutes <= 0 {
            warnings.push(format!(
                "schedule.iteration_interval_minutes {} should be positive",
                self.schedule.iteration_interval_minutes
            ));
        }
        if self.environment.name == self.environment.production_name {
            warnings.push(format!(
                "environment '{}' is the production environment: automation steps will refuse to run",
                self.environment.name
            ));
        }
        if self.dispatch.mode == DispatchMode::Http && !self.dispatch.base_url.starts_with("http") {
            warnings.push(format!(
                "dispatch.base_url '{}' is not an http(s) URL",
                self.dispatch.base_url
            ));
        }

        warnings
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            capacity: self.identities.capacity,
            max_identities: self.identities.max_identities,
            allocation_attempts: self.identities.allocation_attempts,
            allocation_delay: Duration::from_millis(self.identities.allocation_delay_ms),
            provisioning_pause: Duration::from_millis(self.identities.provisioning_pause_ms),
            prefix: self.identities.prefix.clone(),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            job_timeout: chrono::Duration::minutes(self.schedule.job_timeout_minutes),
            job_grace: chrono::Duration::minutes(self.schedule.job_grace_minutes),
            source_table: self.tables.source_table.clone(),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            environment: self.environment.name.clone(),
            production_environment: self.environment.production_name.clone(),
            task_ttl: chrono::Duration::minutes(self.schedule.task_ttl_minutes),
            job_timeout: chrono::Duration::minutes(self.schedule.job_timeout_minutes),
            iteration_interval: chrono::Duration::minutes(self.schedule.iteration_interval_minutes),
            table_prefix: self.tables.prefix.clone(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            verify_delay: chrono::Duration::minutes(self.schedule.verify_delay_minutes),
            table_prefix: self.tables.prefix.clone(),
            schema_template: self.tables.schema_template.clone(),
        }
    }
}
