//! Configuration for Mailout

use crate::types::{ClockTime, ExecutionMode};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "MAILOUT_CONFIG";

/// Prefix of environment overrides, e.g. `MAILOUT__DATABASE__URL`
pub const ENV_PREFIX: &str = "MAILOUT";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Send scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Unsubscribe link configuration
    #[serde(default)]
    pub unsubscribe: UnsubscribeConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Operator notification configuration
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// Send scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum deliveries per sending account per day
    #[serde(default = "default_daily_limit")]
    pub daily_limit: i32,

    /// Start of the business window (business time zone)
    #[serde(default = "default_business_start")]
    pub business_start: ClockTime,

    /// End of the business window (business time zone)
    #[serde(default = "default_business_end")]
    pub business_end: ClockTime,

    /// Weekdays on which nothing is sent
    #[serde(default = "default_disallowed_weekdays")]
    pub disallowed_weekdays: Vec<Weekday>,

    /// Offset of the business time zone from UTC, in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Lower bound of the random delay added to every wake-up
    #[serde(default = "default_wake_jitter_min")]
    pub wake_jitter_min_secs: u64,

    /// Upper bound of the random delay added to every wake-up
    #[serde(default = "default_wake_jitter_max")]
    pub wake_jitter_max_secs: u64,

    /// Lower bound of the pause after each successful delivery
    #[serde(default = "default_pacing_min")]
    pub pacing_min_secs: u64,

    /// Upper bound of the pause after each successful delivery
    #[serde(default = "default_pacing_max")]
    pub pacing_max_secs: u64,

    /// Execution mode; pacing is skipped outside production
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Key of the advisory lock held by the active scheduler
    #[serde(default = "default_lock_key")]
    pub lock_key: i64,

    /// Seconds between attempts to become the active scheduler
    #[serde(default = "default_lease_retry")]
    pub lease_retry_secs: u64,

    /// Unclassified failures within one campaign pass before operators are told
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            business_start: default_business_start(),
            business_end: default_business_end(),
            disallowed_weekdays: default_disallowed_weekdays(),
            utc_offset_minutes: 0,
            wake_jitter_min_secs: default_wake_jitter_min(),
            wake_jitter_max_secs: default_wake_jitter_max(),
            pacing_min_secs: default_pacing_min(),
            pacing_max_secs: default_pacing_max(),
            mode: ExecutionMode::default(),
            lock_key: default_lock_key(),
            lease_retry_secs: default_lease_retry(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

fn default_daily_limit() -> i32 {
    500
}

fn default_business_start() -> ClockTime {
    ClockTime::new(8, 30)
}

fn default_business_end() -> ClockTime {
    ClockTime::new(17, 30)
}

fn default_disallowed_weekdays() -> Vec<Weekday> {
    vec![Weekday::Sat, Weekday::Sun]
}

fn default_wake_jitter_min() -> u64 {
    60
}

fn default_wake_jitter_max() -> u64 {
    300
}

fn default_pacing_min() -> u64 {
    3
}

fn default_pacing_max() -> u64 {
    12
}

fn default_lock_key() -> i64 {
    0x6d61_696c_6f75_74 // "mailout"
}

fn default_lease_retry() -> u64 {
    30
}

fn default_escalation_threshold() -> u32 {
    3
}

/// Unsubscribe link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeConfig {
    /// Public base URL the token is appended to
    #[serde(default = "default_unsubscribe_base_url")]
    pub base_url: String,

    /// Where the endpoint redirects after unsubscribing
    pub redirect_url: Option<String>,
}

impl Default for UnsubscribeConfig {
    fn default() -> Self {
        Self {
            base_url: default_unsubscribe_base_url(),
            redirect_url: None,
        }
    }
}

fn default_unsubscribe_base_url() -> String {
    "http://localhost:8080/unsubscribe".to_string()
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,mailout=debug".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Operator notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Send notification emails (otherwise they are only logged)
    #[serde(default)]
    pub enabled: bool,

    /// Operator addresses
    #[serde(default)]
    pub operator_emails: Vec<String>,

    /// Sender address of notification emails
    pub from_address: Option<String>,

    /// Relay used for notification emails
    pub smtp_host: Option<String>,

    /// Relay port
    #[serde(default = "default_notification_port")]
    pub smtp_port: u16,

    /// Relay username
    pub smtp_username: Option<String>,

    /// Relay password
    pub smtp_password: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            operator_emails: Vec::new(),
            from_address: None,
            smtp_host: None,
            smtp_port: default_notification_port(),
            smtp_username: None,
            smtp_password: None,
        }
    }
}

fn default_notification_port() -> u16 {
    587
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first file found, overlaid with environment variables
    pub fn load() -> crate::Result<Self> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("./config.toml"));
        paths.push(PathBuf::from("/etc/mailout/config.toml"));

        let mut builder = config::Config::builder();
        match paths.iter().find(|p| p.exists()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Using configuration file");
                builder = builder.add_source(config::File::from(path.as_path()));
            }
            None => tracing::debug!("No configuration file found, using environment only"),
        }

        let config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> crate::Result<()> {
        if !matches!(self.database.backend.as_str(), "postgres" | "memory") {
            return Err(crate::Error::Config(format!(
                "Unknown database backend {}, expected postgres or memory",
                self.database.backend
            )));
        }

        let scheduler = &self.scheduler;
        let start = scheduler.business_start.to_naive()?;
        let end = scheduler.business_end.to_naive()?;
        if start >= end {
            return Err(crate::Error::Config(format!(
                "Business window start {} must precede end {}",
                scheduler.business_start, scheduler.business_end
            )));
        }
        if scheduler.disallowed_weekdays.len() >= 7 {
            return Err(crate::Error::Config(
                "At least one weekday must allow sending".to_string(),
            ));
        }
        if scheduler.daily_limit < 0 {
            return Err(crate::Error::Config(
                "daily_limit must not be negative".to_string(),
            ));
        }
        if scheduler.wake_jitter_min_secs > scheduler.wake_jitter_max_secs
            || scheduler.pacing_min_secs > scheduler.pacing_max_secs
        {
            return Err(crate::Error::Config(
                "Jitter and pacing minimums must not exceed their maximums".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let server = ServerConfig::default();
        assert_eq!(server.hostname, "localhost");

        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.daily_limit, 500);
        assert_eq!(scheduler.business_start, ClockTime::new(8, 30));
        assert_eq!(scheduler.business_end, ClockTime::new(17, 30));
        assert_eq!(scheduler.disallowed_weekdays, vec![Weekday::Sat, Weekday::Sun]);
        assert_eq!(scheduler.mode, ExecutionMode::Production);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
backend = "postgres"
url = "postgres://localhost/crm"

[scheduler]
daily_limit = 100
business_start = { hour = 9, minute = 0 }
business_end = { hour = 18, minute = 15 }
disallowed_weekdays = ["Fri", "Sat", "Sun"]
mode = "test"

[unsubscribe]
base_url = "https://crm.example.com/unsubscribe"
redirect_url = "https://example.com/bye"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/crm"));
        assert_eq!(config.scheduler.daily_limit, 100);
        assert_eq!(config.scheduler.business_end, ClockTime::new(18, 15));
        assert_eq!(
            config.scheduler.disallowed_weekdays,
            vec![Weekday::Fri, Weekday::Sat, Weekday::Sun]
        );
        assert_eq!(config.scheduler.mode, ExecutionMode::Test);
        assert_eq!(
            config.unsubscribe.redirect_url.as_deref(),
            Some("https://example.com/bye")
        );
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let toml = r#"
[database]
backend = "memory"

[scheduler]
business_start = { hour = 18, minute = 0 }
business_end = { hour = 9, minute = 0 }
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_closed_week() {
        let mut config: Config = toml::from_str("[database]\nbackend = \"memory\"\n").unwrap();
        config.scheduler.disallowed_weekdays = vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let config: Config = toml::from_str("[database]\nbackend = \"postgress\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("postgress"));
    }
}
