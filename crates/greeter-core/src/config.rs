//! Greeter configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GreeterError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeterConfig {
    /// Message records, the job queue and run bookkeeping live here.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Read-only user table maintained by the user-management API.
    #[serde(default = "default_users_database_path")]
    pub users_database_path: String,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_database_path() -> String { "~/.greeter/greeter.db".into() }
fn default_users_database_path() -> String { "~/.greeter/users.db".into() }

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            users_database_path: default_users_database_path(),
            schedule: ScheduleConfig::default(),
            worker: WorkerConfig::default(),
            breaker: BreakerConfig::default(),
            sender: SenderConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl GreeterConfig {
    /// Load config from the default path (~/.greeter/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GreeterError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| GreeterError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| GreeterError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Greeter home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".greeter")
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.schedule.send_hour > 23 {
            return Err(GreeterError::Config(format!(
                "schedule.send_hour must be 0..=23, got {}",
                self.schedule.send_hour
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(GreeterError::Config("worker.concurrency must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.breaker.error_rate_threshold) {
            return Err(GreeterError::Config(
                "breaker.error_rate_threshold must be within 0.0..=1.0".into(),
            ));
        }
        // A QUEUED record waiting out the longest backoff must not look stale.
        if self.schedule.staleness_timeout_secs <= 15 * 60 {
            return Err(GreeterError::Config(
                "schedule.staleness_timeout_secs must exceed the 15 minute max backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Periodic trigger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local wall-clock hour messages are sent at.
    #[serde(default = "default_send_hour")]
    pub send_hour: u32,
    #[serde(default = "default_eligibility_interval")]
    pub eligibility_interval_secs: u64,
    #[serde(default = "default_lookahead_hours")]
    pub lookahead_hours: u64,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,
    #[serde(default = "default_dispatch_window")]
    pub dispatch_window_secs: u64,
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
    #[serde(default = "default_staleness_timeout")]
    pub staleness_timeout_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

fn default_send_hour() -> u32 { 9 }
fn default_eligibility_interval() -> u64 { 24 * 60 * 60 }
fn default_lookahead_hours() -> u64 { 48 }
fn default_lookback_hours() -> u64 { 1 }
fn default_dispatch_interval() -> u64 { 60 }
fn default_dispatch_window() -> u64 { 60 }
fn default_dispatch_batch_size() -> usize { 500 }
fn default_recovery_interval() -> u64 { 60 * 60 }
fn default_staleness_timeout() -> u64 { 30 * 60 }
fn default_grace_period() -> u64 { 5 * 60 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            send_hour: default_send_hour(),
            eligibility_interval_secs: default_eligibility_interval(),
            lookahead_hours: default_lookahead_hours(),
            lookback_hours: default_lookback_hours(),
            dispatch_interval_secs: default_dispatch_interval(),
            dispatch_window_secs: default_dispatch_window(),
            dispatch_batch_size: default_dispatch_batch_size(),
            recovery_interval_secs: default_recovery_interval(),
            staleness_timeout_secs: default_staleness_timeout(),
            grace_period_secs: default_grace_period(),
        }
    }
}

/// Queue consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claimed job stays invisible before it is redelivered.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Redelivery delay after a store or queue failure inside a job.
    #[serde(default = "default_infra_retry_delay")]
    pub infra_retry_delay_secs: u64,
}

fn default_concurrency() -> usize { 5 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_visibility_timeout() -> u64 { 300 }
fn default_send_timeout() -> u64 { 10 }
fn default_infra_retry_delay() -> u64 { 30 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout(),
            send_timeout_secs: default_send_timeout(),
            infra_retry_delay_secs: default_infra_retry_delay(),
        }
    }
}

/// Circuit breaker around the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_min_calls")]
    pub min_calls_in_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_error_rate_threshold() -> f64 { 0.5 }
fn default_min_calls() -> u32 { 10 }
fn default_window_secs() -> u64 { 60 }
fn default_reset_timeout() -> u64 { 30 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            min_calls_in_window: default_min_calls(),
            window_secs: default_window_secs(),
            reset_timeout_secs: default_reset_timeout(),
        }
    }
}

/// Which sender delivers messages, and its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// "http" or "smtp".
    #[serde(default = "default_sender_kind")]
    pub kind: String,
    #[serde(default)]
    pub http: HttpSenderConfig,
    #[serde(default)]
    pub smtp: Option<SmtpSenderConfig>,
}

fn default_sender_kind() -> String { "http".into() }

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            kind: default_sender_kind(),
            http: HttpSenderConfig::default(),
            smtp: None,
        }
    }
}

/// Vendor email API over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSenderConfig {
    #[serde(default = "default_http_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_from_address")]
    pub from: String,
}

fn default_http_endpoint() -> String { "http://127.0.0.1:8025/send-email".into() }
fn default_from_address() -> String { "greetings@example.com".into() }

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_http_endpoint(),
            api_key: String::new(),
            from: default_from_address(),
        }
    }
}

/// Plain SMTP relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSenderConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_from_address")]
    pub from: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_port() -> u16 { 587 }

/// Operator-facing HTTP views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn bool_true() -> bool { true }
fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3080 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}
