//! Layered configuration loading utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

/// Configuration problems that are fatal at startup (exit code 2).
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("loss_threshold_percent must be in (0, 1), got {0}")]
    LossThreshold(Decimal),
    #[error("reconcile_tolerance_percent must be in (0, 1), got {0}")]
    ReconcileTolerance(Decimal),
    #[error("event_bus_max_queue_size must be greater than zero")]
    QueueSize,
    #[error("paper_trading is disabled but no live venue adapter is wired in")]
    LiveTradingUnavailable,
}

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_starting_capital")]
    pub starting_capital: Decimal,
    #[serde(default = "default_reporting_currency")]
    pub reporting_currency: String,
    /// Selects the mock venue. Defaults to true and must be explicitly
    /// disabled; it never silently goes live.
    #[serde(default = "default_paper_trading")]
    pub paper_trading: bool,
    #[serde(default)]
    pub risk: RiskConfigSection,
    #[serde(default)]
    pub reconcile: ReconcileConfigSection,
    #[serde(default)]
    pub event_bus: EventBusConfigSection,
    #[serde(default)]
    pub timeouts: TimeoutConfigSection,
    #[serde(default)]
    pub paths: PathConfigSection,
    /// Per-venue credentials, opaque to the core.
    #[serde(default)]
    pub exchange: HashMap<String, VenueCredentials>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfigSection {
    #[serde(default = "default_loss_threshold")]
    pub loss_threshold_percent: Decimal,
    #[serde(default = "default_cooldown_seconds")]
    pub breaker_cooldown_seconds: u64,
    #[serde(default = "default_fee_buffer")]
    pub fee_buffer_percent: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfigSection {
    #[serde(default = "default_reconcile_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_reconcile_tolerance")]
    pub tolerance_percent: Decimal,
    #[serde(default = "default_reconcile_fail_limit")]
    pub fail_limit: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventBusConfigSection {
    #[serde(default = "default_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_critical_topics")]
    pub critical_topics: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfigSection {
    #[serde(default = "default_symbol_lock_timeout_ms")]
    pub symbol_lock_timeout_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_fetch_poll_interval_ms")]
    pub fetch_poll_interval_ms: u64,
    #[serde(default = "default_fetch_poll_deadline_ms")]
    pub fetch_poll_deadline_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathConfigSection {
    #[serde(default = "default_wal_dir")]
    pub wal_dir: PathBuf,
    #[serde(default = "default_persistence_path")]
    pub persistence_path: PathBuf,
    #[serde(default = "default_breaker_state_path")]
    pub circuit_breaker_state_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VenueCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub rest_url: Option<String>,
}

impl Default for RiskConfigSection {
    fn default() -> Self {
        Self {
            loss_threshold_percent: default_loss_threshold(),
            breaker_cooldown_seconds: default_cooldown_seconds(),
            fee_buffer_percent: default_fee_buffer(),
        }
    }
}

impl Default for ReconcileConfigSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_reconcile_interval(),
            tolerance_percent: default_reconcile_tolerance(),
            fail_limit: default_reconcile_fail_limit(),
        }
    }
}

impl Default for EventBusConfigSection {
    fn default() -> Self {
        Self {
            max_queue_size: default_queue_size(),
            critical_topics: default_critical_topics(),
        }
    }
}

impl Default for TimeoutConfigSection {
    fn default() -> Self {
        Self {
            symbol_lock_timeout_ms: default_symbol_lock_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            fetch_poll_interval_ms: default_fetch_poll_interval_ms(),
            fetch_poll_deadline_ms: default_fetch_poll_deadline_ms(),
        }
    }
}

impl Default for PathConfigSection {
    fn default() -> Self {
        Self {
            wal_dir: default_wal_dir(),
            persistence_path: default_persistence_path(),
            circuit_breaker_state_path: default_breaker_state_path(),
        }
    }
}

impl AppConfig {
    /// Range checks that make a configuration unusable.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let threshold = self.risk.loss_threshold_percent;
        if threshold <= Decimal::ZERO || threshold >= Decimal::ONE {
            return Err(ConfigValidationError::LossThreshold(threshold));
        }
        let tolerance = self.reconcile.tolerance_percent;
        if tolerance <= Decimal::ZERO || tolerance >= Decimal::ONE {
            return Err(ConfigValidationError::ReconcileTolerance(tolerance));
        }
        if self.event_bus.max_queue_size == 0 {
            return Err(ConfigValidationError::QueueSize);
        }
        if !self.paper_trading {
            return Err(ConfigValidationError::LiveTradingUnavailable);
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_starting_capital() -> Decimal {
    Decimal::from(10_000)
}

fn default_reporting_currency() -> String {
    "USDT".to_string()
}

fn default_paper_trading() -> bool {
    true
}

fn default_loss_threshold() -> Decimal {
    Decimal::new(1, 1) // 10%
}

fn default_cooldown_seconds() -> u64 {
    3600
}

fn default_fee_buffer() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_reconcile_tolerance() -> Decimal {
    Decimal::new(1, 2) // 1%
}

fn default_reconcile_fail_limit() -> u32 {
    3
}

fn default_queue_size() -> usize {
    10_000
}

fn default_critical_topics() -> Vec<String> {
    vec![
        "risk:circuit_breaker".into(),
        "risk:position_mismatch".into(),
        "risk:alert".into(),
        "system:critical".into(),
        "system:error".into(),
    ]
}

fn default_symbol_lock_timeout_ms() -> u64 {
    5_000
}

fn default_submit_timeout_ms() -> u64 {
    30_000
}

fn default_fetch_poll_interval_ms() -> u64 {
    100
}

fn default_fetch_poll_deadline_ms() -> u64 {
    30_000
}

fn default_wal_dir() -> PathBuf {
    PathBuf::from("./state/wal")
}

fn default_persistence_path() -> PathBuf {
    PathBuf::from("./state/orders.db")
}

fn default_breaker_state_path() -> PathBuf {
    PathBuf::from("./state/circuit_breaker.json")
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml` (optional)
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `BULWARK__`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("BULWARK")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
