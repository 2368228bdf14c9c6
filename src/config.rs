use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_ACTION_CUTOFF_HOURS: i64 = 48;
const DEFAULT_PAUSE_NOTICE_HOURS: i64 = 48;
const DEFAULT_IMMEDIATE_CANCEL_WINDOW_HOURS: i64 = 24;

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_delivery_fee() -> Decimal {
    dec!(5.00)
}

fn default_free_delivery_threshold() -> Decimal {
    dec!(100.00)
}

fn default_min_chargeable_amount() -> Decimal {
    dec!(0.50)
}

fn default_action_cutoff_hours() -> i64 {
    DEFAULT_ACTION_CUTOFF_HOURS
}

fn default_pause_notice_hours() -> i64 {
    DEFAULT_PAUSE_NOTICE_HOURS
}

fn default_immediate_cancel_window_hours() -> i64 {
    DEFAULT_IMMEDIATE_CANCEL_WINDOW_HOURS
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

/// Commerce knobs for the order lifecycle core.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CommerceConfig {
    /// Per-day delivery fee charged below the free-delivery threshold
    #[serde(default = "default_delivery_fee")]
    pub delivery_fee: Decimal,

    /// Subtotal at or above which delivery is free (inclusive)
    #[serde(default = "default_free_delivery_threshold")]
    pub free_delivery_threshold: Decimal,

    /// Smallest nonzero amount the card processor accepts in a single charge
    #[serde(default = "default_min_chargeable_amount")]
    pub min_chargeable_amount: Decimal,

    /// Hours before a delivery during which skip/switch/remove are disallowed
    #[serde(default = "default_action_cutoff_hours")]
    pub action_cutoff_hours: i64,

    /// Hours of notice required before the next billing date to pause/resume
    #[serde(default = "default_pause_notice_hours")]
    pub pause_notice_hours: i64,

    /// Hours after signup during which an immediate cancellation is permitted
    #[serde(default = "default_immediate_cancel_window_hours")]
    pub immediate_cancel_window_hours: i64,

    /// ISO currency code used for all amounts
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            delivery_fee: default_delivery_fee(),
            free_delivery_threshold: default_free_delivery_threshold(),
            min_chargeable_amount: default_min_chargeable_amount(),
            action_cutoff_hours: default_action_cutoff_hours(),
            pause_notice_hours: default_pause_notice_hours(),
            immediate_cancel_window_hours: default_immediate_cancel_window_hours(),
            currency: default_currency(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Commerce knobs
    #[serde(default)]
    pub commerce: CommerceConfig,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
}

impl AppConfig {
    /// Build a minimal configuration programmatically (used by tests).
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            commerce: CommerceConfig::default(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

/// Loads configuration from layered sources: `config/default.toml`, an
/// environment-specific file, and `DABBAH_`-prefixed environment variables.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder();

    let default_path = Path::new(CONFIG_DIR).join("default.toml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    let env_path = Path::new(CONFIG_DIR).join(format!("{run_env}.toml"));
    if env_path.exists() {
        builder = builder.add_source(File::from(env_path));
    }

    let settings = builder
        .add_source(Environment::with_prefix("DABBAH").separator("__"))
        .build()?;

    let app_config: AppConfig = settings.try_deserialize()?;

    app_config
        .validate()
        .map_err(|e| ConfigError::Message(format!("Configuration validation failed: {e}")))?;

    info!(environment = %app_config.environment, "Configuration loaded");
    Ok(app_config)
}
