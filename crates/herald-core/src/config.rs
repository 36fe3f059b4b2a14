use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 60_000;
/// Lower bound on the polling interval; anything shorter is clamped up.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_CONCURRENT_DELIVERIES: usize = 5;
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 300_000;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_PARALLELISM: usize = 10;

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub content: ContentConfig,
}

/// Polling scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// When false the scheduler still starts and stops normally but never
    /// queries for due work.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// How often to look for due schedules. `0` means the default (60 s).
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Maximum number of schedules executed concurrently within one pass.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_deliveries: usize,
    /// Upper bound on a single schedule execution.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            max_concurrent_deliveries: DEFAULT_MAX_CONCURRENT_DELIVERIES,
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        if self.check_interval_ms == 0 {
            return Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS);
        }
        Duration::from_millis(self.check_interval_ms).max(MIN_CHECK_INTERVAL)
    }

    pub fn max_concurrent_deliveries(&self) -> usize {
        if self.max_concurrent_deliveries == 0 {
            DEFAULT_MAX_CONCURRENT_DELIVERIES
        } else {
            self.max_concurrent_deliveries
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        if self.execution_timeout_ms == 0 {
            Duration::from_millis(DEFAULT_EXECUTION_TIMEOUT_MS)
        } else {
            Duration::from_millis(self.execution_timeout_ms)
        }
    }
}

/// Delivery manager retry and fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Retries after the first attempt for transient failures. `0` disables retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Maximum (recipient, channel) units in flight at once. `0` means the default.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl DeliveryConfig {
    pub fn base_delay(&self) -> Duration {
        if self.base_delay_ms == 0 {
            Duration::from_millis(DEFAULT_BASE_DELAY_MS)
        } else {
            Duration::from_millis(self.base_delay_ms)
        }
    }

    /// Never shorter than [`base_delay`](Self::base_delay).
    pub fn max_delay(&self) -> Duration {
        let max = if self.max_delay_ms == 0 {
            Duration::from_millis(DEFAULT_MAX_DELAY_MS)
        } else {
            Duration::from_millis(self.max_delay_ms)
        };
        max.max(self.base_delay())
    }

    pub fn parallelism(&self) -> usize {
        if self.parallelism == 0 {
            DEFAULT_PARALLELISM
        } else {
            self.parallelism
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Values every rendered template can reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub server_url: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            server_url: String::new(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_check_interval_ms() -> u64 {
    DEFAULT_CHECK_INTERVAL_MS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_DELIVERIES
}
fn default_execution_timeout_ms() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_MS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}
fn default_server_name() -> String {
    "Herald".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.db", home)
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `~/.herald/herald.toml`.
    /// Nested keys use a double underscore, e.g.
    /// `HERALD_SCHEDULER__CHECK_INTERVAL_MS=30000`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml(toml: &str) -> crate::error::Result<Self> {
        Figment::from(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = HeraldConfig::from_toml("").unwrap();
        assert!(cfg.scheduler.enabled);
        assert_eq!(cfg.scheduler.check_interval(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.max_concurrent_deliveries(), 5);
        assert_eq!(cfg.scheduler.execution_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.delivery.max_retries, 3);
        assert_eq!(cfg.delivery.base_delay(), Duration::from_secs(1));
        assert_eq!(cfg.delivery.max_delay(), Duration::from_secs(30));
        assert_eq!(cfg.delivery.parallelism(), 10);
        assert_eq!(cfg.content.server_name, "Herald");
        assert_eq!(cfg.content.server_url, "");
    }

    #[test]
    fn content_section_is_read() {
        let cfg = HeraldConfig::from_toml(
            r#"
            [content]
            server_name = "Home Media"
            server_url = "https://media.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.content.server_name, "Home Media");
        assert_eq!(cfg.content.server_url, "https://media.example.com");
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let cfg = HeraldConfig::from_toml(
            r#"
            [scheduler]
            check_interval_ms = 0
            max_concurrent_deliveries = 0
            execution_timeout_ms = 0

            [delivery]
            max_retries = 0
            base_delay_ms = 0
            max_delay_ms = 0
            parallelism = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.check_interval(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.max_concurrent_deliveries(), 5);
        assert_eq!(cfg.scheduler.execution_timeout(), Duration::from_secs(300));
        // zero retries is a legitimate setting, not a sentinel
        assert_eq!(cfg.delivery.max_retries, 0);
        assert_eq!(cfg.delivery.base_delay(), Duration::from_secs(1));
        assert_eq!(cfg.delivery.parallelism(), 10);
    }

    #[test]
    fn custom_values_preserved() {
        let cfg = HeraldConfig::from_toml(
            r#"
            [scheduler]
            enabled = false
            check_interval_ms = 15000
            max_concurrent_deliveries = 2

            [delivery]
            max_retries = 5
            base_delay_ms = 2000
            max_delay_ms = 60000
            parallelism = 20
            "#,
        )
        .unwrap();
        assert!(!cfg.scheduler.enabled);
        assert_eq!(cfg.scheduler.check_interval(), Duration::from_secs(15));
        assert_eq!(cfg.scheduler.max_concurrent_deliveries(), 2);
        assert_eq!(cfg.delivery.max_retries, 5);
        assert_eq!(cfg.delivery.base_delay(), Duration::from_secs(2));
        assert_eq!(cfg.delivery.max_delay(), Duration::from_secs(60));
        assert_eq!(cfg.delivery.parallelism(), 20);
    }

    #[test]
    fn check_interval_is_floored() {
        let cfg = SchedulerConfig {
            check_interval_ms: 5,
            ..SchedulerConfig::default()
        };
        assert_eq!(cfg.check_interval(), MIN_CHECK_INTERVAL);
    }

    #[test]
    fn max_delay_never_below_base_delay() {
        let cfg = DeliveryConfig {
            base_delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..DeliveryConfig::default()
        };
        assert_eq!(cfg.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn malformed_document_is_config_error() {
        let err = HeraldConfig::from_toml("[scheduler]\nenabled = \"maybe\"").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
