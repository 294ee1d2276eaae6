// Runtime configuration
// Layered settings: built-in defaults, optional file, then environment

//! # Runtime Configuration
//!
//! [`RuntimeConfig`] holds one section per engine component. It is loaded with
//! the `config` crate in three layers, later layers overriding earlier ones:
//!
//! 1. [`RuntimeConfig::default`]
//! 2. an optional TOML/JSON/YAML file
//! 3. environment variables prefixed with `INSTANCE_RUNTIME`, using `__` as the
//!    section separator, e.g. `INSTANCE_RUNTIME__LIFECYCLE__MAX_RETRY_ATTEMPTS=5`

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::LifecycleConfig;
use crate::Result;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "INSTANCE_RUNTIME";

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "INSTANCE_RUNTIME_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub global: GlobalManagerConfig,
    pub lifecycle: LifecycleManagerConfig,
    pub resources: ResourceManagerConfig,
    pub monitoring: MonitoringConfig,
}

/// Global instance cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalManagerConfig {
    /// Period of the background expiry task
    pub cleanup_interval_secs: u64,

    /// Idle time after which a cached entry is dropped
    pub max_inactive_minutes: u64,
}

impl Default for GlobalManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 300,
            max_inactive_minutes: 30,
        }
    }
}

impl GlobalManagerConfig {
    /// Never shorter than one second
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn max_inactive(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_inactive_minutes as i64)
    }
}

/// Lifecycle manager settings
///
/// The per-instance policy fields are flattened into this section, so they
/// are configured as `lifecycle.max_retry_attempts` and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleManagerConfig {
    #[serde(flatten)]
    pub defaults: LifecycleConfig,

    /// Period of the expiry sweep
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleManagerConfig {
    fn default() -> Self {
        Self {
            defaults: LifecycleConfig::default(),
            sweep_interval_secs: 300,
        }
    }
}

impl LifecycleManagerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Tenant resource manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    pub monitoring_interval_secs: u64,

    /// Samples kept per tenant in the usage history ring
    pub history_capacity: usize,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: 30,
            history_capacity: 1000,
        }
    }
}

impl ResourceManagerConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs.max(1))
    }
}

/// Monitoring system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Period of the monitoring loop
    pub monitoring_interval_ms: u64,

    /// Minimum gap between two health-check rounds for one instance
    pub health_check_interval_ms: u64,

    pub auto_recovery: bool,
    pub metric_capacity: usize,
    pub span_capacity: usize,
    pub diagnostic_capacity: usize,
    pub cpu_degraded_percent: f64,
    pub cpu_unhealthy_percent: f64,

    /// Install the process-CPU based `basic` checker
    pub install_default_checkers: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: 30_000,
            health_check_interval_ms: 60_000,
            auto_recovery: true,
            metric_capacity: 10_000,
            span_capacity: 10_000,
            diagnostic_capacity: 1000,
            cpu_degraded_percent: 70.0,
            cpu_unhealthy_percent: 90.0,
            install_default_checkers: true,
        }
    }
}

impl MonitoringConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl RuntimeConfig {
    /// Load defaults, then `path` if given (missing files are ignored), then
    /// `INSTANCE_RUNTIME__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&RuntimeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load using the path in `INSTANCE_RUNTIME_CONFIG`, if set
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load(path.as_deref())
    }
}
