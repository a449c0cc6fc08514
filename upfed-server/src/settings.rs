//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by
//! environment variables (prefix `UPFED`, section separator `__`). An
//! example configuration file lives in the `configs/` directory at the
//! repository root.

use std::{fmt, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    pub api: ApiSettings,
    pub log: LoggingSettings,
    #[validate]
    pub federation: FederationSettings,
    #[validate]
    pub privacy: PrivacySettings,
    #[validate]
    pub session: SessionSettings,
    #[validate]
    pub mining: MiningSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path))?;
        config.merge(Environment::with_prefix("upfed").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "127.0.0.1:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UPFED_API__BIND_ADDRESS=127.0.0.1:8081
    /// ```
    pub bind_address: std::net::SocketAddr,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Federated round settings.
pub struct FederationSettings {
    #[validate(range(min = 1))]
    /// The default for `min_clients_required` of a round when the round
    /// request does not specify one.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// min_clients_required_default = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UPFED_FEDERATION__MIN_CLIENTS_REQUIRED_DEFAULT=2
    /// ```
    pub min_clients_required_default: usize,
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            min_clients_required_default: 2,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_privacy"))]
/// Differential-privacy settings.
pub struct PrivacySettings {
    /// The per-round privacy budget ε used when a round request does not
    /// specify one. `0` disables noise.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// epsilon_default = 1.0
    /// ```
    pub epsilon_default: f64,

    /// The declared global sensitivity Δ: an upper bound on how much one
    /// store's contribution can change an aggregate. Parameterizes the
    /// Laplace scale `Δ/ε`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// sensitivity = 1.0
    /// ```
    pub sensitivity: f64,

    /// The cumulative ε cap across completed rounds. Once exhausted,
    /// round requests fail until the operator tops the cap up.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// budget_cap = 10.0
    /// ```
    pub budget_cap: f64,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            epsilon_default: 1.0,
            sensitivity: 1.0,
            budget_cap: 10.0,
        }
    }
}

/// Checks privacy settings.
fn validate_privacy(s: &PrivacySettings) -> Result<(), ValidationError> {
    if s.epsilon_default < 0.0 || !s.epsilon_default.is_finite() {
        return Err(ValidationError::new("epsilon_default must be >= 0"));
    }
    if s.sensitivity <= 0.0 || !s.sensitivity.is_finite() {
        return Err(ValidationError::new("sensitivity must be > 0"));
    }
    if s.budget_cap < 0.0 || !s.budget_cap.is_finite() {
        return Err(ValidationError::new("budget_cap must be >= 0"));
    }
    Ok(())
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_session"))]
/// Session liveness settings.
pub struct SessionSettings {
    #[validate(range(min = 1))]
    /// A store is flipped to `inactive` once it has not sent a heartbeat
    /// for this many seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [session]
    /// heartbeat_inactive_timeout = 60
    /// ```
    pub heartbeat_inactive_timeout: u64,

    #[validate(range(min = 1))]
    /// The cadence of the liveness sweep, in seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [session]
    /// liveness_sweep_period = 30
    /// ```
    pub liveness_sweep_period: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_inactive_timeout: 60,
            liveness_sweep_period: 30,
        }
    }
}

/// Checks that the sweep runs at least as often as the liveness bound.
fn validate_session(s: &SessionSettings) -> Result<(), ValidationError> {
    if s.liveness_sweep_period > s.heartbeat_inactive_timeout {
        return Err(ValidationError::new(
            "liveness_sweep_period must not exceed heartbeat_inactive_timeout",
        ));
    }
    Ok(())
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Mining worker settings.
pub struct MiningSettings {
    #[validate(range(min = 1))]
    /// Bounded concurrency for mining jobs.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [mining]
    /// worker_pool_size = 4
    /// ```
    pub worker_pool_size: usize,

    #[validate(range(min = 1))]
    /// A `running` job older than this many seconds is reaped to
    /// `failed` (its worker is assumed to have crashed).
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [mining]
    /// stale_job_timeout = 600
    /// ```
    pub stale_job_timeout: u64,

    #[validate(range(min = 1))]
    /// Capacity of the emitted-pattern cache of one mining run.
    pub cache_size_patterns: usize,

    #[validate(range(min = 1))]
    /// Capacity of the utility-bound cache of one mining run.
    pub cache_size_bounds: usize,

    #[validate(range(min = 1))]
    /// Capacity of the projection cache of one mining run.
    pub cache_size_projections: usize,
}

impl Default for MiningSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            stale_job_timeout: 600,
            cache_size_patterns: 4096,
            cache_size_bounds: 4096,
            cache_size_projections: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info,upfed_server=debug"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UPFED_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
