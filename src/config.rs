//! Control-plane configuration.
//!
//! Defaults mirror the external-interfaces section of the design: tick
//! intervals per component, cache sizing, cooldowns, and cost limits. Values
//! are layered `defaults < file < environment`, using the `config` crate the
//! same way the workspace's configuration layer does, with `GOVERNOR_`
//! prefixed environment overrides (e.g. `GOVERNOR_AGGREGATOR__TICK_MS=500`).

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};

/// Aggregator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// How often the aggregator evicts expired samples, milliseconds
    pub tick_ms: u64,
    /// Samples retained per histogram
    pub histogram_capacity: usize,
    /// Raw-sample retention window, milliseconds
    pub retention_ms: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            histogram_capacity: crate::aggregator::DEFAULT_HISTOGRAM_CAPACITY,
            retention_ms: crate::aggregator::DEFAULT_RETENTION_MS,
        }
    }
}

/// Correlation-engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// How often the engine recomputes the correlation matrix, milliseconds
    pub tick_ms: u64,
    /// Samples retained per module for correlation
    pub history_capacity: usize,
    /// Assumed sample cadence, for lag-to-milliseconds conversion
    pub sample_interval_ms: i64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5_000,
            history_capacity: crate::correlation::DEFAULT_HISTORY_CAPACITY,
            sample_interval_ms: 1_000,
        }
    }
}

/// Intelligent-cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How often expired entries are swept, milliseconds
    pub tick_ms: u64,
    /// Maximum entries retained per namespace
    pub namespace_capacity: usize,
    /// Default entry TTL, milliseconds
    pub default_ttl_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10_000,
            namespace_capacity: crate::cache::DEFAULT_NAMESPACE_CAPACITY,
            default_ttl_ms: crate::cache::DEFAULT_TTL_MS,
        }
    }
}

/// Burn-rate governor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// How often policies are evaluated, milliseconds
    pub tick_ms: u64,
    /// Maximum acceptable hourly spend
    pub hourly_cost_limit: f64,
    /// Overall burn rate at or above which `burn_rate_exceeded` fires
    pub max_burn_rate_threshold: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 2_000,
            hourly_cost_limit: 100.0,
            max_burn_rate_threshold: crate::governor::DEFAULT_MAX_BURN_RATE_THRESHOLD,
        }
    }
}

/// Degradation-ladder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderConfig {
    /// How often triggers are evaluated, milliseconds
    pub tick_ms: u64,
    /// Minimum time a level holds before de-escalating, milliseconds
    pub cooldown_ms: i64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            cooldown_ms: crate::ladder::DEFAULT_COOLDOWN_MS,
        }
    }
}

/// Adaptive-scaler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerConfig {
    /// How often scaling policies are evaluated, milliseconds
    pub tick_ms: u64,
    /// Minimum time between scaling actions for the same module, milliseconds
    pub cooldown_ms: i64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5_000,
            cooldown_ms: crate::scaler::DEFAULT_SCALING_COOLDOWN_MS,
        }
    }
}

/// Dashboard-stream tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Per-subscriber channel depth
    pub channel_capacity: usize,
    /// Heartbeat period, milliseconds
    pub heartbeat_interval_ms: u64,
}

impl DashboardConfig {
    /// Subscriber timeout, derived as twice the heartbeat interval.
    pub fn heartbeat_timeout_ms(&self) -> i64 {
        2 * self.heartbeat_interval_ms as i64
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::dashboard::DEFAULT_CHANNEL_CAPACITY,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// Top-level configuration for the whole control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Aggregator settings
    pub aggregator: AggregatorConfig,
    /// Correlation-engine settings
    pub correlation: CorrelationConfig,
    /// Cache settings
    pub cache: CacheConfig,
    /// Governor settings
    pub governor: GovernorConfig,
    /// Ladder settings
    pub ladder: LadderConfig,
    /// Scaler settings
    pub scaler: ScalerConfig,
    /// Dashboard settings
    pub dashboard: DashboardConfig,
}

impl ControlPlaneConfig {
    /// Load configuration from an optional TOML file, layered with
    /// `GOVERNOR_`-prefixed environment variable overrides, falling back to
    /// built-in defaults for anything unspecified.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())
            .map_err(|e| GovernorError::Config(e.to_string()))?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("GOVERNOR")
                .separator("__")
                .try_parsing(true),
        );

        let settled = builder.build().map_err(|e| GovernorError::Config(e.to_string()))?;
        settled.try_deserialize().map_err(|e| GovernorError::Config(e.to_string()))
    }
}
