//! Core data model shared by every control-plane component.
//!
//! Identifiers are short opaque strings (`ModuleId`, `NodeId`) or UUIDs
//! unique over the process lifetime (`ExecutionId`, `FlowId`, `StepId`,
//! `OperationId`). Time is milliseconds since a fixed epoch, always sourced
//! from a [`crate::clock::Clock`] so tests can drive windows deterministically.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque module identifier (e.g. `"qflow"`, `"qindex"`).
pub type ModuleId = String;

/// Opaque compute-node identifier.
pub type NodeId = String;

/// Unique per-execution identifier.
pub type ExecutionId = Uuid;

/// Unique per-flow identifier.
pub type FlowId = Uuid;

/// Unique per-step identifier.
pub type StepId = Uuid;

/// Unique per-operation identifier.
pub type OperationId = String;

/// Milliseconds since a fixed epoch, sourced from [`crate::clock::Clock`].
pub type TimestampMs = i64;

/// Health classification of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleHealth {
    /// Fully healthy
    Healthy,
    /// Degraded but serving
    Warning,
    /// Severely degraded
    Critical,
    /// No recent samples
    Unknown,
}

impl ModuleHealth {
    /// Ordered health score used by EHI and critical-path scoring.
    pub fn score(self) -> f64 {
        match self {
            ModuleHealth::Healthy => 1.0,
            ModuleHealth::Warning => 0.7,
            ModuleHealth::Critical => 0.3,
            ModuleHealth::Unknown => 0.5,
        }
    }
}

/// Latency triple recorded for a module sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyTriple {
    /// 50th percentile, milliseconds
    pub p50: f64,
    /// 95th percentile, milliseconds
    pub p95: f64,
    /// 99th percentile, milliseconds
    pub p99: f64,
}

/// Resource-utilization triple in `0..1`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UtilizationTriple {
    /// CPU utilization, 0..1
    pub cpu: f64,
    /// Memory utilization, 0..1
    pub mem: f64,
    /// Network utilization, 0..1
    pub net: f64,
}

/// A single observed sample for a module at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetrics {
    /// Module this sample describes
    pub module: ModuleId,
    /// When the sample was taken
    pub timestamp: TimestampMs,
    /// Latency percentiles
    pub latency: LatencyTriple,
    /// Requests per second
    pub throughput: f64,
    /// Error rate, 0..1
    pub error_rate: f64,
    /// Availability, 0..1
    pub availability: f64,
    /// Resource utilization
    pub utilization: UtilizationTriple,
}

impl ModuleMetrics {
    /// Derive a coarse [`ModuleHealth`] from this sample using the same
    /// thresholds the correlation engine uses to flag bottlenecks.
    pub fn health(&self) -> ModuleHealth {
        if self.error_rate > 0.1 || self.latency.p95 > 5000.0 || self.availability < 0.9 {
            ModuleHealth::Critical
        } else if self.error_rate > 0.05 || self.latency.p95 > 2000.0 || self.availability < 0.99 {
            ModuleHealth::Warning
        } else {
            ModuleHealth::Healthy
        }
    }
}

/// Correlation strength category, by `|r|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationStrength {
    /// |r| < 0.3
    Weak,
    /// 0.3 <= |r| < 0.6
    Moderate,
    /// 0.6 <= |r| < 0.8
    Strong,
    /// |r| >= 0.8
    VeryStrong,
}

impl CorrelationStrength {
    /// Classify the magnitude of a correlation coefficient.
    pub fn from_r(r: f64) -> Self {
        let mag = r.abs();
        if mag >= 0.8 {
            CorrelationStrength::VeryStrong
        } else if mag >= 0.6 {
            CorrelationStrength::Strong
        } else if mag >= 0.3 {
            CorrelationStrength::Moderate
        } else {
            CorrelationStrength::Weak
        }
    }
}

/// Sign classification of a correlation coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationType {
    /// r > 0.1
    Positive,
    /// r < -0.1
    Negative,
    /// -0.1 <= r <= 0.1
    Neutral,
}

impl CorrelationType {
    /// Classify the sign of a correlation coefficient.
    pub fn from_r(r: f64) -> Self {
        if r > 0.1 {
            CorrelationType::Positive
        } else if r < -0.1 {
            CorrelationType::Negative
        } else {
            CorrelationType::Neutral
        }
    }
}

/// Direction of influence between two modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImpactDirection {
    /// A's health drives B's
    AToB,
    /// B's health drives A's
    BToA,
    /// Mutual influence, no declared dependency
    Bidirectional,
    /// No detectable causal link
    Independent,
}

impl ImpactDirection {
    /// The direction as seen from the mirrored `(B, A)` entry.
    pub fn reversed(self) -> Self {
        match self {
            ImpactDirection::AToB => ImpactDirection::BToA,
            ImpactDirection::BToA => ImpactDirection::AToB,
            other => other,
        }
    }
}

/// One entry of the correlation matrix, for an ordered pair `(a, b)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationAnalysis {
    /// First module of the ordered pair
    pub a: ModuleId,
    /// Second module of the ordered pair
    pub b: ModuleId,
    /// Combined Pearson coefficient in [-1, 1]
    pub r: f64,
    /// Strength category of `|r|`
    pub strength: CorrelationStrength,
    /// Sign category of `r`
    pub kind: CorrelationType,
    /// Confidence in [0, 1], derived from sample count
    pub confidence: f64,
    /// Direction of influence
    pub impact_direction: ImpactDirection,
    /// Estimated lag between cause and effect, milliseconds
    pub lag_ms: i64,
}

/// Composite [0,1] score describing the whole mesh's health.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EcosystemHealthIndex {
    /// Mean availability across modules
    pub connectivity: f64,
    /// Latency/throughput composite
    pub performance: f64,
    /// Error-rate composite
    pub reliability: f64,
    /// Resource-headroom composite
    pub scalability: f64,
    /// Weighted overall score
    pub overall: f64,
}

impl EcosystemHealthIndex {
    /// Combine the four sub-scores per the §3 weighting.
    pub fn compose(connectivity: f64, performance: f64, reliability: f64, scalability: f64) -> Self {
        let overall = 0.2 * connectivity + 0.4 * performance + 0.3 * reliability + 0.1 * scalability;
        Self {
            connectivity,
            performance,
            reliability,
            scalability,
            overall: overall.clamp(0.0, 1.0),
        }
    }
}

/// A root-to-leaf traversal of the module topology, with its aggregate health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Modules visited, in traversal order
    pub modules: Vec<ModuleId>,
    /// Mean of per-module health scores along the path
    pub path_health: f64,
    /// Modules on this path flagged as bottlenecks
    pub bottlenecks: Vec<ModuleId>,
}

/// Error-budget accounting for one operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ErrorBudget {
    /// 1 - availabilityTarget
    pub budget: f64,
    /// budget - errorRate
    pub remaining: f64,
    /// recentErrorRate / budget
    pub burn_rate: f64,
    /// Minutes until exhaustion, `f64::INFINITY` if burn_rate <= 0
    pub time_to_exhaustion_min: f64,
}

impl ErrorBudget {
    /// Compute an error budget from an availability target and observed error rate.
    pub fn compute(availability_target: f64, error_rate: f64, recent_error_rate: f64) -> Self {
        let budget = (1.0 - availability_target).max(0.0);
        let remaining = budget - error_rate;
        let burn_rate = if budget > 0.0 {
            recent_error_rate / budget
        } else {
            0.0
        };
        let time_to_exhaustion_min = if burn_rate <= 0.0 {
            f64::INFINITY
        } else {
            (remaining / burn_rate) * 60.0
        };
        Self {
            budget,
            remaining,
            burn_rate,
            time_to_exhaustion_min,
        }
    }

    /// Whether the SLO is currently being met.
    pub fn slo_compliance(&self) -> bool {
        self.remaining >= 0.0
    }
}

/// Combined cost/performance burn-rate score for the whole mesh.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BurnRateMetrics {
    /// Resource (CPU) burn, 0..1
    pub cpu_burn: f64,
    /// Resource (memory) burn, 0..1
    pub mem_burn: f64,
    /// Latency burn, 0..1
    pub latency_burn: f64,
    /// Error burn, 0..1
    pub error_burn: f64,
    /// hourlyCost / hourlyLimit, 0..1
    pub cost_burn: f64,
    /// Weighted combination, clamped to [0, 1]
    pub overall: f64,
}

impl BurnRateMetrics {
    /// Combine component burns per the §3 weighting, clamped to 1.0.
    pub fn compose(cpu_burn: f64, mem_burn: f64, latency_burn: f64, error_burn: f64, cost_burn: f64) -> Self {
        let overall =
            0.3 * cpu_burn + 0.2 * mem_burn + 0.25 * latency_burn + 0.15 * error_burn + 0.1 * cost_burn;
        Self {
            cpu_burn,
            mem_burn,
            latency_burn,
            error_burn,
            cost_burn,
            overall: overall.clamp(0.0, 1.0),
        }
    }
}

/// One entry stored in the intelligent cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Serialized value
    pub value: serde_json::Value,
    /// Tags used for bulk invalidation
    pub tags: Vec<String>,
    /// When this entry was written
    pub created_at: TimestampMs,
    /// When this entry expires
    pub expires_at: TimestampMs,
    /// When this entry was last read
    pub last_accessed_at: TimestampMs,
    /// Number of times this entry has been read
    pub access_count: u64,
    /// Estimated size in bytes, via serialized-byte length
    pub size: usize,
}

impl CacheEntry {
    /// Whether this entry's TTL has elapsed as of `now`.
    pub fn is_expired(&self, now: TimestampMs) -> bool {
        now >= self.expires_at
    }
}

/// A tracked access pattern for one cache key, used for predictive prefetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePattern {
    /// Cache key this pattern describes
    pub key: String,
    /// Recent access timestamps, oldest first
    pub access_times: Vec<TimestampMs>,
    /// Mean interval between accesses, milliseconds
    pub mean_interval_ms: f64,
    /// Predicted time of next access
    pub predicted_next_access: TimestampMs,
}

/// The five rungs of the degradation ladder, from fully healthy to
/// emergency shedding. Ordered so that `as u8` comparisons express severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DegradationLevel {
    /// No degradation, full feature set
    Normal = 0,
    /// Non-critical background work deferred
    Reduced = 1,
    /// Non-critical flows paused
    Conservative = 2,
    /// Only critical-path flows accepted
    Critical = 3,
    /// New work rejected, draining only
    Emergency = 4,
}

/// Trigger thresholds a level is associated with, for display and policy
/// authoring rather than evaluation (triggers themselves are expressions).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelThresholds {
    /// Burn rate at or above which this level's trigger is expected to fire
    pub burn_rate: f64,
    /// Error rate at or above which this level's trigger is expected to fire
    pub error_rate: f64,
    /// P99 latency, milliseconds, at or above which this level is expected
    pub latency_p99_ms: f64,
    /// Resource utilization at or above which this level is expected
    pub utilization: f64,
}

/// Flows to pause when a level's action bundle is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseFlowsAction {
    /// Priority class of flows to pause (e.g. "low", "non-critical")
    pub priority_class: String,
    /// Maximum number of flows to pause in one pass
    pub max_count: u32,
}

/// Steps to defer when a level's action bundle is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferStepsAction {
    /// Only defer steps flagged as heavy
    pub heavy_only: bool,
    /// Require a cold node to be available before deferring
    pub cold_nodes_required: bool,
}

/// Caching behavior to enable when a level's action bundle is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingAction {
    /// Switch the cache into its aggressive caching mode
    pub aggressive: bool,
    /// Multiplier applied to default TTLs while aggressive
    pub ttl_multiplier: f64,
}

/// The bundle of actions associated with a degradation level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBundle {
    /// Pause a subset of flows, if any
    pub pause_flows: Option<PauseFlowsAction>,
    /// Defer a subset of steps, if any
    pub defer_steps: Option<DeferStepsAction>,
    /// Percentage reduction in parallelism, if any
    pub reduce_parallelism_pct: Option<f64>,
    /// Feature flags disabled at this level
    pub disable_features: Vec<String>,
    /// Percentage reduction in cross-module calls, if any
    pub reduce_module_calls_pct: Option<f64>,
    /// Aggressive caching behavior to enable, if any
    pub enable_aggressive_caching: Option<CachingAction>,
    /// Maximum concurrent connections, if limited
    pub limit_connections: Option<u32>,
}

/// Expected impact on service-level objectives while at a given level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlaImpact {
    /// Expected percentage increase in latency
    pub latency_increase_pct: f64,
    /// Expected percentage reduction in throughput
    pub throughput_reduction_pct: f64,
}

impl DegradationLevel {
    /// The next more severe level, saturating at `Emergency`.
    pub fn escalate(self) -> Self {
        match self {
            DegradationLevel::Normal => DegradationLevel::Reduced,
            DegradationLevel::Reduced => DegradationLevel::Conservative,
            DegradationLevel::Conservative => DegradationLevel::Critical,
            DegradationLevel::Critical | DegradationLevel::Emergency => DegradationLevel::Emergency,
        }
    }

    /// The next less severe level, saturating at `Normal`.
    pub fn de_escalate(self) -> Self {
        match self {
            DegradationLevel::Normal | DegradationLevel::Reduced => DegradationLevel::Normal,
            DegradationLevel::Conservative => DegradationLevel::Reduced,
            DegradationLevel::Critical => DegradationLevel::Conservative,
            DegradationLevel::Emergency => DegradationLevel::Critical,
        }
    }

    /// The canonical, human-facing name for this level.
    pub fn canonical_name(self) -> &'static str {
        match self {
            DegradationLevel::Normal => "normal",
            DegradationLevel::Reduced => "reduced",
            DegradationLevel::Conservative => "conservative",
            DegradationLevel::Critical => "critical",
            DegradationLevel::Emergency => "emergency",
        }
    }

    /// Reference trigger thresholds associated with this level.
    pub fn thresholds(self) -> LevelThresholds {
        match self {
            DegradationLevel::Normal => LevelThresholds {
                burn_rate: 0.0,
                error_rate: 0.0,
                latency_p99_ms: 0.0,
                utilization: 0.0,
            },
            DegradationLevel::Reduced => LevelThresholds {
                burn_rate: 0.5,
                error_rate: 0.005,
                latency_p99_ms: 2000.0,
                utilization: 0.7,
            },
            DegradationLevel::Conservative => LevelThresholds {
                burn_rate: 0.7,
                error_rate: 0.01,
                latency_p99_ms: 2800.0,
                utilization: 0.8,
            },
            DegradationLevel::Critical => LevelThresholds {
                burn_rate: 0.85,
                error_rate: 0.03,
                latency_p99_ms: 4000.0,
                utilization: 0.9,
            },
            DegradationLevel::Emergency => LevelThresholds {
                burn_rate: 0.95,
                error_rate: 0.1,
                latency_p99_ms: 8000.0,
                utilization: 0.97,
            },
        }
    }

    /// The action bundle applied while at this level.
    pub fn actions(self) -> ActionBundle {
        match self {
            DegradationLevel::Normal => ActionBundle {
                pause_flows: None,
                defer_steps: None,
                reduce_parallelism_pct: None,
                disable_features: vec![],
                reduce_module_calls_pct: None,
                enable_aggressive_caching: None,
                limit_connections: None,
            },
            DegradationLevel::Reduced => ActionBundle {
                pause_flows: None,
                defer_steps: Some(DeferStepsAction { heavy_only: true, cold_nodes_required: false }),
                reduce_parallelism_pct: Some(10.0),
                disable_features: vec!["detailed_logging".to_string()],
                reduce_module_calls_pct: None,
                enable_aggressive_caching: None,
                limit_connections: None,
            },
            DegradationLevel::Conservative => ActionBundle {
                pause_flows: Some(PauseFlowsAction { priority_class: "low".to_string(), max_count: 100 }),
                defer_steps: Some(DeferStepsAction { heavy_only: true, cold_nodes_required: true }),
                reduce_parallelism_pct: Some(30.0),
                disable_features: vec!["detailed_logging".to_string(), "real_time_dashboard".to_string()],
                reduce_module_calls_pct: Some(10.0),
                enable_aggressive_caching: Some(CachingAction { aggressive: true, ttl_multiplier: 2.0 }),
                limit_connections: None,
            },
            DegradationLevel::Critical => ActionBundle {
                pause_flows: Some(PauseFlowsAction { priority_class: "non-critical".to_string(), max_count: 1000 }),
                defer_steps: Some(DeferStepsAction { heavy_only: false, cold_nodes_required: true }),
                reduce_parallelism_pct: Some(60.0),
                disable_features: vec![
                    "detailed_logging".to_string(),
                    "real_time_dashboard".to_string(),
                    "webhook_processing".to_string(),
                ],
                reduce_module_calls_pct: Some(40.0),
                enable_aggressive_caching: Some(CachingAction { aggressive: true, ttl_multiplier: 4.0 }),
                limit_connections: Some(1000),
            },
            DegradationLevel::Emergency => ActionBundle {
                pause_flows: Some(PauseFlowsAction { priority_class: "non-critical".to_string(), max_count: u32::MAX }),
                defer_steps: Some(DeferStepsAction { heavy_only: false, cold_nodes_required: true }),
                reduce_parallelism_pct: Some(90.0),
                disable_features: vec![
                    "advanced_analytics".to_string(),
                    "detailed_logging".to_string(),
                    "real_time_dashboard".to_string(),
                    "webhook_processing".to_string(),
                    "external_integrations".to_string(),
                ],
                reduce_module_calls_pct: Some(70.0),
                enable_aggressive_caching: Some(CachingAction { aggressive: true, ttl_multiplier: 8.0 }),
                limit_connections: Some(100),
            },
        }
    }

    /// Expected SLA impact while sustained at this level.
    pub fn sla_impact(self) -> SlaImpact {
        match self {
            DegradationLevel::Normal => SlaImpact { latency_increase_pct: 0.0, throughput_reduction_pct: 0.0 },
            DegradationLevel::Reduced => SlaImpact { latency_increase_pct: 10.0, throughput_reduction_pct: 5.0 },
            DegradationLevel::Conservative => {
                SlaImpact { latency_increase_pct: 25.0, throughput_reduction_pct: 20.0 }
            }
            DegradationLevel::Critical => SlaImpact { latency_increase_pct: 50.0, throughput_reduction_pct: 45.0 },
            DegradationLevel::Emergency => {
                SlaImpact { latency_increase_pct: 100.0, throughput_reduction_pct: 70.0 }
            }
        }
    }
}

/// A paused flow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedFlow {
    /// Flow identifier
    pub id: FlowId,
    /// Why it was paused
    pub reason: String,
    /// When the pause was recorded
    pub paused_at: TimestampMs,
    /// Optional scheduled resume time
    pub resume_at: Option<TimestampMs>,
}

/// A deferred step record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredStep {
    /// Step identifier
    pub id: StepId,
    /// Why it was deferred
    pub reason: String,
    /// When the deferral was recorded
    pub deferred_at: TimestampMs,
    /// Cold node it was routed to
    pub target_node: NodeId,
}
