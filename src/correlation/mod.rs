//! # Correlation Engine
//!
//! Tracks a declared module dependency topology and a rolling history of
//! per-module latency/throughput/error samples, then derives:
//!
//! - a pairwise correlation matrix (combined Pearson coefficient across the
//!   three series, classified by strength/sign/direction/lag)
//! - an [`EcosystemHealthIndex`] composite score
//! - critical paths through the topology, flagging bottleneck modules
//!
//! Samples are expected to arrive on a roughly uniform cadence; `sample_interval_ms`
//! is used only to convert a lag measured in samples into milliseconds for display.

use std::collections::VecDeque;
use hashbrown::HashMap;

use tokio::sync::RwLock;
use tracing::instrument;

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::types::{
    CorrelationAnalysis, CorrelationStrength, CorrelationType, CriticalPath, EcosystemHealthIndex,
    ImpactDirection, ModuleHealth, ModuleId, ModuleMetrics,
};

/// Default number of samples retained per module for correlation analysis.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Maximum lag, in samples, searched when estimating causal lag.
const MAX_LAG_SAMPLES: i64 = 5;

/// Bottleneck threshold on [`ModuleHealth::score`].
const BOTTLENECK_HEALTH_THRESHOLD: f64 = 0.7;

/// Maximum depth walked from each declared root when building critical paths.
const CRITICAL_PATH_DEPTH: usize = 3;

#[derive(Debug, Clone, Default)]
struct SampleSeries {
    latency: VecDeque<f64>,
    throughput: VecDeque<f64>,
    error_rate: VecDeque<f64>,
}

impl SampleSeries {
    fn push(&mut self, latency: f64, throughput: f64, error_rate: f64, capacity: usize) {
        self.latency.push_back(latency);
        self.throughput.push_back(throughput);
        self.error_rate.push_back(error_rate);
        while self.latency.len() > capacity {
            self.latency.pop_front();
            self.throughput.pop_front();
            self.error_rate.pop_front();
        }
    }

    fn len(&self) -> usize {
        self.latency.len()
    }
}

/// Pearson correlation coefficient between two equal-length slices, clamped
/// to `[-1, 1]` and `0` for degenerate (empty, mismatched, or constant)
/// input rather than `NaN`.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len();
    if n == 0 || n != b.len() {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

/// Best lag (in samples, `a` leading `b` when positive) by magnitude of
/// correlation within `[-MAX_LAG_SAMPLES, MAX_LAG_SAMPLES]`.
fn best_lag(a: &[f64], b: &[f64]) -> (i64, f64) {
    let n = a.len() as i64;
    let mut best = (0i64, pearson(a, b));

    for lag in 1..=MAX_LAG_SAMPLES.min(n.saturating_sub(2)) {
        let lag_u = lag as usize;
        if (lag_u) < a.len() {
            let r = pearson(&a[..a.len() - lag_u], &b[lag_u..]);
            if r.abs() > best.1.abs() {
                best = (lag, r);
            }
            let r2 = pearson(&a[lag_u..], &b[..b.len() - lag_u]);
            if r2.abs() > best.1.abs() {
                best = (-lag, r2);
            }
        }
    }
    best
}

/// Tracks module topology and sample history, derives correlations and EHI.
pub struct CorrelationEngine {
    clock: SharedClock,
    bus: SharedBus,
    topology: RwLock<HashMap<ModuleId, Vec<ModuleId>>>,
    history: RwLock<HashMap<ModuleId, SampleSeries>>,
    matrix: RwLock<HashMap<(ModuleId, ModuleId), CorrelationAnalysis>>,
    history_capacity: usize,
    sample_interval_ms: i64,
}

impl CorrelationEngine {
    /// Create an engine with default capacity and a 1s assumed sample cadence.
    pub fn new(clock: SharedClock, bus: SharedBus) -> Self {
        Self::with_config(clock, bus, DEFAULT_HISTORY_CAPACITY, 1_000)
    }

    /// Create an engine with explicit history capacity and sample cadence.
    pub fn with_config(clock: SharedClock, bus: SharedBus, history_capacity: usize, sample_interval_ms: i64) -> Self {
        Self {
            clock,
            bus,
            topology: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            matrix: RwLock::new(HashMap::new()),
            history_capacity,
            sample_interval_ms,
        }
    }

    /// Declare that `from` depends on `to`.
    #[instrument(skip(self))]
    pub async fn declare_dependency(&self, from: impl Into<ModuleId>, to: impl Into<ModuleId>) {
        let mut topo = self.topology.write().await;
        topo.entry(from.into()).or_insert_with(Vec::new).push(to.into());
    }

    /// Ingest one sample for `module` into its rolling history.
    #[instrument(skip(self))]
    pub async fn record_sample(&self, module: &str, latency_p99: f64, throughput: f64, error_rate: f64) {
        {
            let mut history = self.history.write().await;
            let series = history.entry(module.to_string()).or_insert_with(SampleSeries::default);
            series.push(latency_p99, throughput, error_rate, self.history_capacity);
        }
        self.bus
            .publish(
                "module_metrics_updated",
                serde_json::json!({ "module": module, "latency_p99": latency_p99, "throughput": throughput, "error_rate": error_rate }),
            )
            .await;
    }

    /// Recompute the full pairwise correlation matrix from current history.
    #[instrument(skip(self))]
    pub async fn recompute(&self) {
        let history = self.history.read().await;
        let topology = self.topology.read().await;
        let names: Vec<ModuleId> = history.keys().cloned().collect();
        let mut matrix = HashMap::new();

        for i in 0..names.len() {
            for j in 0..names.len() {
                if i == j {
                    continue;
                }
                let a = &history[&names[i]];
                let b = &history[&names[j]];
                let n = a.len().min(b.len());
                if n < 3 {
                    continue;
                }

                let a_lat: Vec<f64> = a.latency.iter().rev().take(n).cloned().collect();
                let b_lat: Vec<f64> = b.latency.iter().rev().take(n).cloned().collect();
                let a_thr: Vec<f64> = a.throughput.iter().rev().take(n).cloned().collect();
                let b_thr: Vec<f64> = b.throughput.iter().rev().take(n).cloned().collect();
                let a_err: Vec<f64> = a.error_rate.iter().rev().take(n).cloned().collect();
                let b_err: Vec<f64> = b.error_rate.iter().rev().take(n).cloned().collect();

                let r_latency = pearson(&a_lat, &b_lat);
                let r_throughput = pearson(&a_thr, &b_thr);
                let r_error = pearson(&a_err, &b_err);
                let r = 0.4 * r_latency + 0.4 * r_throughput + 0.2 * r_error;

                let (lag_samples, _) = best_lag(&a_lat, &b_lat);
                let confidence = (n as f64 / 30.0).min(1.0);

                let direction = if lag_samples > 0 {
                    ImpactDirection::AToB
                } else if lag_samples < 0 {
                    ImpactDirection::BToA
                } else if r.abs() < 0.1 {
                    ImpactDirection::Independent
                } else if topology.get(&names[i]).is_some_and(|deps| deps.contains(&names[j])) {
                    // a declares a dependency on b: b's behavior drives a's.
                    ImpactDirection::BToA
                } else if topology.get(&names[j]).is_some_and(|deps| deps.contains(&names[i])) {
                    ImpactDirection::AToB
                } else {
                    ImpactDirection::Bidirectional
                };

                matrix.insert(
                    (names[i].clone(), names[j].clone()),
                    CorrelationAnalysis {
                        a: names[i].clone(),
                        b: names[j].clone(),
                        r,
                        strength: CorrelationStrength::from_r(r),
                        kind: CorrelationType::from_r(r),
                        confidence,
                        impact_direction: direction,
                        lag_ms: lag_samples * self.sample_interval_ms,
                    },
                );
            }
        }

        let pair_count = matrix.len();
        *self.matrix.write().await = matrix;
        self.bus
            .publish("correlation_matrix_updated", serde_json::json!({ "pairs": pair_count }))
            .await;
    }

    /// Look up the correlation analysis for an ordered pair, mirroring the
    /// reverse entry's direction when only the mirror is stored.
    pub async fn correlation(&self, a: &str, b: &str) -> Option<CorrelationAnalysis> {
        let matrix = self.matrix.read().await;
        if let Some(entry) = matrix.get(&(a.to_string(), b.to_string())) {
            return Some(entry.clone());
        }
        matrix.get(&(b.to_string(), a.to_string())).map(|mirrored| CorrelationAnalysis {
            a: a.to_string(),
            b: b.to_string(),
            r: mirrored.r,
            strength: mirrored.strength,
            kind: mirrored.kind,
            confidence: mirrored.confidence,
            impact_direction: mirrored.impact_direction.reversed(),
            lag_ms: -mirrored.lag_ms,
        })
    }

    /// Compute the [`EcosystemHealthIndex`] from a metrics snapshot.
    pub fn ecosystem_health(&self, metrics: &[ModuleMetrics]) -> EcosystemHealthIndex {
        if metrics.is_empty() {
            return EcosystemHealthIndex::default();
        }
        let n = metrics.len() as f64;

        let connectivity = metrics.iter().map(|m| m.availability).sum::<f64>() / n;
        let performance = metrics
            .iter()
            .map(|m| {
                let lat_score = (1.0 - (m.latency.p99 / 5000.0)).clamp(0.0, 1.0);
                let thr_score = (m.throughput / 100.0).clamp(0.0, 1.0);
                0.5 * lat_score + 0.5 * thr_score
            })
            .sum::<f64>()
            / n;
        let reliability = metrics.iter().map(|m| (1.0 - m.error_rate).clamp(0.0, 1.0)).sum::<f64>() / n;
        let scalability = metrics
            .iter()
            .map(|m| (1.0 - m.utilization.cpu.max(m.utilization.mem)).clamp(0.0, 1.0))
            .sum::<f64>()
            / n;

        EcosystemHealthIndex::compose(connectivity, performance, reliability, scalability)
    }

    /// Walk the declared topology from each `root`, up to a fixed depth,
    /// flagging modules whose health score falls below the bottleneck
    /// threshold.
    #[instrument(skip(self, health_by_module))]
    pub async fn critical_paths(
        &self,
        roots: &[ModuleId],
        health_by_module: &HashMap<ModuleId, ModuleHealth>,
    ) -> Vec<CriticalPath> {
        let topo = self.topology.read().await;
        let mut paths = Vec::new();

        for root in roots {
            let mut modules = Vec::new();
            let mut bottlenecks = Vec::new();
            let mut frontier = vec![root.clone()];
            let mut visited = hashbrown::HashSet::new();

            for _ in 0..=CRITICAL_PATH_DEPTH {
                let mut next = Vec::new();
                for node in frontier {
                    if !visited.insert(node.clone()) {
                        continue;
                    }
                    modules.push(node.clone());
                    let health = health_by_module.get(&node).copied().unwrap_or(ModuleHealth::Unknown);
                    if health.score() < BOTTLENECK_HEALTH_THRESHOLD {
                        bottlenecks.push(node.clone());
                    }
                    if let Some(children) = topo.get(&node) {
                        next.extend(children.iter().cloned());
                    }
                }
                frontier = next;
                if frontier.is_empty() {
                    break;
                }
            }

            let path_health = if modules.is_empty() {
                0.0
            } else {
                modules
                    .iter()
                    .map(|m| health_by_module.get(m).copied().unwrap_or(ModuleHealth::Unknown).score())
                    .sum::<f64>()
                    / modules.len() as f64
            };

            paths.push(CriticalPath {
                modules,
                path_health,
                bottlenecks,
            });
        }

        paths
    }

    /// Current wall time per the engine's clock, exposed for callers building
    /// timestamped diagnostics.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    fn engine() -> CorrelationEngine {
        let clock = Arc::new(VirtualClock::new(0));
        CorrelationEngine::new(clock.clone(), Arc::new(EventBus::new(clock)))
    }

    #[tokio::test]
    async fn positive_correlation_detected() {
        let engine = engine();
        for i in 0..10 {
            let v = i as f64 * 10.0;
            engine.record_sample("qflow", v, v, 0.0).await;
            engine.record_sample("qindex", v, v, 0.0).await;
        }
        engine.recompute().await;

        let corr = engine.correlation("qflow", "qindex").await.unwrap();
        assert!(corr.r > 0.9);
        assert_eq!(corr.kind, CorrelationType::Positive);
    }

    #[tokio::test]
    async fn mirrored_entry_reverses_direction() {
        let engine = engine();
        for i in 0..10 {
            let v = i as f64;
            engine.record_sample("a", v, v, 0.0).await;
            engine.record_sample("b", v + 1.0, v + 1.0, 0.0).await;
        }
        engine.recompute().await;

        let forward = engine.correlation("a", "b").await.unwrap();
        let backward = engine.correlation("b", "a").await.unwrap();
        assert_eq!(forward.impact_direction, backward.impact_direction.reversed());
    }

    #[tokio::test]
    async fn ecosystem_health_is_bounded() {
        let engine = engine();
        let metrics = vec![ModuleMetrics {
            module: "qflow".into(),
            timestamp: 0,
            latency: crate::types::LatencyTriple {
                p50: 10.0,
                p95: 20.0,
                p99: 30.0,
            },
            throughput: 500.0,
            error_rate: 0.01,
            availability: 0.999,
            utilization: crate::types::UtilizationTriple {
                cpu: 0.5,
                mem: 0.4,
                net: 0.1,
            },
        }];
        let ehi = engine.ecosystem_health(&metrics);
        assert!(ehi.overall >= 0.0 && ehi.overall <= 1.0);
    }

    #[tokio::test]
    async fn critical_path_flags_bottleneck() {
        let engine = engine();
        engine.declare_dependency("qflow", "qindex").await;
        engine.declare_dependency("qindex", "qstore").await;

        let mut health = HashMap::new();
        health.insert("qflow".to_string(), ModuleHealth::Healthy);
        health.insert("qindex".to_string(), ModuleHealth::Critical);
        health.insert("qstore".to_string(), ModuleHealth::Healthy);

        let paths = engine.critical_paths(&["qflow".to_string()], &health).await;
        assert_eq!(paths.len(), 1);
        assert!(paths[0].bottlenecks.contains(&"qindex".to_string()));
    }
}
