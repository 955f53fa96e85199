//! # Metrics Aggregator
//!
//! Collects per-module latency, throughput, error, and resource samples,
//! maintains bounded histograms for percentile queries, and exposes a
//! Prometheus text-format export. This is the sole ingestion point for raw
//! observations — every other component reads derived [`ModuleMetrics`]
//! snapshots from here rather than touching raw samples.
//!
//! ## Responsibilities
//!
//! - Record latency samples, request outcomes, cache operations, flow
//!   executions, and validation-pipeline runs
//! - Maintain a capped histogram per `(module, metric)` for percentile math
//! - Roll up windowed samples into [`ModuleMetrics`] snapshots on demand
//! - Evict samples older than the retention window

use hashbrown::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::error::{GovernorError, Result};
use crate::types::{LatencyTriple, ModuleId, ModuleMetrics, TimestampMs, UtilizationTriple};

/// Default number of samples retained per histogram before the oldest is evicted.
pub const DEFAULT_HISTOGRAM_CAPACITY: usize = 1_000;

/// Default retention window for raw samples, milliseconds (15 minutes).
pub const DEFAULT_RETENTION_MS: i64 = 15 * 60 * 1000;

/// A capped, insertion-ordered sample set supporting percentile queries.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    samples: Vec<(TimestampMs, f64)>,
    capacity: usize,
}

impl Histogram {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity,
        }
    }

    fn record(&mut self, at: TimestampMs, value: f64) {
        self.samples.push((at, value));
        if self.samples.len() > self.capacity {
            self.samples.remove(0);
        }
    }

    fn evict_before(&mut self, cutoff: TimestampMs) {
        self.samples.retain(|(t, _)| *t >= cutoff);
    }

    /// Percentile `p` in `(0, 1]`, using `ceil(n * p) - 1` clamped to `[0, n-1]`.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = values.len();
        let idx = ((n as f64 * p).ceil() as isize - 1).clamp(0, n as isize - 1) as usize;
        values[idx]
    }

    /// Arithmetic mean of retained samples.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| v).sum::<f64>() / self.samples.len() as f64
    }

    /// Sum of retained sample values.
    pub fn sum(&self) -> f64 {
        self.samples.iter().map(|(_, v)| v).sum()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the histogram currently holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Monotonically increasing named counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter(pub u64);

impl Counter {
    fn incr(&mut self, by: u64) {
        self.0 += by;
    }
}

/// Instantaneous named gauge.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gauge(pub f64);

#[derive(Debug, Default)]
struct ModuleState {
    latency_hist: Histogram,
    throughput_hist: Histogram,
    requests_total: Counter,
    errors_total: Counter,
    cache_hits: Counter,
    cache_misses: Counter,
    cpu_gauge: Gauge,
    mem_gauge: Gauge,
    net_gauge: Gauge,
    availability_gauge: Gauge,
    last_seen: TimestampMs,
}

impl ModuleState {
    fn new(capacity: usize) -> Self {
        Self {
            latency_hist: Histogram::new(capacity),
            throughput_hist: Histogram::new(capacity),
            availability_gauge: Gauge(1.0),
            ..Default::default()
        }
    }
}

/// Aggregates raw samples into per-module metrics snapshots.
pub struct MetricsAggregator {
    clock: SharedClock,
    bus: SharedBus,
    modules: RwLock<HashMap<ModuleId, ModuleState>>,
    histogram_capacity: usize,
    retention_ms: i64,
}

impl MetricsAggregator {
    /// Create an aggregator with default capacity and retention.
    pub fn new(clock: SharedClock, bus: SharedBus) -> Self {
        Self::with_config(clock, bus, DEFAULT_HISTOGRAM_CAPACITY, DEFAULT_RETENTION_MS)
    }

    /// Create an aggregator with explicit histogram capacity and retention window.
    pub fn with_config(clock: SharedClock, bus: SharedBus, histogram_capacity: usize, retention_ms: i64) -> Self {
        Self {
            clock,
            bus,
            modules: RwLock::new(HashMap::new()),
            histogram_capacity,
            retention_ms,
        }
    }

    async fn ensure_module<'a>(
        modules: &'a mut HashMap<ModuleId, ModuleState>,
        module: &str,
        capacity: usize,
    ) -> &'a mut ModuleState {
        modules
            .entry(module.to_string())
            .or_insert_with(|| ModuleState::new(capacity))
    }

    /// Record an arbitrary named metric value for `module`, publishing
    /// `metric_recorded`.
    #[instrument(skip(self))]
    pub async fn record_metric(&self, module: &str, name: &str, value: f64) {
        self.bus
            .publish("metric_recorded", serde_json::json!({ "module": module, "name": name, "value": value }))
            .await;
    }

    /// Record a latency sample for `module`, in milliseconds.
    #[instrument(skip(self))]
    pub async fn record_latency(&self, module: &str, latency_ms: f64) -> Result<()> {
        if latency_ms < 0.0 {
            return Err(GovernorError::InvalidInput(format!(
                "negative latency for {module}: {latency_ms}"
            )));
        }
        let now = self.clock.now_ms();
        {
            let mut modules = self.modules.write().await;
            let state = Self::ensure_module(&mut modules, module, self.histogram_capacity).await;
            state.latency_hist.record(now, latency_ms);
            state.last_seen = now;
        }
        self.bus
            .publish("latency_recorded", serde_json::json!({ "module": module, "latency_ms": latency_ms }))
            .await;
        Ok(())
    }

    /// Record one request outcome for `module`.
    #[instrument(skip(self))]
    pub async fn record_request(&self, module: &str, succeeded: bool) -> Result<()> {
        let now = self.clock.now_ms();
        {
            let mut modules = self.modules.write().await;
            let state = Self::ensure_module(&mut modules, module, self.histogram_capacity).await;
            state.requests_total.incr(1);
            if !succeeded {
                state.errors_total.incr(1);
            }
            state.throughput_hist.record(now, 1.0);
            state.last_seen = now;
        }
        self.bus
            .publish("request_recorded", serde_json::json!({ "module": module, "succeeded": succeeded }))
            .await;
        Ok(())
    }

    /// Record a cache hit or miss attributed to `module`.
    #[instrument(skip(self))]
    pub async fn record_cache_op(&self, module: &str, hit: bool) -> Result<()> {
        {
            let mut modules = self.modules.write().await;
            let state = Self::ensure_module(&mut modules, module, self.histogram_capacity).await;
            if hit {
                state.cache_hits.incr(1);
            } else {
                state.cache_misses.incr(1);
            }
        }
        self.bus
            .publish("cache_operation_recorded", serde_json::json!({ "module": module, "hit": hit }))
            .await;
        Ok(())
    }

    /// Record resource utilization for `module`.
    #[instrument(skip(self))]
    pub async fn record_utilization(&self, module: &str, util: UtilizationTriple) -> Result<()> {
        let mut modules = self.modules.write().await;
        let state = Self::ensure_module(&mut modules, module, self.histogram_capacity).await;
        state.cpu_gauge = Gauge(util.cpu);
        state.mem_gauge = Gauge(util.mem);
        state.net_gauge = Gauge(util.net);
        Ok(())
    }

    /// Record the outcome of one flow execution: its modules' latency and
    /// whether it ultimately succeeded.
    #[instrument(skip(self, module_latencies))]
    pub async fn record_flow_execution(&self, module_latencies: &[(String, f64)], succeeded: bool) -> Result<()> {
        for (module, latency_ms) in module_latencies {
            self.record_latency(module, *latency_ms).await?;
            self.record_request(module, succeeded).await?;
        }
        self.bus
            .publish(
                "flow_execution_recorded",
                serde_json::json!({ "modules": module_latencies.iter().map(|(m, _)| m).collect::<Vec<_>>(), "succeeded": succeeded }),
            )
            .await;
        Ok(())
    }

    /// Record the outcome of one validation-pipeline run against `module`.
    #[instrument(skip(self))]
    pub async fn record_validation_pipeline(&self, module: &str, duration_ms: f64, passed: bool) -> Result<()> {
        self.record_latency(module, duration_ms).await?;
        self.record_request(module, passed).await?;
        self.bus
            .publish(
                "validation_pipeline_recorded",
                serde_json::json!({ "module": module, "duration_ms": duration_ms, "passed": passed }),
            )
            .await;
        Ok(())
    }

    /// Update an explicit availability gauge for `module` (0..1).
    #[instrument(skip(self))]
    pub async fn record_availability(&self, module: &str, availability: f64) -> Result<()> {
        let mut modules = self.modules.write().await;
        let state = Self::ensure_module(&mut modules, module, self.histogram_capacity).await;
        state.availability_gauge = Gauge(availability.clamp(0.0, 1.0));
        Ok(())
    }

    /// Roll up the current window into a [`ModuleMetrics`] snapshot.
    #[instrument(skip(self))]
    pub async fn snapshot(&self, module: &str) -> Result<ModuleMetrics> {
        let modules = self.modules.read().await;
        let state = modules
            .get(module)
            .ok_or_else(|| GovernorError::Aggregator(format!("no samples for module {module}")))?;

        let requests = state.requests_total.0.max(1) as f64;
        let error_rate = state.errors_total.0 as f64 / requests;

        Ok(ModuleMetrics {
            module: module.to_string(),
            timestamp: state.last_seen,
            latency: LatencyTriple {
                p50: state.latency_hist.percentile(0.50),
                p95: state.latency_hist.percentile(0.95),
                p99: state.latency_hist.percentile(0.99),
            },
            throughput: state.throughput_hist.len() as f64,
            error_rate,
            availability: state.availability_gauge.0,
            utilization: UtilizationTriple {
                cpu: state.cpu_gauge.0,
                mem: state.mem_gauge.0,
                net: state.net_gauge.0,
            },
        })
    }

    /// Snapshot every module currently tracked.
    #[instrument(skip(self))]
    pub async fn snapshot_all(&self) -> Vec<ModuleMetrics> {
        let names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(snap) = self.snapshot(&name).await {
                out.push(snap);
            }
        }
        self.bus
            .publish("aggregation_completed", serde_json::json!({ "modules": out.len() }))
            .await;
        out
    }

    /// Cache hit ratio for `module`, 0..1.
    pub async fn cache_hit_ratio(&self, module: &str) -> f64 {
        let modules = self.modules.read().await;
        match modules.get(module) {
            Some(state) => {
                let total = state.cache_hits.0 + state.cache_misses.0;
                if total == 0 {
                    0.0
                } else {
                    state.cache_hits.0 as f64 / total as f64
                }
            }
            None => 0.0,
        }
    }

    /// Drop samples older than the retention window.
    #[instrument(skip(self))]
    pub async fn evict_expired(&self) {
        let cutoff = self.clock.now_ms() - self.retention_ms;
        {
            let mut modules = self.modules.write().await;
            for state in modules.values_mut() {
                state.latency_hist.evict_before(cutoff);
                state.throughput_hist.evict_before(cutoff);
            }
        }
        debug!(cutoff, "evicted samples older than retention window");
    }

    /// Render all tracked modules' counters/gauges as Prometheus text format,
    /// including p50/p95/p99 quantile summaries (seconds) with `_count`/`_sum`.
    pub async fn export_prometheus(&self) -> String {
        let modules = self.modules.read().await;
        let mut out = String::new();
        for (name, state) in modules.iter() {
            out.push_str(&format!(
                "governor_requests_total{{module=\"{name}\"}} {}\n",
                state.requests_total.0
            ));
            out.push_str(&format!(
                "governor_errors_total{{module=\"{name}\"}} {}\n",
                state.errors_total.0
            ));

            for (label, p) in [("0.5", 0.50), ("0.95", 0.95), ("0.99", 0.99)] {
                out.push_str(&format!(
                    "governor_latency_seconds{{module=\"{name}\",quantile=\"{label}\"}} {}\n",
                    state.latency_hist.percentile(p) / 1000.0
                ));
            }
            out.push_str(&format!(
                "governor_latency_seconds_count{{module=\"{name}\"}} {}\n",
                state.latency_hist.len()
            ));
            out.push_str(&format!(
                "governor_latency_seconds_sum{{module=\"{name}\"}} {}\n",
                state.latency_hist.sum() / 1000.0
            ));

            out.push_str(&format!(
                "governor_cpu_utilization{{module=\"{name}\"}} {}\n",
                state.cpu_gauge.0
            ));
            out.push_str(&format!(
                "governor_memory_utilization{{module=\"{name}\"}} {}\n",
                state.mem_gauge.0
            ));
        }
        out
    }
}
