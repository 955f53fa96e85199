//! # Control-Plane Orchestration
//!
//! Wires every component together and drives them from a single ticker,
//! mirroring the shape of a classic monitor-analyze-plan-execute loop but
//! generalized to the adaptive-execution components: the aggregator and
//! correlation engine observe, the governor and ladder decide, the scaler
//! and cache act, and the dashboard reports. Each component still runs on
//! its own configured cadence; the controller's ticker is paced to the
//! shortest of them and skips the rest until their cadence elapses.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, error, info, instrument, warn};

use crate::aggregator::MetricsAggregator;
use crate::bus::EventBus;
use crate::cache::IntelligentCache;
use crate::clock::{SharedClock, WallClock};
use crate::config::ControlPlaneConfig;
use crate::correlation::CorrelationEngine;
use crate::dashboard::DashboardStream;
use crate::error::{GovernorError, Result};
use crate::governor::{BurnRateGovernor, CostConfig, GovernorAction};
use crate::ladder::DegradationLadder;
use crate::predictor::{LinearTrendPredictor, Predictor};
use crate::scaler::AdaptiveScaler;
use crate::types::{DegradationLevel, ModuleMetrics};

/// Orchestrates the full set of control-plane components from one ticker.
pub struct Controller {
    config: ControlPlaneConfig,
    clock: SharedClock,
    bus: Arc<EventBus>,
    aggregator: Arc<MetricsAggregator>,
    correlation: Arc<CorrelationEngine>,
    predictor: Arc<dyn Predictor>,
    governor: Arc<BurnRateGovernor>,
    ladder: Arc<DegradationLadder>,
    scaler: Arc<AdaptiveScaler>,
    cache: Arc<IntelligentCache>,
    dashboard: Arc<DashboardStream>,
    running: Arc<AtomicBool>,
    cycle_number: Arc<AtomicU64>,
}

impl Controller {
    /// Build a controller from `config`, backed by the real wall clock.
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self::with_clock(config, Arc::new(WallClock))
    }

    /// Build a controller with an explicit clock, so every component shares
    /// one time source (primarily for deterministic tests).
    pub fn with_clock(config: ControlPlaneConfig, clock: SharedClock) -> Self {
        info!("initializing control plane");

        let bus = Arc::new(EventBus::new(clock.clone()));
        let aggregator = Arc::new(MetricsAggregator::with_config(
            clock.clone(),
            bus.clone(),
            config.aggregator.histogram_capacity,
            config.aggregator.retention_ms,
        ));
        let correlation = Arc::new(CorrelationEngine::with_config(
            clock.clone(),
            bus.clone(),
            config.correlation.history_capacity,
            config.correlation.sample_interval_ms,
        ));
        let predictor: Arc<dyn Predictor> = Arc::new(LinearTrendPredictor::new(clock.clone()));
        let governor = Arc::new(BurnRateGovernor::new(
            clock.clone(),
            bus.clone(),
            CostConfig {
                hourly_limit: config.governor.hourly_cost_limit,
                max_burn_rate_threshold: config.governor.max_burn_rate_threshold,
            },
        ));
        let ladder = Arc::new(DegradationLadder::with_cooldown(clock.clone(), bus.clone(), config.ladder.cooldown_ms));
        let scaler = Arc::new(AdaptiveScaler::with_cooldown(clock.clone(), bus.clone(), config.scaler.cooldown_ms));
        let cache = Arc::new(IntelligentCache::with_config(
            clock.clone(),
            bus.clone(),
            config.cache.namespace_capacity,
            config.cache.default_ttl_ms,
        ));
        let dashboard = Arc::new(DashboardStream::with_config(
            clock.clone(),
            config.dashboard.channel_capacity,
            config.dashboard.heartbeat_timeout_ms(),
        ));

        Self {
            config,
            clock,
            bus,
            aggregator,
            correlation,
            predictor,
            governor,
            ladder,
            scaler,
            cache,
            dashboard,
            running: Arc::new(AtomicBool::new(false)),
            cycle_number: Arc::new(AtomicU64::new(0)),
        }
    }

    fn base_tick_ms(&self) -> u64 {
        [
            self.config.aggregator.tick_ms,
            self.config.correlation.tick_ms,
            self.config.cache.tick_ms,
            self.config.governor.tick_ms,
            self.config.ladder.tick_ms,
            self.config.scaler.tick_ms,
            self.config.dashboard.heartbeat_interval_ms,
        ]
        .into_iter()
        .min()
        .unwrap_or(1_000)
        .max(1)
    }

    fn due(&self, cycle: u64, component_tick_ms: u64, base_tick_ms: u64) -> bool {
        let every = (component_tick_ms / base_tick_ms).max(1);
        cycle % every == 0
    }

    /// Run the control loop until [`Controller::stop`] is called. Each tick
    /// failure is logged and the loop continues; only an already-running
    /// controller returns an error.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GovernorError::InvariantViolation {
                component: "controller".to_string(),
                detail: "controller already running".to_string(),
            });
        }

        let base_tick_ms = self.base_tick_ms();
        info!(base_tick_ms, "starting control loop");
        let mut ticker = interval(Duration::from_millis(base_tick_ms));

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let cycle = self.cycle_number.fetch_add(1, Ordering::SeqCst) + 1;
            if let Err(e) = self.execute_cycle(cycle, base_tick_ms).await {
                error!(cycle, error = %e, "control-plane cycle failed, continuing");
            }
        }

        info!("control loop stopped");
        Ok(())
    }

    /// Signal the running loop to stop after its current tick.
    pub async fn stop(&self) {
        info!("stopping control loop");
        self.running.store(false, Ordering::SeqCst);
    }

    #[instrument(skip(self))]
    async fn execute_cycle(&self, cycle: u64, base_tick_ms: u64) -> Result<()> {
        if self.due(cycle, self.config.aggregator.tick_ms, base_tick_ms) {
            self.aggregator.evict_expired().await;
        }

        if self.due(cycle, self.config.cache.tick_ms, base_tick_ms) {
            // Publishes its own `cache_expired`/`cleanup_completed` events.
            self.cache.evict_expired().await;
        }

        if self.due(cycle, self.config.dashboard.heartbeat_interval_ms, base_tick_ms) {
            self.dashboard.heartbeat().await;
            self.dashboard.prune_stale().await;
        }

        let snapshots = self.aggregator.snapshot_all().await;

        if self.due(cycle, self.config.correlation.tick_ms, base_tick_ms) {
            for snap in &snapshots {
                self.correlation
                    .record_sample(&snap.module, snap.latency.p99, snap.throughput, snap.error_rate)
                    .await;
            }
            self.correlation.recompute().await;
        }

        for snap in &snapshots {
            self.evaluate_module(snap, cycle, base_tick_ms).await;
        }

        Ok(())
    }

    async fn evaluate_module(&self, snap: &ModuleMetrics, cycle: u64, base_tick_ms: u64) {
        let context = self.build_context(snap).await;

        self.dashboard
            .publish_metrics(&snap.module, serde_json::to_value(snap).unwrap_or_default())
            .await;

        if self.due(cycle, self.config.ladder.tick_ms, base_tick_ms) {
            let level = self.ladder.tick(&context).await;
            if level == DegradationLevel::Emergency {
                // Publishes its own `emergency_response_initiated` event.
                let action = self.scaler.emergency_shed(&snap.module, 1).await;
                warn!(module = %snap.module, ?action.direction, "emergency shed triggered by ladder");
            }
        }

        if self.due(cycle, self.config.governor.tick_ms, base_tick_ms) {
            // Publishes its own `cost_control_policy_executed` event per triggered policy.
            let actions = self.governor.evaluate_policies(&context).await;
            for action in actions {
                self.dispatch_governor_action(&snap.module, &action).await;
            }
        }

        if self.due(cycle, self.config.scaler.tick_ms, base_tick_ms) {
            // Publishes its own `scale_up_initiated`/`scale_down_initiated` event.
            self.scaler.evaluate_scaling(&snap.module, &context).await;
            // Publishes its own `load_redirection_initiated` event.
            if let Some(redirect) = self.scaler.evaluate_redirection(&context).await {
                debug!(from = %redirect.from_node, to = %redirect.to_node, reason = %redirect.reason, "redirection evaluated");
            }
        }
    }

    /// Translate a metrics snapshot into the expression language's metric
    /// vocabulary, including the current burn rate from the governor.
    async fn build_context(&self, snap: &ModuleMetrics) -> HashMap<String, f64> {
        let burn_rate = self
            .governor
            .compute_burn_rate(
                snap.utilization.cpu,
                snap.utilization.mem,
                snap.latency.p99 / SLO_LATENCY_P99_MS,
                snap.error_rate / SLO_ERROR_RATE,
                0.0,
            )
            .await;

        let mut ctx = HashMap::new();
        ctx.insert("latency_p99".to_string(), snap.latency.p99);
        ctx.insert("error_rate".to_string(), snap.error_rate);
        ctx.insert("cpu_utilization".to_string(), snap.utilization.cpu);
        ctx.insert("memory_utilization".to_string(), snap.utilization.mem);
        ctx.insert("throughput".to_string(), snap.throughput);
        ctx.insert("burn_rate".to_string(), burn_rate.overall);
        ctx
    }

    /// Dispatch the effect a triggered governor policy asks for. The policy
    /// firing itself is already recorded via `cost_control_policy_executed`;
    /// this publishes the canonical action-specific topic the effect maps to.
    async fn dispatch_governor_action(&self, module: &str, action: &GovernorAction) {
        match action {
            GovernorAction::Throttle(target) => {
                self.bus
                    .publish("heavy_steps_deferred", serde_json::json!({ "module": target }))
                    .await;
            }
            GovernorAction::PauseNonCritical => {
                self.bus
                    .publish("low_priority_flows_paused", serde_json::json!({ "module": module }))
                    .await;
            }
            GovernorAction::AlertOnly(message) => {
                debug!(module, message, "governor alert-only action, no canonical topic to dispatch");
            }
        }
    }

    /// Current wall time per the shared clock.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Shared event bus.
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Shared metrics aggregator.
    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Shared correlation engine.
    pub fn correlation(&self) -> Arc<CorrelationEngine> {
        Arc::clone(&self.correlation)
    }

    /// Shared predictor.
    pub fn predictor(&self) -> Arc<dyn Predictor> {
        Arc::clone(&self.predictor)
    }

    /// Shared burn-rate governor.
    pub fn governor(&self) -> Arc<BurnRateGovernor> {
        Arc::clone(&self.governor)
    }

    /// Shared degradation ladder.
    pub fn ladder(&self) -> Arc<DegradationLadder> {
        Arc::clone(&self.ladder)
    }

    /// Shared adaptive scaler.
    pub fn scaler(&self) -> Arc<AdaptiveScaler> {
        Arc::clone(&self.scaler)
    }

    /// Shared intelligent cache.
    pub fn cache(&self) -> Arc<IntelligentCache> {
        Arc::clone(&self.cache)
    }

    /// Shared dashboard stream.
    pub fn dashboard(&self) -> Arc<DashboardStream> {
        Arc::clone(&self.dashboard)
    }
}

/// SLO target for p99 latency, milliseconds, used to normalize `latency_burn`.
const SLO_LATENCY_P99_MS: f64 = 2000.0;
/// SLO target for error rate, used to normalize `error_burn`.
const SLO_ERROR_RATE: f64 = 0.001;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    fn controller() -> Controller {
        Controller::with_clock(ControlPlaneConfig::default(), Arc::new(VirtualClock::new(0)))
    }

    #[tokio::test]
    async fn starting_twice_errors() {
        let controller = Arc::new(controller());
        let c2 = controller.clone();
        let handle = tokio::spawn(async move { c2.start().await });
        tokio::task::yield_now().await;

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, GovernorError::InvariantViolation { .. }));

        controller.stop().await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn a_cycle_without_modules_does_not_error() {
        let controller = controller();
        controller.execute_cycle(1, controller.base_tick_ms()).await.unwrap();
    }

    #[tokio::test]
    async fn evaluating_a_module_publishes_a_dashboard_update() {
        let controller = controller();
        controller.aggregator.record_latency("qflow", 10.0).await.unwrap();
        controller.aggregator.record_request("qflow", true).await.unwrap();

        let (_id, mut rx) = controller.dashboard.subscribe(vec![]).await;
        rx.recv().await.unwrap(); // welcome

        let snap = controller.aggregator.snapshot("qflow").await.unwrap();
        controller.evaluate_module(&snap, 1, controller.base_tick_ms()).await;

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, crate::dashboard::DashboardFrame::MetricsUpdate { .. }));
    }

    #[tokio::test]
    async fn emergency_ladder_level_sheds_load() {
        let controller = controller();
        controller
            .ladder
            .register_trigger(DegradationLevel::Emergency, "error_rate > 0.5")
            .await
            .unwrap();

        controller.aggregator.record_latency("qflow", 10.0).await.unwrap();
        for _ in 0..10 {
            controller.aggregator.record_request("qflow", false).await.unwrap();
        }

        let snap = controller.aggregator.snapshot("qflow").await.unwrap();
        controller.evaluate_module(&snap, 1, controller.base_tick_ms()).await;

        assert_eq!(controller.ladder.level().await, DegradationLevel::Emergency);
    }
}
