//! # Burn-Rate Governor
//!
//! Tracks per-operation error budgets and a combined cost/performance burn
//! rate for the mesh, and evaluates declarative cost-control policies
//! (expressed in the [`crate::expr`] language) against the current metric
//! context to decide when to throttle or alert. Every state transition is
//! published to the event bus so dashboards and downstream automation can
//! observe governor activity without polling.

use hashbrown::HashMap;

use tokio::sync::RwLock;
use tracing::{instrument, warn};

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::error::{GovernorError, Result};
use crate::expr::{self, Expr};
use crate::types::{BurnRateMetrics, ErrorBudget, ModuleId, OperationId, TimestampMs};

/// Default overall burn rate at or above which `burn_rate_exceeded` fires.
pub const DEFAULT_MAX_BURN_RATE_THRESHOLD: f64 = 0.9;

/// An action a triggered cost-control policy asks the caller to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernorAction {
    /// Throttle (reduce concurrency/rate for) a module
    Throttle(ModuleId),
    /// Pause all non-critical flow execution
    PauseNonCritical,
    /// Emit an alert only, no enforcement
    AlertOnly(String),
}

/// A registered cost-control policy: `trigger` gates `action`.
pub struct CostControlPolicy {
    /// Policy name, for logging and the dispatched action's provenance
    pub name: String,
    trigger: Expr,
    /// Action to dispatch when `trigger` evaluates true
    pub action: GovernorAction,
    /// Higher priority policies are evaluated, and reported, first
    pub priority: i32,
    /// Minimum time between firings of this policy, milliseconds
    pub cooldown_ms: i64,
}

/// Target hourly spend, used to compute `cost_burn`.
#[derive(Debug, Clone, Copy)]
pub struct CostConfig {
    /// Maximum acceptable hourly spend, in the mesh's billing currency
    pub hourly_limit: f64,
    /// Overall burn rate at or above which `burn_rate_exceeded` fires
    pub max_burn_rate_threshold: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 100.0,
            max_burn_rate_threshold: DEFAULT_MAX_BURN_RATE_THRESHOLD,
        }
    }
}

/// Tracks error budgets and evaluates cost-control policies.
pub struct BurnRateGovernor {
    clock: SharedClock,
    bus: SharedBus,
    policies: RwLock<Vec<CostControlPolicy>>,
    budgets: RwLock<HashMap<OperationId, ErrorBudget>>,
    cost_config: CostConfig,
    last_fired: RwLock<HashMap<String, TimestampMs>>,
}

impl BurnRateGovernor {
    /// Create a governor with the given cost configuration.
    pub fn new(clock: SharedClock, bus: SharedBus, cost_config: CostConfig) -> Self {
        Self {
            clock,
            bus,
            policies: RwLock::new(Vec::new()),
            budgets: RwLock::new(HashMap::new()),
            cost_config,
            last_fired: RwLock::new(HashMap::new()),
        }
    }

    /// Register a cost-control policy from a raw trigger expression.
    #[instrument(skip(self))]
    pub async fn register_policy(
        &self,
        name: impl Into<String>,
        trigger_expr: &str,
        action: GovernorAction,
        priority: i32,
        cooldown_ms: i64,
    ) -> Result<()> {
        let trigger = expr::parse(trigger_expr)?;
        let mut policies = self.policies.write().await;
        policies.push(CostControlPolicy {
            name: name.into(),
            trigger,
            action,
            priority,
            cooldown_ms,
        });
        Ok(())
    }

    /// Recompute the error budget for `operation` from its SLO target and
    /// observed error rates.
    #[instrument(skip(self))]
    pub async fn update_error_budget(
        &self,
        operation: impl Into<OperationId>,
        availability_target: f64,
        error_rate: f64,
        recent_error_rate: f64,
    ) -> ErrorBudget {
        let budget = ErrorBudget::compute(availability_target, error_rate, recent_error_rate);
        self.budgets.write().await.insert(operation.into(), budget);
        budget
    }

    /// Current error budget for `operation`, if tracked.
    pub async fn error_budget(&self, operation: &str) -> Option<ErrorBudget> {
        self.budgets.read().await.get(operation).copied()
    }

    /// Compute the combined burn rate from current resource/latency/error/cost
    /// inputs, publishing `burn_rate_calculated` always and
    /// `burn_rate_exceeded` when the overall burn rate crosses the configured
    /// threshold.
    #[instrument(skip(self))]
    pub async fn compute_burn_rate(
        &self,
        cpu: f64,
        mem: f64,
        latency_ratio: f64,
        error_ratio: f64,
        hourly_cost: f64,
    ) -> BurnRateMetrics {
        let cost_burn = if self.cost_config.hourly_limit > 0.0 {
            (hourly_cost / self.cost_config.hourly_limit).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let metrics = BurnRateMetrics::compose(cpu, mem, latency_ratio, error_ratio, cost_burn);

        self.bus
            .publish("burn_rate_calculated", serde_json::json!(metrics))
            .await;

        if metrics.overall >= self.cost_config.max_burn_rate_threshold {
            warn!(overall = metrics.overall, "burn rate exceeded threshold");
            self.bus
                .publish(
                    "burn_rate_exceeded",
                    serde_json::json!({ "overall": metrics.overall, "threshold": self.cost_config.max_burn_rate_threshold }),
                )
                .await;
        }

        metrics
    }

    /// Evaluate all registered policies against a metric context, respecting
    /// per-policy cooldown, returning the actions of triggered policies in
    /// descending priority order and publishing `cost_control_policy_executed`
    /// for each.
    #[instrument(skip(self, context))]
    pub async fn evaluate_policies(&self, context: &HashMap<String, f64>) -> Vec<GovernorAction> {
        let now = self.clock.now_ms();

        let (triggered, updates): (Vec<(String, GovernorAction, i32)>, Vec<(String, TimestampMs)>) = {
            let policies = self.policies.read().await;
            let last_fired = self.last_fired.read().await;

            let mut triggered: Vec<(&CostControlPolicy, bool)> =
                policies.iter().map(|p| (p, p.trigger.eval(context))).collect();
            triggered.retain(|(p, matched)| {
                *matched
                    && last_fired
                        .get(&p.name)
                        .map(|last| now - last >= p.cooldown_ms)
                        .unwrap_or(true)
            });
            triggered.sort_by(|a, b| b.0.priority.cmp(&a.0.priority));

            let extracted: Vec<(String, GovernorAction, i32)> = triggered
                .iter()
                .map(|(p, _)| (p.name.clone(), p.action.clone(), p.priority))
                .collect();
            let updates: Vec<(String, TimestampMs)> =
                extracted.iter().map(|(name, _, _)| (name.clone(), now)).collect();
            (extracted, updates)
        };

        if !updates.is_empty() {
            let mut last_fired = self.last_fired.write().await;
            for (name, at) in updates {
                last_fired.insert(name, at);
            }
        }

        for (name, action, priority) in &triggered {
            warn!(policy = %name, "cost-control policy triggered");
            self.bus
                .publish(
                    "cost_control_policy_executed",
                    serde_json::json!({ "policy": name, "action": format!("{action:?}"), "priority": priority }),
                )
                .await;
        }

        triggered.into_iter().map(|(_, action, _)| action).collect()
    }

    /// Validate that an operation's SLO is still being met; surfaces a
    /// typed error when the budget is already exhausted.
    pub async fn assert_within_budget(&self, operation: &str) -> Result<()> {
        match self.error_budget(operation).await {
            Some(budget) if !budget.slo_compliance() => Err(GovernorError::Governor(format!(
                "operation {operation} has exhausted its error budget (burn_rate={:.2})",
                budget.burn_rate
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    fn governor(clock: SharedClock) -> BurnRateGovernor {
        BurnRateGovernor::new(clock.clone(), Arc::new(EventBus::new(clock)), CostConfig::default())
    }

    #[tokio::test]
    async fn policy_triggers_on_matching_context() {
        let gov = governor(Arc::new(VirtualClock::new(0)));
        gov.register_policy(
            "throttle-on-latency",
            "latency_p99 > 2000",
            GovernorAction::Throttle("qflow".to_string()),
            10,
            0,
        )
        .await
        .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("latency_p99".to_string(), 3000.0);

        let actions = gov.evaluate_policies(&ctx).await;
        assert_eq!(actions, vec![GovernorAction::Throttle("qflow".to_string())]);
    }

    #[tokio::test]
    async fn policies_ordered_by_priority() {
        let gov = governor(Arc::new(VirtualClock::new(0)));
        gov.register_policy("low", "cpu_utilization > 0.5", GovernorAction::AlertOnly("low".into()), 1, 0)
            .await
            .unwrap();
        gov.register_policy(
            "high",
            "cpu_utilization > 0.5",
            GovernorAction::PauseNonCritical,
            100,
            0,
        )
        .await
        .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("cpu_utilization".to_string(), 0.9);

        let actions = gov.evaluate_policies(&ctx).await;
        assert_eq!(actions[0], GovernorAction::PauseNonCritical);
    }

    #[tokio::test]
    async fn policy_respects_cooldown() {
        let clock = Arc::new(VirtualClock::new(0));
        let gov = governor(clock.clone());
        gov.register_policy(
            "throttle-on-latency",
            "latency_p99 > 2000",
            GovernorAction::Throttle("qflow".to_string()),
            10,
            60_000,
        )
        .await
        .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("latency_p99".to_string(), 3000.0);

        assert_eq!(gov.evaluate_policies(&ctx).await.len(), 1);
        assert_eq!(gov.evaluate_policies(&ctx).await.len(), 0);

        clock.advance(60_001);
        assert_eq!(gov.evaluate_policies(&ctx).await.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_fails_assertion() {
        let gov = governor(Arc::new(VirtualClock::new(0)));
        gov.update_error_budget("checkout", 0.999, 0.01, 0.01).await;
        assert!(gov.assert_within_budget("checkout").await.is_err());
    }

    #[tokio::test]
    async fn healthy_budget_passes_assertion() {
        let gov = governor(Arc::new(VirtualClock::new(0)));
        gov.update_error_budget("checkout", 0.9, 0.001, 0.001).await;
        assert!(gov.assert_within_budget("checkout").await.is_ok());
    }

    #[tokio::test]
    async fn burn_rate_exceeded_event_fires_above_threshold() {
        let clock = Arc::new(VirtualClock::new(0));
        let bus = Arc::new(EventBus::new(clock.clone()));
        let gov = BurnRateGovernor::new(clock, bus.clone(), CostConfig::default());
        gov.compute_burn_rate(0.99, 0.99, 2.0, 2.0, 100.0).await;
        let events = bus
            .history(crate::bus::HistoryFilter::topic("burn_rate_exceeded"))
            .await;
        assert_eq!(events.len(), 1);
    }
}
