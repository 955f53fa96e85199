//! # Adaptive Scaler & Redirector
//!
//! Evaluates declarative scaling policies and traffic-redirection rules
//! against the current metric context, respecting a per-module cooldown so
//! the scaler doesn't thrash. Also exposes an emergency path that sheds load
//! immediately, bypassing cooldowns, when the degradation ladder reaches
//! [`crate::types::DegradationLevel::Emergency`]. Node counts per module are
//! tracked internally so `target = min(ceil(current*1.5), max)` and
//! `target = max(floor(current*0.8), min)` can be computed without the
//! caller supplying its own topology view.

use hashbrown::HashMap;

use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::expr::{self, Expr};
use crate::types::{LatencyTriple, ModuleId, NodeId, TimestampMs};

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDirection {
    /// Add capacity
    Up,
    /// Remove capacity
    Down,
}

/// A concrete scaling decision for one module.
#[derive(Debug, Clone)]
pub struct ScalingAction {
    /// Module to scale
    pub module: ModuleId,
    /// Direction
    pub direction: ScalingDirection,
    /// Node count to converge to
    pub target_nodes: u32,
    /// Name of the policy that triggered this
    pub reason: String,
}

/// A concrete redirection decision, moving traffic off a hot node.
#[derive(Debug, Clone)]
pub struct RedirectionAction {
    /// Node traffic is moved away from
    pub from_node: NodeId,
    /// Node traffic is moved to
    pub to_node: NodeId,
    /// Name of the rule that triggered this
    pub reason: String,
}

struct ScalingPolicy {
    name: String,
    module: ModuleId,
    condition: Expr,
    direction: ScalingDirection,
    min_nodes: u32,
    max_nodes: u32,
    priority: i32,
}

struct RedirectionRule {
    name: String,
    condition: Expr,
    from_node: NodeId,
    to_node: NodeId,
    priority: i32,
}

/// Before/after latency impact of a scaling action, for feedback.
#[derive(Debug, Clone, Copy)]
pub struct ScalingImpact {
    /// p99 latency before the action took effect
    pub before_p99: f64,
    /// p99 latency after the action took effect
    pub after_p99: f64,
}

impl ScalingImpact {
    /// Relative latency improvement, positive means it got better.
    pub fn improvement_ratio(&self) -> f64 {
        if self.before_p99 == 0.0 {
            0.0
        } else {
            (self.before_p99 - self.after_p99) / self.before_p99
        }
    }

    /// Derive the impact from two latency snapshots.
    pub fn from_latencies(before: &LatencyTriple, after: &LatencyTriple) -> Self {
        Self {
            before_p99: before.p99,
            after_p99: after.p99,
        }
    }
}

/// Default cooldown between scaling actions for the same module, milliseconds.
pub const DEFAULT_SCALING_COOLDOWN_MS: i64 = 60_000;

/// Assumed node count for a module that has never been recorded.
const DEFAULT_NODE_COUNT: u32 = 1;

/// Evaluates scaling and redirection policies against live metric context.
pub struct AdaptiveScaler {
    clock: SharedClock,
    bus: SharedBus,
    scaling_policies: RwLock<Vec<ScalingPolicy>>,
    redirection_rules: RwLock<Vec<RedirectionRule>>,
    last_scaled: RwLock<HashMap<ModuleId, TimestampMs>>,
    node_counts: RwLock<HashMap<ModuleId, u32>>,
    cooldown_ms: i64,
}

impl AdaptiveScaler {
    /// Create a scaler with the default cooldown.
    pub fn new(clock: SharedClock, bus: SharedBus) -> Self {
        Self::with_cooldown(clock, bus, DEFAULT_SCALING_COOLDOWN_MS)
    }

    /// Create a scaler with an explicit cooldown.
    pub fn with_cooldown(clock: SharedClock, bus: SharedBus, cooldown_ms: i64) -> Self {
        Self {
            clock,
            bus,
            scaling_policies: RwLock::new(Vec::new()),
            redirection_rules: RwLock::new(Vec::new()),
            last_scaled: RwLock::new(HashMap::new()),
            node_counts: RwLock::new(HashMap::new()),
            cooldown_ms,
        }
    }

    /// Record the current node count for `module`, used as the scaling base.
    pub async fn set_node_count(&self, module: impl Into<ModuleId>, count: u32) {
        self.node_counts.write().await.insert(module.into(), count);
    }

    /// Current tracked node count for `module`, defaulting to 1 if untracked.
    pub async fn node_count(&self, module: &str) -> u32 {
        self.node_counts.read().await.get(module).copied().unwrap_or(DEFAULT_NODE_COUNT)
    }

    /// Register a scaling policy for `module`, with its min/max node bounds.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_scaling_policy(
        &self,
        name: impl Into<String>,
        module: impl Into<ModuleId>,
        condition_expr: &str,
        direction: ScalingDirection,
        min_nodes: u32,
        max_nodes: u32,
        priority: i32,
    ) -> crate::error::Result<()> {
        let condition = expr::parse(condition_expr)?;
        self.scaling_policies.write().await.push(ScalingPolicy {
            name: name.into(),
            module: module.into(),
            condition,
            direction,
            min_nodes,
            max_nodes,
            priority,
        });
        Ok(())
    }

    /// Register a redirection rule.
    pub async fn register_redirection_rule(
        &self,
        name: impl Into<String>,
        condition_expr: &str,
        from_node: impl Into<NodeId>,
        to_node: impl Into<NodeId>,
        priority: i32,
    ) -> crate::error::Result<()> {
        let condition = expr::parse(condition_expr)?;
        self.redirection_rules.write().await.push(RedirectionRule {
            name: name.into(),
            condition,
            from_node: from_node.into(),
            to_node: to_node.into(),
            priority,
        });
        Ok(())
    }

    /// Evaluate scaling policies for `module` against `context`, respecting
    /// the per-module cooldown. The first (highest-priority) matching policy
    /// computes `target = min(ceil(current*1.5), max)` when scaling up or
    /// `target = max(floor(current*0.8), min)` when scaling down; `None` is
    /// returned if that target does not actually move the node count.
    #[instrument(skip(self, context))]
    pub async fn evaluate_scaling(&self, module: &str, context: &HashMap<String, f64>) -> Option<ScalingAction> {
        let now = self.clock.now_ms();
        {
            let last_scaled = self.last_scaled.read().await;
            if let Some(&last) = last_scaled.get(module) {
                if now - last < self.cooldown_ms {
                    return None;
                }
            }
        }

        let (direction, target_nodes, reason) = {
            let policies = self.scaling_policies.read().await;
            let mut matched: Vec<&ScalingPolicy> = policies
                .iter()
                .filter(|p| p.module == module && p.condition.eval(context))
                .collect();
            matched.sort_by(|a, b| b.priority.cmp(&a.priority));
            let policy = matched.first()?;

            let current = self.node_count(module).await;
            let target = match policy.direction {
                ScalingDirection::Up => (((current as f64) * 1.5).ceil() as u32).min(policy.max_nodes),
                ScalingDirection::Down => (((current as f64) * 0.8).floor() as u32).max(policy.min_nodes),
            };

            let moves = match policy.direction {
                ScalingDirection::Up => target > current,
                ScalingDirection::Down => target < current,
            };
            if !moves {
                return None;
            }

            (policy.direction, target, policy.name.clone())
        };

        self.node_counts.write().await.insert(module.to_string(), target_nodes);
        self.last_scaled.write().await.insert(module.to_string(), now);

        let action = ScalingAction {
            module: module.to_string(),
            direction,
            target_nodes,
            reason,
        };
        info!(module, ?action.direction, action.target_nodes, "scaling action decided");

        let topic = match direction {
            ScalingDirection::Up => "scale_up_initiated",
            ScalingDirection::Down => "scale_down_initiated",
        };
        self.bus
            .publish(
                topic,
                serde_json::json!({ "module": module, "target_nodes": target_nodes, "reason": action.reason }),
            )
            .await;

        Some(action)
    }

    /// Bypass cooldown and force a scale-down of `module` for emergency
    /// shedding, publishing `emergency_response_initiated`.
    #[instrument(skip(self))]
    pub async fn emergency_shed(&self, module: &str, amount: u32) -> ScalingAction {
        let now = self.clock.now_ms();
        let current = self.node_count(module).await;
        let target_nodes = current.saturating_sub(amount);
        self.node_counts.write().await.insert(module.to_string(), target_nodes);
        self.last_scaled.write().await.insert(module.to_string(), now);
        info!(module, target_nodes, "emergency shed bypassing cooldown");

        self.bus
            .publish(
                "emergency_response_initiated",
                serde_json::json!({ "module": module, "target_nodes": target_nodes }),
            )
            .await;

        ScalingAction {
            module: module.to_string(),
            direction: ScalingDirection::Down,
            target_nodes,
            reason: "emergency degradation level".to_string(),
        }
    }

    /// Evaluate redirection rules against `context`; the first (highest
    /// priority) match wins and evaluation stops there, publishing
    /// `load_redirection_initiated`.
    #[instrument(skip(self, context))]
    pub async fn evaluate_redirection(&self, context: &HashMap<String, f64>) -> Option<RedirectionAction> {
        let action = {
            let rules = self.redirection_rules.read().await;
            let mut matched: Vec<&RedirectionRule> = rules.iter().filter(|r| r.condition.eval(context)).collect();
            matched.sort_by(|a, b| b.priority.cmp(&a.priority));
            matched.first().map(|r| RedirectionAction {
                from_node: r.from_node.clone(),
                to_node: r.to_node.clone(),
                reason: r.name.clone(),
            })
        };

        if let Some(action) = &action {
            self.bus
                .publish(
                    "load_redirection_initiated",
                    serde_json::json!({ "from_node": action.from_node, "to_node": action.to_node, "reason": action.reason }),
                )
                .await;
        }

        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    fn scaler(clock: SharedClock, cooldown_ms: i64) -> AdaptiveScaler {
        AdaptiveScaler::with_cooldown(clock.clone(), Arc::new(EventBus::new(clock)), cooldown_ms)
    }

    #[tokio::test]
    async fn scales_up_when_policy_matches() {
        let s = scaler(Arc::new(VirtualClock::new(0)), DEFAULT_SCALING_COOLDOWN_MS);
        s.set_node_count("qflow", 2).await;
        s.register_scaling_policy("up", "qflow", "cpu_utilization > 0.8", ScalingDirection::Up, 1, 10, 10)
            .await
            .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("cpu_utilization".to_string(), 0.9);

        let action = s.evaluate_scaling("qflow", &ctx).await.unwrap();
        assert_eq!(action.direction, ScalingDirection::Up);
        assert_eq!(action.target_nodes, 3); // ceil(2*1.5) = 3
    }

    #[tokio::test]
    async fn scale_up_never_exceeds_max_nodes() {
        let s = scaler(Arc::new(VirtualClock::new(0)), DEFAULT_SCALING_COOLDOWN_MS);
        s.set_node_count("qflow", 8).await;
        s.register_scaling_policy("up", "qflow", "cpu_utilization > 0.8", ScalingDirection::Up, 1, 10, 10)
            .await
            .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("cpu_utilization".to_string(), 0.9);

        let action = s.evaluate_scaling("qflow", &ctx).await.unwrap();
        assert_eq!(action.target_nodes, 10); // ceil(8*1.5)=12, capped at max 10
    }

    #[tokio::test]
    async fn scale_down_never_drops_below_min_nodes() {
        let s = scaler(Arc::new(VirtualClock::new(0)), DEFAULT_SCALING_COOLDOWN_MS);
        s.set_node_count("qflow", 2).await;
        s.register_scaling_policy("down", "qflow", "cpu_utilization < 0.2", ScalingDirection::Down, 2, 10, 10)
            .await
            .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("cpu_utilization".to_string(), 0.1);

        let action = s.evaluate_scaling("qflow", &ctx).await.unwrap();
        assert_eq!(action.target_nodes, 2); // floor(2*0.8)=1, floored up to min 2
    }

    #[tokio::test]
    async fn respects_cooldown() {
        let clock = Arc::new(VirtualClock::new(0));
        let s = scaler(clock.clone(), 10_000);
        s.register_scaling_policy("up", "qflow", "cpu_utilization > 0.8", ScalingDirection::Up, 1, 10, 10)
            .await
            .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("cpu_utilization".to_string(), 0.9);

        assert!(s.evaluate_scaling("qflow", &ctx).await.is_some());
        assert!(s.evaluate_scaling("qflow", &ctx).await.is_none());

        clock.advance(10_001);
        assert!(s.evaluate_scaling("qflow", &ctx).await.is_some());
    }

    #[tokio::test]
    async fn emergency_shed_bypasses_cooldown() {
        let clock = Arc::new(VirtualClock::new(0));
        let s = scaler(clock.clone(), 60_000);
        s.set_node_count("qflow", 10).await;
        s.register_scaling_policy("up", "qflow", "cpu_utilization > 0.8", ScalingDirection::Up, 1, 20, 10)
            .await
            .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("cpu_utilization".to_string(), 0.9);
        s.evaluate_scaling("qflow", &ctx).await;

        let action = s.emergency_shed("qflow", 5).await;
        assert_eq!(action.direction, ScalingDirection::Down);
        assert_eq!(action.target_nodes, 10); // 15 (post scale-up) - 5
    }

    #[tokio::test]
    async fn redirection_stops_at_first_match() {
        let s = scaler(Arc::new(VirtualClock::new(0)), DEFAULT_SCALING_COOLDOWN_MS);
        s.register_redirection_rule("low", "latency_p99 > 1000", "node-a", "node-b", 1)
            .await
            .unwrap();
        s.register_redirection_rule("high", "latency_p99 > 1000", "node-a", "node-c", 100)
            .await
            .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("latency_p99".to_string(), 2000.0);

        let action = s.evaluate_redirection(&ctx).await.unwrap();
        assert_eq!(action.to_node, "node-c");
    }

    #[test]
    fn impact_improvement_ratio() {
        let impact = ScalingImpact {
            before_p99: 1000.0,
            after_p99: 500.0,
        };
        assert!((impact.improvement_ratio() - 0.5).abs() < 1e-9);
    }
}
