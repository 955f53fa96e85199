//! # Degradation Ladder
//!
//! A five-level hysteretic state machine (see [`DegradationLevel`]) that
//! escalates under sustained pressure and de-escalates only after recovery
//! has held for a cooldown period — this asymmetry prevents flapping under
//! noisy metrics. Two consecutive automatic escalations are always
//! separated by at least `escalation_cooldown_ms`. A manual override can pin
//! the level regardless of triggers, and either auto-expires after
//! `manual_override_timeout_ms` or is explicitly cleared.

use hashbrown::HashMap;

use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::expr::{self, Expr};
use crate::types::{DegradationLevel, DeferredStep, FlowId, PausedFlow, StepId, TimestampMs};

/// Minimum time a level must hold before de-escalating, milliseconds.
pub const DEFAULT_COOLDOWN_MS: i64 = 30_000;

/// Minimum time between two automatic escalations, milliseconds.
pub const DEFAULT_ESCALATION_COOLDOWN_MS: i64 = 120_000;

/// How long a manual override holds before auto-expiring, milliseconds.
pub const DEFAULT_MANUAL_OVERRIDE_TIMEOUT_MS: i64 = 30 * 60 * 1000;

/// A declarative trigger mapped to the level it escalates to when it holds.
struct LadderTrigger {
    level: DegradationLevel,
    condition: Expr,
}

struct LadderState {
    level: DegradationLevel,
    last_change_at: TimestampMs,
    last_escalation_at: TimestampMs,
    manual_override: Option<DegradationLevel>,
    override_expires_at: Option<TimestampMs>,
    paused_flows: HashMap<FlowId, PausedFlow>,
    deferred_steps: HashMap<StepId, DeferredStep>,
}

/// The degradation ladder controller.
pub struct DegradationLadder {
    clock: SharedClock,
    bus: SharedBus,
    triggers: RwLock<Vec<LadderTrigger>>,
    state: RwLock<LadderState>,
    cooldown_ms: i64,
    escalation_cooldown_ms: i64,
    manual_override_timeout_ms: i64,
}

impl DegradationLadder {
    /// Create a ladder starting at [`DegradationLevel::Normal`], using every
    /// default cooldown.
    pub fn new(clock: SharedClock, bus: SharedBus) -> Self {
        Self::with_cooldown(clock, bus, DEFAULT_COOLDOWN_MS)
    }

    /// Create a ladder with an explicit de-escalation cooldown, defaulting
    /// the escalation cooldown and manual override timeout.
    pub fn with_cooldown(clock: SharedClock, bus: SharedBus, cooldown_ms: i64) -> Self {
        Self::with_config(
            clock,
            bus,
            cooldown_ms,
            DEFAULT_ESCALATION_COOLDOWN_MS,
            DEFAULT_MANUAL_OVERRIDE_TIMEOUT_MS,
        )
    }

    /// Create a ladder with every cooldown configured explicitly.
    pub fn with_config(
        clock: SharedClock,
        bus: SharedBus,
        cooldown_ms: i64,
        escalation_cooldown_ms: i64,
        manual_override_timeout_ms: i64,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            bus,
            triggers: RwLock::new(Vec::new()),
            state: RwLock::new(LadderState {
                level: DegradationLevel::Normal,
                last_change_at: now,
                last_escalation_at: now.saturating_sub(escalation_cooldown_ms),
                manual_override: None,
                override_expires_at: None,
                paused_flows: HashMap::new(),
                deferred_steps: HashMap::new(),
            }),
            cooldown_ms,
            escalation_cooldown_ms,
            manual_override_timeout_ms,
        }
    }

    /// Register a declarative trigger: when `condition` holds, the ladder
    /// escalates to at least `level`.
    pub async fn register_trigger(&self, level: DegradationLevel, condition_expr: &str) -> crate::error::Result<()> {
        let condition = expr::parse(condition_expr)?;
        self.triggers.write().await.push(LadderTrigger { level, condition });
        Ok(())
    }

    /// Pin the ladder at `level` regardless of trigger evaluation, until
    /// cleared or `manual_override_timeout_ms` elapses.
    #[instrument(skip(self))]
    pub async fn set_manual_override(&self, level: DegradationLevel) {
        let now = self.clock.now_ms();
        let mut state = self.state.write().await;
        state.manual_override = Some(level);
        state.override_expires_at = Some(now + self.manual_override_timeout_ms);
        state.level = level;
        state.last_change_at = now;
        info!(?level, "manual override engaged");
    }

    /// Clear a manual override, resuming automatic trigger evaluation.
    pub async fn clear_manual_override(&self) {
        let mut state = self.state.write().await;
        state.manual_override = None;
        state.override_expires_at = None;
    }

    /// Evaluate triggers against `context` and update the ladder level.
    ///
    /// Escalation requires both a matching trigger and at least
    /// `escalation_cooldown_ms` since the last automatic escalation.
    /// De-escalation requires the current level's triggers to have stopped
    /// matching for at least `cooldown_ms` since the last change. A manual
    /// override that has outlived `manual_override_timeout_ms` is cleared
    /// first, publishing `manual_override_expired`.
    #[instrument(skip(self, context))]
    pub async fn tick(&self, context: &HashMap<String, f64>) -> DegradationLevel {
        let now = self.clock.now_ms();
        let mut events: Vec<(&'static str, serde_json::Value)> = Vec::new();

        let result = {
            let mut state = self.state.write().await;

            if let Some(expires_at) = state.override_expires_at {
                if now >= expires_at {
                    let expired_level = state.manual_override;
                    state.manual_override = None;
                    state.override_expires_at = None;
                    events.push((
                        "manual_override_expired",
                        serde_json::json!({ "level": expired_level.map(|l| l.canonical_name()) }),
                    ));
                }
            }

            if state.manual_override.is_some() {
                state.level
            } else {
                let triggers = self.triggers.read().await;
                let highest_matched = triggers
                    .iter()
                    .filter(|t| t.condition.eval(context))
                    .map(|t| t.level)
                    .max();
                drop(triggers);

                match highest_matched {
                    Some(target)
                        if target > state.level && now - state.last_escalation_at >= self.escalation_cooldown_ms =>
                    {
                        let from = state.level;
                        state.level = target;
                        state.last_change_at = now;
                        state.last_escalation_at = now;
                        info!(?target, "ladder escalated");
                        events.push((
                            "degradation_escalated",
                            serde_json::json!({ "from": from.canonical_name(), "to": target.canonical_name() }),
                        ));
                    }
                    Some(target) if target == state.level => {
                        // Holding steady resets the cooldown clock for de-escalation.
                        state.last_change_at = now;
                    }
                    _ => {
                        let held_long_enough = now - state.last_change_at >= self.cooldown_ms;
                        if state.level != DegradationLevel::Normal && held_long_enough {
                            let from = state.level;
                            let new_level = state.level.de_escalate();
                            state.level = new_level;
                            state.last_change_at = now;
                            info!(?new_level, "ladder de-escalated after cooldown");
                            events.push((
                                "degradation_deescalated",
                                serde_json::json!({ "from": from.canonical_name(), "to": new_level.canonical_name() }),
                            ));
                        }
                    }
                }

                state.level
            }
        };

        for (topic, payload) in events {
            self.bus.publish(topic, payload).await;
        }

        result
    }

    /// Current degradation level.
    pub async fn level(&self) -> DegradationLevel {
        self.state.read().await.level
    }

    /// Record a paused flow at the current level, publishing
    /// `degradation_actions_executed`.
    #[instrument(skip(self))]
    pub async fn pause_flow(&self, id: FlowId, reason: impl Into<String>) {
        let now = self.clock.now_ms();
        let reason = reason.into();
        {
            let mut state = self.state.write().await;
            state.paused_flows.insert(
                id,
                PausedFlow {
                    id,
                    reason: reason.clone(),
                    paused_at: now,
                    resume_at: None,
                },
            );
        }
        self.bus
            .publish(
                "degradation_actions_executed",
                serde_json::json!({ "action": "pause_flow", "flow_id": id, "reason": reason }),
            )
            .await;
    }

    /// Resume a previously paused flow.
    pub async fn resume_flow(&self, id: &FlowId) -> Option<PausedFlow> {
        self.state.write().await.paused_flows.remove(id)
    }

    /// Record a deferred step, routed to a cold node, publishing
    /// `degradation_actions_executed`.
    #[instrument(skip(self))]
    pub async fn defer_step(&self, id: StepId, reason: impl Into<String>, target_node: impl Into<String>) {
        let now = self.clock.now_ms();
        let reason = reason.into();
        let target_node = target_node.into();
        {
            let mut state = self.state.write().await;
            state.deferred_steps.insert(
                id,
                DeferredStep {
                    id,
                    reason: reason.clone(),
                    deferred_at: now,
                    target_node: target_node.clone(),
                },
            );
        }
        self.bus
            .publish(
                "degradation_actions_executed",
                serde_json::json!({ "action": "defer_step", "step_id": id, "reason": reason, "target_node": target_node }),
            )
            .await;
    }

    /// Currently paused flows.
    pub async fn paused_flows(&self) -> Vec<PausedFlow> {
        self.state.read().await.paused_flows.values().cloned().collect()
    }

    /// Currently deferred steps.
    pub async fn deferred_steps(&self) -> Vec<DeferredStep> {
        self.state.read().await.deferred_steps.values().cloned().collect()
    }
}
