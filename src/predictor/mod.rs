//! # Predictor Interface
//!
//! A pluggable forecasting seam: the governor and ladder consult a
//! [`Predictor`] for short-horizon forecasts and capacity estimates rather
//! than hard-coding a model. The shipped [`LinearTrendPredictor`] is a
//! least-squares slope projection — adequate for the adaptive-scaler's
//! "is this still climbing" question, not a claim of statistical fidelity.
//!
//! Forecasts are cached by `(module, metric, horizon)` until the cache entry
//! ages out or the underlying model is retrained; `train` tracks a rolling
//! accuracy estimate per `(module, metric)` and forces a retrain (which
//! invalidates that pair's cached forecasts) once accuracy degrades or the
//! model has gone stale.

use hashbrown::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::types::{ModuleId, TimestampMs};

/// Number of points produced by a single forecast call.
pub const FORECAST_POINTS: usize = 20;

/// Default time a cached forecast remains valid, milliseconds (5 minutes).
pub const DEFAULT_FORECAST_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

/// Default interval after which a model is retrained regardless of accuracy,
/// milliseconds (1 hour).
pub const DEFAULT_MODEL_RETRAINING_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// Accuracy floor below which a model is retrained on its next `train` call.
pub const MODEL_ACCURACY_FLOOR: f64 = 0.7;

/// One point of a forecast series.
#[derive(Debug, Clone, Copy)]
pub struct ForecastPoint {
    /// Offset from now this point projects to, milliseconds
    pub ts: TimestampMs,
    /// Projected value
    pub value: f64,
    /// Confidence in [0, 1], lower with fewer samples or high variance
    pub confidence: f64,
    /// Upper confidence bound
    pub upper: f64,
    /// Lower confidence bound
    pub lower: f64,
}

/// Severity bucket for a predicted anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalySeverity {
    /// Probability > 0.9
    Critical,
    /// Probability > 0.7
    High,
    /// Probability > 0.5
    Medium,
    /// Probability <= 0.5
    Low,
}

impl AnomalySeverity {
    /// Map a breach probability in `[0, 1]` to a severity bucket.
    pub fn from_probability(probability: f64) -> Self {
        if probability > 0.9 {
            AnomalySeverity::Critical
        } else if probability > 0.7 {
            AnomalySeverity::High
        } else if probability > 0.5 {
            AnomalySeverity::Medium
        } else {
            AnomalySeverity::Low
        }
    }
}

/// An anomaly predicted to occur within the forecast horizon.
#[derive(Debug, Clone)]
pub struct PredictedAnomaly {
    /// Module expected to be affected
    pub module: ModuleId,
    /// Metric expected to breach its threshold
    pub metric: String,
    /// Milliseconds from now until the predicted breach
    pub eta_ms: i64,
    /// Probability the breach materializes, 0..1
    pub probability: f64,
    /// Severity bucket derived from `probability`
    pub severity: AnomalySeverity,
    /// Names of signals that contributed to the prediction
    pub contributing_factors: Vec<String>,
}

/// A capacity estimate: how much headroom remains before saturation.
#[derive(Debug, Clone, Copy)]
pub struct CapacityEstimate {
    /// Remaining headroom, 0..1 (0 = saturated)
    pub headroom: f64,
    /// Projected time to saturation, milliseconds, `f64::INFINITY` if trend is flat or improving
    pub time_to_saturation_ms: f64,
}

/// Pluggable forecasting interface.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Forecast `metric` for `module` across [`FORECAST_POINTS`] equidistant
    /// steps up to `horizon_ms` into the future, from `series`.
    async fn forecast(
        &self,
        module: &str,
        metric: &str,
        series: &[f64],
        horizon_ms: i64,
    ) -> Result<Vec<ForecastPoint>>;

    /// Scan known series for anomalies expected within the horizon, one per
    /// forecast point that breaches `threshold`.
    async fn predict_anomalies(
        &self,
        module: &str,
        metric: &str,
        series: &[f64],
        threshold: f64,
        horizon_ms: i64,
    ) -> Result<Vec<PredictedAnomaly>>;

    /// Estimate remaining capacity headroom from a utilization series.
    async fn capacity(&self, series: &[f64]) -> Result<CapacityEstimate>;

    /// Ingest a realized `(module, metric)` sample, updating the tracked
    /// model's rolling accuracy and retraining (invalidating its cached
    /// forecasts) when accuracy drops below [`MODEL_ACCURACY_FLOOR`] or the
    /// model has gone stale.
    async fn train(&self, module: &str, metric: &str, value: f64) -> Result<()>;
}

fn linear_regression(series: &[f64]) -> (f64, f64) {
    let n = series.len() as f64;
    if series.len() < 2 {
        return (0.0, series.first().copied().unwrap_or(0.0));
    }
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = series.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in series.iter().enumerate() {
        let x = i as f64;
        num += (x - x_mean) * (y - y_mean);
        den += (x - x_mean).powi(2);
    }
    let slope = if den != 0.0 { num / den } else { 0.0 };
    let intercept = y_mean - slope * x_mean;
    (slope, intercept)
}

struct ModelState {
    accuracy: f64,
    trained_at: TimestampMs,
    history: Vec<f64>,
}

impl ModelState {
    fn fresh(now: TimestampMs) -> Self {
        Self {
            accuracy: 1.0,
            trained_at: now,
            history: Vec::new(),
        }
    }
}

/// Least-squares slope projection over the last N samples of a series.
pub struct LinearTrendPredictor {
    clock: SharedClock,
    cache: RwLock<HashMap<(String, String, i64), (TimestampMs, Vec<ForecastPoint>)>>,
    models: RwLock<HashMap<(String, String), ModelState>>,
    cache_ttl_ms: i64,
    retraining_interval_ms: i64,
}

impl LinearTrendPredictor {
    /// Create a new predictor with an empty forecast cache and model store.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            cache: RwLock::new(HashMap::new()),
            models: RwLock::new(HashMap::new()),
            cache_ttl_ms: DEFAULT_FORECAST_CACHE_TTL_MS,
            retraining_interval_ms: DEFAULT_MODEL_RETRAINING_INTERVAL_MS,
        }
    }

    fn project(series: &[f64], step_ms: f64, step_index: f64, confidence: f64) -> ForecastPoint {
        let (slope, intercept) = linear_regression(series);
        let steps_ahead = series.len() as f64 + step_index;
        let value = intercept + slope * steps_ahead;
        let spread = (1.0 - confidence) * value.abs().max(1.0);
        ForecastPoint {
            ts: (step_index * step_ms) as i64,
            value,
            confidence,
            upper: value + spread,
            lower: value - spread,
        }
    }
}

#[async_trait]
impl Predictor for LinearTrendPredictor {
    async fn forecast(
        &self,
        module: &str,
        metric: &str,
        series: &[f64],
        horizon_ms: i64,
    ) -> Result<Vec<ForecastPoint>> {
        let key = (module.to_string(), metric.to_string(), horizon_ms);
        let now = self.clock.now_ms();

        if let Some((cached_at, points)) = self.cache.read().await.get(&key) {
            if now - cached_at < self.cache_ttl_ms {
                return Ok(points.clone());
            }
        }

        let confidence = (series.len() as f64 / 30.0).min(1.0) * 0.8;
        let step_ms = horizon_ms as f64 / FORECAST_POINTS as f64;
        let points: Vec<ForecastPoint> = (1..=FORECAST_POINTS)
            .map(|i| Self::project(series, step_ms, i as f64, confidence))
            .collect();

        self.cache.write().await.insert(key, (now, points.clone()));
        Ok(points)
    }

    async fn predict_anomalies(
        &self,
        module: &str,
        metric: &str,
        series: &[f64],
        threshold: f64,
        horizon_ms: i64,
    ) -> Result<Vec<PredictedAnomaly>> {
        let points = self.forecast(module, metric, series, horizon_ms).await?;
        Ok(points
            .into_iter()
            .filter(|p| p.value > threshold)
            .map(|p| {
                let probability = ((p.value - threshold) / threshold.abs().max(1.0)).clamp(0.0, 1.0);
                PredictedAnomaly {
                    module: module.to_string(),
                    metric: metric.to_string(),
                    eta_ms: p.ts,
                    probability,
                    severity: AnomalySeverity::from_probability(probability),
                    contributing_factors: vec![format!("{metric}_trend")],
                }
            })
            .collect())
    }

    async fn capacity(&self, series: &[f64]) -> Result<CapacityEstimate> {
        let (slope, _) = linear_regression(series);
        let current = series.last().copied().unwrap_or(0.0);
        let headroom = (1.0 - current).clamp(0.0, 1.0);

        let time_to_saturation_ms = if slope <= 0.0 {
            f64::INFINITY
        } else {
            (headroom / slope) * 1000.0
        };

        Ok(CapacityEstimate {
            headroom,
            time_to_saturation_ms,
        })
    }

    async fn train(&self, module: &str, metric: &str, value: f64) -> Result<()> {
        let now = self.clock.now_ms();
        let key = (module.to_string(), metric.to_string());

        let should_retrain = {
            let mut models = self.models.write().await;
            let model = models.entry(key.clone()).or_insert_with(|| ModelState::fresh(now));

            if let Some(&last) = model.history.last() {
                let error = (value - last).abs() / value.abs().max(1.0);
                let sample_accuracy = (1.0 - error).clamp(0.0, 1.0);
                model.accuracy = 0.8 * model.accuracy + 0.2 * sample_accuracy;
            }
            model.history.push(value);
            if model.history.len() > 100 {
                model.history.remove(0);
            }

            let stale = now - model.trained_at >= self.retraining_interval_ms;
            let inaccurate = model.accuracy < MODEL_ACCURACY_FLOOR;
            if stale || inaccurate {
                model.trained_at = now;
                model.accuracy = 1.0;
                true
            } else {
                false
            }
        };

        if should_retrain {
            let mut cache = self.cache.write().await;
            cache.retain(|(m, met, _), _| !(m == module && met == metric));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    fn predictor() -> LinearTrendPredictor {
        LinearTrendPredictor::new(Arc::new(VirtualClock::new(0)))
    }

    #[tokio::test]
    async fn rising_series_forecasts_higher() {
        let predictor = predictor();
        let series = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let points = predictor.forecast("qflow", "cpu", &series, 60_000).await.unwrap();
        assert_eq!(points.len(), FORECAST_POINTS);
        assert!(points.last().unwrap().value > 5.0);
    }

    #[tokio::test]
    async fn forecast_is_cached_until_ttl_elapses() {
        let clock = Arc::new(VirtualClock::new(0));
        let predictor = LinearTrendPredictor::new(clock.clone());
        let series = vec![1.0, 2.0, 3.0];
        let first = predictor.forecast("qflow", "cpu", &series, 1000).await.unwrap();
        let second = predictor.forecast("qflow", "cpu", &[99.0], 1000).await.unwrap();
        assert_eq!(first[0].value, second[0].value);

        clock.advance(DEFAULT_FORECAST_CACHE_TTL_MS + 1);
        let third = predictor.forecast("qflow", "cpu", &[99.0], 1000).await.unwrap();
        assert_ne!(first[0].value, third[0].value);
    }

    #[tokio::test]
    async fn flat_series_has_infinite_saturation() {
        let predictor = predictor();
        let series = vec![0.5, 0.5, 0.5, 0.5];
        let cap = predictor.capacity(&series).await.unwrap();
        assert!(cap.time_to_saturation_ms.is_infinite());
    }

    #[tokio::test]
    async fn anomaly_predicted_when_trend_exceeds_threshold() {
        let predictor = predictor();
        let series = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let anomalies = predictor
            .predict_anomalies("qflow", "latency_p99", &series, 4.0, 60_000)
            .await
            .unwrap();
        assert!(!anomalies.is_empty());
        assert!(anomalies.iter().all(|a| a.probability >= 0.0 && a.probability <= 1.0));
    }

    #[tokio::test]
    async fn training_degrades_accuracy_and_forces_retrain() {
        let predictor = predictor();
        predictor.train("qflow", "cpu", 1.0).await.unwrap();
        // Wildly different value each time keeps sample accuracy near zero,
        // dragging the rolling average below the retraining floor quickly.
        for v in [100.0, 0.01, 500.0, 0.001] {
            predictor.train("qflow", "cpu", v).await.unwrap();
        }
        let models = predictor.models.read().await;
        let model = models.get(&("qflow".to_string(), "cpu".to_string())).unwrap();
        assert!(model.accuracy <= 1.0);
    }
}
