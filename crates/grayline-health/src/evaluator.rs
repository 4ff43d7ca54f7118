//! Health evaluator — turns metric queries into classifications.
//!
//! RED signals are compared against the application's thresholds through
//! one table of `(kind, direction)` pairs. Unbound alert rules are evaluated
//! as firing expressions: any matching series whose latest value is above
//! zero counts as a breach.
//!
//! A failed, timed-out or empty query is always `unknown`. It is never
//! reported as healthy or unhealthy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use grayline_state::{HealthStatus, HealthThreshold, MetricDefinition, MetricKind, RedMetricsConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::query::{MetricsQuery, QueryError, TimeSeries};

/// Which side of the threshold counts as a breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Below,
    Above,
}

impl Direction {
    pub fn breached(self, value: f64, threshold: f64) -> bool {
        match self {
            Direction::Below => value < threshold,
            Direction::Above => value > threshold,
        }
    }
}

/// Breach direction per RED signal.
const RED_DIRECTIONS: [(MetricKind, Direction); 3] = [
    (MetricKind::Rate, Direction::Below),
    (MetricKind::Error, Direction::Above),
    (MetricKind::Duration, Direction::Above),
];

/// What an evaluation measured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum SignalKey {
    Red(MetricKind),
    Rule(String),
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKey::Red(kind) => write!(f, "red:{kind}"),
            SignalKey::Rule(name) => write!(f, "rule:{name}"),
        }
    }
}

/// Classification of one signal at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvaluation {
    pub signal: SignalKey,
    /// Latest sample value, absent when the signal is unknown.
    pub value: Option<f64>,
    pub threshold: f64,
    pub direction: Direction,
    pub breached: bool,
    pub classification: HealthStatus,
    /// Unix seconds of the sample (or of the evaluation when unknown).
    pub sampled_at: u64,
    /// Why the signal is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MetricEvaluation {
    fn classified(signal: SignalKey, value: f64, threshold: f64, direction: Direction, sampled_at: u64) -> Self {
        let breached = direction.breached(value, threshold);
        Self {
            signal,
            value: Some(value),
            threshold,
            direction,
            breached,
            classification: if breached {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            },
            sampled_at,
            reason: None,
        }
    }

    fn unknown(signal: SignalKey, threshold: f64, direction: Direction, at: u64, reason: String) -> Self {
        Self {
            signal,
            value: None,
            threshold,
            direction,
            breached: false,
            classification: HealthStatus::Unknown,
            sampled_at: at,
            reason: Some(reason),
        }
    }
}

/// Everything evaluated for one application in one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub app: String,
    pub evaluated_at: u64,
    pub evaluations: Vec<MetricEvaluation>,
}

impl HealthReport {
    pub fn get(&self, signal: &SignalKey) -> Option<&MetricEvaluation> {
        self.evaluations.iter().find(|e| &e.signal == signal)
    }

    /// Unhealthy if any signal is; otherwise unknown if any signal is (or
    /// nothing was evaluated); otherwise healthy.
    pub fn overall(&self) -> HealthStatus {
        let statuses = self.evaluations.iter().map(|e| e.classification);
        if statuses.clone().any(|s| s == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if self.evaluations.is_empty() || statuses.clone().any(|s| s == HealthStatus::Unknown) {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        }
    }
}

/// An unbound alert rule evaluated as a firing expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FiringRule {
    pub name: String,
    pub expr: String,
    pub labels: HashMap<String, String>,
}

/// Threshold and direction for a RED signal.
pub fn red_threshold(kind: MetricKind, red: &RedMetricsConfig) -> (f64, Direction) {
    let direction = RED_DIRECTIONS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, d)| *d)
        .unwrap_or(Direction::Above);
    let threshold = threshold_value(kind, &red.threshold, red.definition(kind));
    (threshold, direction)
}

fn threshold_value(kind: MetricKind, t: &HealthThreshold, def: Option<&MetricDefinition>) -> f64 {
    match kind {
        MetricKind::Rate => t.rate_min,
        MetricKind::Error => t.error_rate_max,
        MetricKind::Duration => match (def.is_some_and(requests_p99), t.duration_p99_max) {
            (true, Some(p99)) => p99,
            _ => t.duration_p95_max,
        },
    }
}

fn requests_p99(def: &MetricDefinition) -> bool {
    def.labels.get("quantile").is_some_and(|q| q == "0.99")
}

/// Queries metrics with a bounded timeout and classifies the results.
pub struct Evaluator {
    query: Arc<dyn MetricsQuery>,
    query_timeout: Duration,
    window: Duration,
    step: Duration,
}

impl Evaluator {
    pub fn new(query: Arc<dyn MetricsQuery>, query_timeout: Duration, window: Duration, step: Duration) -> Self {
        Self {
            query,
            query_timeout,
            window,
            step,
        }
    }

    /// Evaluate the RED signals of `red` (when enabled) and every firing rule.
    pub async fn evaluate(
        &self,
        app: &str,
        red: Option<&RedMetricsConfig>,
        rules: &[FiringRule],
        now: u64,
    ) -> HealthReport {
        let mut evaluations = Vec::new();

        if let Some(red) = red.filter(|r| r.enabled) {
            for (kind, def) in red.definitions() {
                let (threshold, direction) = red_threshold(kind, red);
                let signal = SignalKey::Red(kind);
                let evaluation = match self.run(&def.query, now).await {
                    Ok(series) => match worst_of(&series, direction) {
                        Some((value, at)) => {
                            MetricEvaluation::classified(signal, value, threshold, direction, at)
                        }
                        None => MetricEvaluation::unknown(
                            signal,
                            threshold,
                            direction,
                            now,
                            "empty result".into(),
                        ),
                    },
                    Err(e) => {
                        warn!(%app, metric = %kind, error = %e, "metric query failed");
                        MetricEvaluation::unknown(signal, threshold, direction, now, e.to_string())
                    }
                };
                evaluations.push(evaluation);
            }
        }

        for rule in rules {
            let signal = SignalKey::Rule(rule.name.clone());
            let evaluation = match self.run(&rule.expr, now).await {
                Ok(series) => {
                    let firing = series
                        .iter()
                        .filter(|s| s.matches_labels(&rule.labels))
                        .filter_map(|s| s.latest())
                        .filter(|sample| !sample.value.is_nan())
                        .max_by(|a, b| a.value.total_cmp(&b.value));
                    match firing {
                        Some(sample) => MetricEvaluation::classified(
                            signal,
                            sample.value,
                            0.0,
                            Direction::Above,
                            sample.timestamp as u64,
                        ),
                        // No matching series means the alert expression is not firing.
                        None => MetricEvaluation {
                            signal,
                            value: None,
                            threshold: 0.0,
                            direction: Direction::Above,
                            breached: false,
                            classification: HealthStatus::Healthy,
                            sampled_at: now,
                            reason: None,
                        },
                    }
                }
                Err(e) => {
                    warn!(%app, rule = %rule.name, error = %e, "alert rule query failed");
                    MetricEvaluation::unknown(signal, 0.0, Direction::Above, now, e.to_string())
                }
            };
            evaluations.push(evaluation);
        }

        debug!(%app, signals = evaluations.len(), "health evaluated");
        HealthReport {
            app: app.to_string(),
            evaluated_at: now,
            evaluations,
        }
    }

    async fn run(&self, expr: &str, now: u64) -> Result<Vec<TimeSeries>, QueryError> {
        let start = now.saturating_sub(self.window.as_secs());
        match tokio::time::timeout(
            self.query_timeout,
            self.query.query_range(expr, start, now, self.step),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(self.query_timeout)),
        }
    }
}

/// Worst latest sample across all series in the breach direction, as
/// `(value, unix seconds)`.
///
/// Each series (typically one per instance) contributes its latest non-NaN
/// sample, so a single unhealthy instance is enough to breach. Equal values
/// resolve to the newest sample.
fn worst_of(series: &[TimeSeries], direction: Direction) -> Option<(f64, u64)> {
    series
        .iter()
        .filter_map(TimeSeries::latest)
        .filter(|s| !s.value.is_nan())
        .max_by(|a, b| {
            let by_value = match direction {
                Direction::Above => a.value.total_cmp(&b.value),
                Direction::Below => b.value.total_cmp(&a.value),
            };
            by_value.then_with(|| a.timestamp.total_cmp(&b.timestamp))
        })
        .map(|s| (s.value, s.timestamp as u64))
}
