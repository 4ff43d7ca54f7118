//! grayline-health — RED metric evaluation for Grayline.
//!
//! - [`query`]: the time-series backend seam and a Prometheus client.
//! - [`evaluator`]: threshold comparison and alert-rule firing checks.
//! - [`monitor`]: per-application periodic evaluation tasks.

pub mod evaluator;
pub mod monitor;
pub mod query;

pub use evaluator::{
    Direction, Evaluator, FiringRule, HealthReport, MetricEvaluation, SignalKey, red_threshold,
};
pub use monitor::{HealthMonitor, ReportCallback, firing_rules};
pub use query::{BoxFuture, MetricsQuery, PrometheusClient, QueryError, Sample, TimeSeries};
