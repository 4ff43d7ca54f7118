//! grayline-core — configuration and shared parsing helpers.

pub mod config;
pub mod duration;

pub use config::{
    ExecutorConfig, ExecutorKind, GraylineConfig, HealthSettings, NotifierConfig, NotifierKind,
    PrometheusConfig, RolloutSettings, ServerConfig,
};
pub use duration::{DurationError, parse_duration};
