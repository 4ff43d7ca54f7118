//! grayline.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraylineConfig {
    pub server: ServerConfig,
    pub rollout: RolloutSettings,
    pub health: HealthSettings,
    pub prometheus: PrometheusConfig,
    pub executor: ExecutorConfig,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8640,
            data_dir: PathBuf::from("/var/lib/grayline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutSettings {
    /// Upper bound on concurrent remote executions.
    pub max_concurrent_executions: usize,
    /// Per-execution timeout (e.g. "10m").
    pub execution_timeout: String,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 8,
            execution_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Evaluation tick interval per application.
    pub interval: String,
    /// Timeout applied to each metric query.
    pub query_timeout: String,
    /// Trailing window queried on every tick.
    pub window: String,
    /// Resolution step of range queries.
    pub step: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            query_timeout: "5s".to_string(),
            window: "5m".to_string(),
            step: "15s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    /// `host:port` of a Prometheus-compatible query API.
    pub address: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Every execution succeeds immediately. Local testing only.
    #[default]
    Mock,
    /// Run an external program per node action.
    Command,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    /// Program invoked as `<program> <action> <node-id> <address> <app> <version>`.
    pub program: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Write alert notifications to the log.
    #[default]
    Log,
    /// POST alert notifications as JSON to `url`.
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    pub url: Option<String>,
    pub timeout: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::Log,
            url: None,
            timeout: "5s".to_string(),
        }
    }
}

impl NotifierConfig {
    pub fn timeout(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.timeout)?)
    }
}

impl GraylineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GraylineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configs whose duration fields do not parse.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.rollout.execution_timeout()?;
        self.health.interval()?;
        self.health.query_timeout()?;
        self.health.window()?;
        self.health.step()?;
        if self.rollout.max_concurrent_executions == 0 {
            anyhow::bail!("rollout.max_concurrent_executions must be at least 1");
        }
        if self.executor.kind == ExecutorKind::Command && self.executor.program.is_none() {
            anyhow::bail!("executor.program is required when executor.kind = \"command\"");
        }
        self.notifier.timeout()?;
        if self.notifier.kind == NotifierKind::Webhook && self.notifier.url.is_none() {
            anyhow::bail!("notifier.url is required when notifier.kind = \"webhook\"");
        }
        Ok(())
    }
}

impl RolloutSettings {
    pub fn execution_timeout(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.execution_timeout)?)
    }
}

impl HealthSettings {
    pub fn interval(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.interval)?)
    }

    pub fn query_timeout(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.query_timeout)?)
    }

    pub fn window(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.window)?)
    }

    pub fn step(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.step)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: GraylineConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8640);
        assert_eq!(config.rollout.max_concurrent_executions, 8);
        assert_eq!(config.health.interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.executor.kind, ExecutorKind::Mock);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[rollout]
max_concurrent_executions = 2

[health]
interval = "10s"
query_timeout = "2s"

[executor]
kind = "command"
program = "/usr/local/bin/deploy-node"
"#;
        let config: GraylineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.rollout.max_concurrent_executions, 2);
        assert_eq!(config.health.query_timeout().unwrap(), Duration::from_secs(2));
        assert_eq!(config.health.window().unwrap(), Duration::from_secs(300));
        assert_eq!(config.executor.kind, ExecutorKind::Command);
        config.validate().unwrap();
    }

    #[test]
    fn command_executor_requires_program() {
        let config: GraylineConfig = toml::from_str("[executor]\nkind = \"command\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grayline.toml");
        let config = GraylineConfig::default();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = GraylineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.health.step, "15s");
    }

    #[test]
    fn webhook_notifier_requires_url() {
        let config: GraylineConfig = toml::from_str("[notifier]\nkind = \"webhook\"\n").unwrap();
        assert!(config.validate().is_err());

        let config: GraylineConfig =
            toml::from_str("[notifier]\nkind = \"webhook\"\nurl = \"http://hooks.local/grayline\"\n")
                .unwrap();
        config.validate().unwrap();
        assert_eq!(config.notifier.timeout().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let config: GraylineConfig = toml::from_str("[health]\ninterval = \"soon\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
