//! Alert rule compilation.
//!
//! A policy's rules are validated one by one. A rule that fails validation
//! is reported as a [`PolicyError`] and left out; the remaining rules stay
//! active.

use std::collections::HashSet;
use std::time::Duration;

use grayline_core::parse_duration;
use grayline_health::SignalKey;
use grayline_state::{AlertRule, RollbackPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("alert rule {rule:?}: {reason}")]
pub struct PolicyError {
    pub rule: String,
    pub reason: String,
}

/// A validated rule ready for breach tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub name: String,
    pub signal: SignalKey,
    pub window: Duration,
    pub severity: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledPolicy {
    pub enabled: bool,
    pub auto_rollback: bool,
    pub notify_channel: String,
    pub rules: Vec<CompiledRule>,
    pub errors: Vec<PolicyError>,
}

pub fn compile(policy: &RollbackPolicy) -> CompiledPolicy {
    let mut rules = Vec::new();
    let mut errors = Vec::new();
    let mut names = HashSet::new();

    for rule in &policy.alert_rules {
        if !rule.name.trim().is_empty() && !names.insert(rule.name.as_str()) {
            errors.push(PolicyError {
                rule: rule.name.clone(),
                reason: "duplicate rule name".into(),
            });
            continue;
        }
        match compile_rule(rule) {
            Ok(compiled) => rules.push(compiled),
            Err(e) => errors.push(e),
        }
    }

    CompiledPolicy {
        enabled: policy.enabled,
        auto_rollback: policy.auto_rollback,
        notify_channel: policy.notify_channel.clone(),
        rules,
        errors,
    }
}

/// Validate a whole policy, returning every rule error.
pub fn validate(policy: &RollbackPolicy) -> Vec<PolicyError> {
    compile(policy).errors
}

fn compile_rule(rule: &AlertRule) -> Result<CompiledRule, PolicyError> {
    let fail = |reason: String| PolicyError {
        rule: rule.name.clone(),
        reason,
    };

    if rule.name.trim().is_empty() {
        return Err(fail("name must not be empty".into()));
    }
    let window = parse_duration(&rule.duration).map_err(|e| fail(format!("duration: {e}")))?;
    if window.is_zero() {
        return Err(fail("duration must be positive".into()));
    }

    let signal = match rule.metric {
        Some(kind) => SignalKey::Red(kind),
        None if rule.expr.trim().is_empty() => {
            return Err(fail("rule needs either `expr` or a `metric` binding".into()));
        }
        None => SignalKey::Rule(rule.name.clone()),
    };

    Ok(CompiledRule {
        name: rule.name.clone(),
        signal,
        window,
        severity: rule.severity.clone(),
        description: rule
            .annotations
            .get("description")
            .or_else(|| rule.annotations.get("summary"))
            .cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use grayline_state::MetricKind;
    use std::collections::HashMap;

    fn rule(name: &str, duration: &str, expr: &str, metric: Option<MetricKind>) -> AlertRule {
        AlertRule {
            name: name.into(),
            expr: expr.into(),
            duration: duration.into(),
            severity: "critical".into(),
            labels: HashMap::new(),
            annotations: HashMap::from([("description".to_string(), "error budget burn".to_string())]),
            metric,
        }
    }

    fn policy(rules: Vec<AlertRule>) -> RollbackPolicy {
        RollbackPolicy {
            enabled: true,
            alert_rules: rules,
            auto_rollback: true,
            notify_channel: "ops".into(),
        }
    }

    #[test]
    fn compiles_bound_and_unbound_rules() {
        let compiled = compile(&policy(vec![
            rule("errors", "5m", "", Some(MetricKind::Error)),
            rule("pod_restarts", "90s", "increase(restarts[5m]) > 3", None),
        ]));
        assert!(compiled.errors.is_empty());
        assert_eq!(compiled.rules[0].signal, SignalKey::Red(MetricKind::Error));
        assert_eq!(compiled.rules[0].window, Duration::from_secs(300));
        assert_eq!(compiled.rules[1].signal, SignalKey::Rule("pod_restarts".into()));
        assert_eq!(
            compiled.rules[1].description.as_deref(),
            Some("error budget burn")
        );
    }

    #[test]
    fn invalid_rules_are_isolated() {
        let compiled = compile(&policy(vec![
            rule("bad_window", "soon", "up == 0", None),
            rule("zero", "0s", "up == 0", None),
            rule("no_expr", "5m", "", None),
            rule("", "5m", "up == 0", None),
            rule("good", "1m", "", Some(MetricKind::Rate)),
            rule("good", "1m", "", Some(MetricKind::Rate)),
        ]));
        assert_eq!(compiled.rules.len(), 1);
        assert_eq!(compiled.rules[0].name, "good");

        let failed: Vec<&str> = compiled.errors.iter().map(|e| e.rule.as_str()).collect();
        assert_eq!(failed, vec!["bad_window", "zero", "no_expr", "", "good"]);
        assert!(compiled.errors[0].to_string().contains("duration"));
    }

    #[test]
    fn validate_reports_errors_only() {
        assert!(validate(&policy(vec![rule("a", "5m", "x > 1", None)])).is_empty());
        assert_eq!(validate(&policy(vec![rule("a", "", "x > 1", None)])).len(), 1);
    }
}
