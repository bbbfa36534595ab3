//! Declarative configuration: `apiVersion: loom/v1`, `kind: LearningAgentConfig`.
//!
//! Follows the donor's `route_quality::config` style — plain structs with
//! `Default` impls and named helper constructors — generalized to parse
//! from a versioned YAML document with `${VAR}` environment expansion.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LearningError, Result};
use crate::types::Impact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutonomyLevel {
    Manual,
    HumanApproval,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30 * 60
}
fn default_success_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementPolicy {
    #[serde(default = "default_min_confidence")]
    pub auto_apply_min_confidence: f64,
    #[serde(default = "default_max_daily_changes")]
    pub max_daily_changes: u32,
    #[serde(default)]
    pub protected_agents: Vec<String>,
    #[serde(default)]
    pub allowed_change_types: Vec<String>,
    #[serde(default = "default_max_auto_apply_impact")]
    pub max_auto_apply_impact: Impact,
}

impl Default for ImprovementPolicy {
    fn default() -> Self {
        Self {
            auto_apply_min_confidence: default_min_confidence(),
            max_daily_changes: default_max_daily_changes(),
            protected_agents: Vec::new(),
            allowed_change_types: Vec::new(),
            max_auto_apply_impact: default_max_auto_apply_impact(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.8
}
fn default_max_daily_changes() -> u32 {
    10
}
fn default_max_auto_apply_impact() -> Impact {
    Impact::Medium
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub on_apply: bool,
    #[serde(default)]
    pub on_rollback: bool,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningAgentSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub autonomy_level: AutonomyLevel,
    #[serde(default = "default_analysis_interval_secs")]
    pub analysis_interval_secs: u64,
    #[serde(default)]
    pub watch_eval_suites: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub improvement_policy: ImprovementPolicy,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    /// 0 disables the self-trigger.
    #[serde(default)]
    pub execution_trigger: u64,
}

fn default_analysis_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningAgentConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: LearningAgentSpec,
}

impl LearningAgentConfig {
    /// Parse, expand `${VAR}` in string leaves against the process
    /// environment, and validate.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| LearningError::Validation(format!("invalid YAML: {e}")))?;
        let expanded = expand_env(value);
        let mut config: Self = serde_yaml::from_value(expanded)
            .map_err(|e| LearningError::Validation(format!("schema mismatch: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.api_version != "loom/v1" {
            return Err(LearningError::Validation(format!(
                "unsupported apiVersion '{}', expected 'loom/v1'",
                self.api_version
            )));
        }
        if self.kind != "LearningAgentConfig" {
            return Err(LearningError::Validation(format!(
                "unsupported kind '{}', expected 'LearningAgentConfig'",
                self.kind
            )));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(LearningError::Validation("metadata.name is required".into()));
        }

        if !(0.0..=1.0).contains(&self.spec.improvement_policy.auto_apply_min_confidence) {
            tracing::warn!(
                value = self.spec.improvement_policy.auto_apply_min_confidence,
                "auto_apply_min_confidence out of [0,1], clamping"
            );
            self.spec.improvement_policy.auto_apply_min_confidence =
                self.spec.improvement_policy.auto_apply_min_confidence.clamp(0.0, 1.0);
        }

        if self.spec.autonomy_level == AutonomyLevel::Full && !self.spec.circuit_breaker.enabled {
            tracing::warn!("autonomy_level=FULL with circuit_breaker.enabled=false; unattended apply has no failure guard");
        }

        Ok(())
    }
}

fn expand_env(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::String(s) => serde_yaml::Value::String(expand_string(&s)),
        serde_yaml::Value::Sequence(seq) => serde_yaml::Value::Sequence(seq.into_iter().map(expand_env).collect()),
        serde_yaml::Value::Mapping(map) => {
            serde_yaml::Value::Mapping(map.into_iter().map(|(k, v)| (k, expand_env(v))).collect())
        }
        other => other,
    }
}

fn expand_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '$' && s[i + 1..].starts_with('{') {
            if let Some(end) = s[i..].find('}') {
                let var_name = &s[i + 2..i + end];
                let value = std::env::var(var_name).unwrap_or_default();
                result.push_str(&value);
                for _ in 0..end {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}

#[derive(Debug, Clone, Default)]
pub struct DomainStats {
    pub deployments: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
apiVersion: loom/v1
kind: LearningAgentConfig
metadata:
  name: sql-learning-agent
spec:
  autonomy_level: FULL
  domains: ["sql"]
  improvement_policy:
    auto_apply_min_confidence: 0.85
"#;

    #[test]
    fn parses_valid_config_with_defaults() {
        let config = LearningAgentConfig::from_yaml(VALID_YAML).unwrap();
        assert_eq!(config.metadata.name, "sql-learning-agent");
        assert_eq!(config.spec.autonomy_level, AutonomyLevel::Full);
        assert_eq!(config.spec.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.spec.improvement_policy.auto_apply_min_confidence, 0.85);
    }

    #[test]
    fn rejects_wrong_api_version() {
        let yaml = VALID_YAML.replace("loom/v1", "loom/v2");
        assert!(LearningAgentConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn clamps_out_of_range_confidence() {
        let yaml = VALID_YAML.replace("0.85", "1.5");
        let config = LearningAgentConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.spec.improvement_policy.auto_apply_min_confidence, 1.0);
    }

    #[test]
    fn expands_env_vars_in_string_values() {
        std::env::set_var("LOOM_TEST_AGENT_NAME", "from-env");
        let yaml = VALID_YAML.replace("sql-learning-agent", "${LOOM_TEST_AGENT_NAME}");
        let config = LearningAgentConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.metadata.name, "from-env");
        std::env::remove_var("LOOM_TEST_AGENT_NAME");
    }
}
