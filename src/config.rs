//! Runtime configuration for the agent.
//!
//! [`AgentConfig`] can be built in code with `with_*` setters, read from
//! `SQL_AGENT_*` environment variables, or (with the `yaml` feature) parsed
//! from a YAML document. All three paths end in [`AgentConfig::validate`].

use crate::error::{AgentError, Result};
use crate::graph::StageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Hard upper bound on validation-driven regenerations.
pub const MAX_REGENERATE_ATTEMPTS: u32 = 3;

/// Tunables for one [`SqlAgent`](crate::agent::SqlAgent) or executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the text-generation provider.
    pub base_url: String,
    /// Default model for every stage.
    pub model: String,
    /// Per-stage model overrides.
    pub stage_models: BTreeMap<StageId, String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask the provider for JSON output on structured stages.
    pub json_mode: bool,
    pub max_tables_to_select: usize,
    /// Clamped to [`MAX_REGENERATE_ATTEMPTS`].
    pub max_regenerate_attempts: u32,
    /// Maximum stage executions per run.
    pub step_ceiling: usize,
    /// How many memory hits to inject into analysis.
    pub memory_results: usize,
    /// How many past exchanges the evaluate stage sees.
    pub history_limit: usize,
    /// Wall-clock budget per run, in milliseconds.
    pub deadline_ms: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            stage_models: BTreeMap::new(),
            temperature: 0.1,
            max_tokens: 2048,
            json_mode: true,
            max_tables_to_select: 5,
            max_regenerate_attempts: MAX_REGENERATE_ATTEMPTS,
            step_ceiling: 25,
            memory_results: 5,
            history_limit: 5,
            deadline_ms: None,
        }
    }
}

impl AgentConfig {
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Use a different model for one stage.
    pub fn with_stage_model(mut self, stage: StageId, model: impl Into<String>) -> Self {
        self.stage_models.insert(stage, model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_max_tables(mut self, n: usize) -> Self {
        self.max_tables_to_select = n;
        self
    }

    pub fn with_max_regenerate_attempts(mut self, n: u32) -> Self {
        self.max_regenerate_attempts = n.min(MAX_REGENERATE_ATTEMPTS);
        self
    }

    pub fn with_step_ceiling(mut self, steps: usize) -> Self {
        self.step_ceiling = steps;
        self
    }

    pub fn with_memory_results(mut self, k: usize) -> Self {
        self.memory_results = k;
        self
    }

    pub fn with_history_limit(mut self, n: usize) -> Self {
        self.history_limit = n;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Model to use for `stage`.
    pub fn model_for(&self, stage: StageId) -> &str {
        self.stage_models
            .get(&stage)
            .map(String::as_str)
            .unwrap_or(&self.model)
    }

    /// Check ranges. Regeneration attempts are clamped rather than rejected.
    pub fn validate(mut self) -> Result<Self> {
        if self.step_ceiling == 0 {
            return Err(AgentError::InvalidConfig("step_ceiling must be at least 1".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AgentError::InvalidConfig(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.max_tables_to_select == 0 {
            return Err(AgentError::InvalidConfig(
                "max_tables_to_select must be at least 1".into(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(AgentError::InvalidConfig("model must not be empty".into()));
        }
        self.max_regenerate_attempts = self.max_regenerate_attempts.min(MAX_REGENERATE_ATTEMPTS);
        Ok(self)
    }

    /// Read `SQL_AGENT_*` variables over the defaults.
    ///
    /// | Variable | Alias | Field |
    /// |---|---|---|
    /// | `SQL_AGENT_BASE_URL` | `LLM_BASE_URL` | `base_url` |
    /// | `SQL_AGENT_MODEL` | `LLM_MODEL` | `model` |
    /// | `SQL_AGENT_TEMPERATURE` | `LLM_TEMPERATURE` | `temperature` |
    /// | `SQL_AGENT_MAX_TOKENS` | | `max_tokens` |
    /// | `SQL_AGENT_MAX_TABLES` | `MAX_TABLES_TO_SELECT` | `max_tables_to_select` |
    /// | `SQL_AGENT_MAX_REGENERATE_ATTEMPTS` | | `max_regenerate_attempts` |
    /// | `SQL_AGENT_STEP_CEILING` | `GRAPH_RECURSION_LIMIT` | `step_ceiling` |
    /// | `SQL_AGENT_MEMORY_RESULTS` | | `memory_results` |
    /// | `SQL_AGENT_HISTORY_LIMIT` | | `history_limit` |
    /// | `SQL_AGENT_DEADLINE_MS` | | `deadline_ms` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |primary: &str, alias: Option<&str>| {
            lookup(primary).or_else(|| alias.and_then(&lookup))
        };
        let mut cfg = Self::default();

        if let Some(v) = get("SQL_AGENT_BASE_URL", Some("LLM_BASE_URL")) {
            cfg.base_url = v;
        }
        if let Some(v) = get("SQL_AGENT_MODEL", Some("LLM_MODEL")) {
            cfg.model = v;
        }
        if let Some(v) = get("SQL_AGENT_TEMPERATURE", Some("LLM_TEMPERATURE")) {
            cfg.temperature = parse_var("temperature", &v)?;
        }
        if let Some(v) = get("SQL_AGENT_MAX_TOKENS", None) {
            cfg.max_tokens = parse_var("max_tokens", &v)?;
        }
        if let Some(v) = get("SQL_AGENT_MAX_TABLES", Some("MAX_TABLES_TO_SELECT")) {
            cfg.max_tables_to_select = parse_var("max_tables_to_select", &v)?;
        }
        if let Some(v) = get("SQL_AGENT_MAX_REGENERATE_ATTEMPTS", None) {
            cfg.max_regenerate_attempts = parse_var("max_regenerate_attempts", &v)?;
        }
        if let Some(v) = get("SQL_AGENT_STEP_CEILING", Some("GRAPH_RECURSION_LIMIT")) {
            cfg.step_ceiling = parse_var("step_ceiling", &v)?;
        }
        if let Some(v) = get("SQL_AGENT_MEMORY_RESULTS", None) {
            cfg.memory_results = parse_var("memory_results", &v)?;
        }
        if let Some(v) = get("SQL_AGENT_HISTORY_LIMIT", None) {
            cfg.history_limit = parse_var("history_limit", &v)?;
        }
        if let Some(v) = get("SQL_AGENT_DEADLINE_MS", None) {
            cfg.deadline_ms = Some(parse_var("deadline_ms", &v)?);
        }

        cfg.validate()
    }

    /// Parse a YAML document; unspecified fields keep their defaults.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml)
            .map_err(|e| AgentError::InvalidConfig(format!("bad YAML config: {e}")))?;
        cfg.validate()
    }
}

fn parse_var<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| AgentError::InvalidConfig(format!("{field}: cannot parse {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.model, "llama3.2:3b");
        assert_eq!(cfg.temperature, 0.1);
        assert_eq!(cfg.max_tables_to_select, 5);
        assert_eq!(cfg.max_regenerate_attempts, 3);
        assert_eq!(cfg.step_ceiling, 25);
        assert!(cfg.deadline().is_none());
    }

    #[test]
    fn test_regenerate_attempts_clamped() {
        let cfg = AgentConfig::default().with_max_regenerate_attempts(10);
        assert_eq!(cfg.max_regenerate_attempts, 3);
    }

    #[test]
    fn test_stage_model_override() {
        let cfg = AgentConfig::default().with_stage_model(StageId::Generate, "sqlcoder:7b");
        assert_eq!(cfg.model_for(StageId::Generate), "sqlcoder:7b");
        assert_eq!(cfg.model_for(StageId::Analyze), "llama3.2:3b");
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let err = AgentConfig::default().with_step_ceiling(0).validate().unwrap_err();
        assert!(matches!(err, AgentError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_bad_temperature() {
        assert!(AgentConfig::default().with_temperature(-0.5).validate().is_err());
        assert!(AgentConfig::default().with_temperature(0.7).validate().is_ok());
    }

    #[test]
    fn test_from_lookup_primary_and_alias() {
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("LLM_MODEL", "mistral"),
            ("SQL_AGENT_TEMPERATURE", "0.3"),
            ("GRAPH_RECURSION_LIMIT", "20"),
            ("SQL_AGENT_MAX_REGENERATE_ATTEMPTS", "7"),
        ]))
        .unwrap();
        assert_eq!(cfg.model, "mistral");
        assert_eq!(cfg.temperature, 0.3);
        assert_eq!(cfg.step_ceiling, 20);
        assert_eq!(cfg.max_regenerate_attempts, 3);
    }

    #[test]
    fn test_from_lookup_primary_wins() {
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("SQL_AGENT_MAX_TABLES", "2"),
            ("MAX_TABLES_TO_SELECT", "9"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_tables_to_select, 2);
    }

    #[test]
    fn test_from_lookup_bad_number() {
        let err = AgentConfig::from_lookup(lookup(&[("SQL_AGENT_STEP_CEILING", "many")])).unwrap_err();
        assert!(err.to_string().contains("step_ceiling"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_stage_keys() {
        let cfg = AgentConfig::default().with_stage_model(StageId::Summarize, "llama3.1:8b");
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["stage_models"]["summarize"], "llama3.1:8b");
        let back: AgentConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_from_yaml_partial() {
        let cfg = AgentConfig::from_yaml_str("model: qwen2.5:7b\nstep_ceiling: 30\n").unwrap();
        assert_eq!(cfg.model, "qwen2.5:7b");
        assert_eq!(cfg.step_ceiling, 30);
        assert_eq!(cfg.history_limit, 5);
    }
}
