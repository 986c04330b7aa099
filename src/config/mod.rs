//! Configuration for the workflow engine
//!
//! Settings are read from TOML files and merged in layers, see
//! [`AppConfig::load`].

mod loader;

pub use loader::AppConfig;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Runner and parallel pool limits
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on concurrently running tasks in one batch
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,

    /// Node executions allowed per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Retries of a failing node before the run fails
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Base delay between node retries, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Failed tasks in one batch that fail the workflow; 0 disables
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Wall-clock limit for a whole run
    pub timeout_ms: Option<u64>,

    /// Wall-clock limit for a single task
    pub task_timeout_ms: Option<u64>,
}

fn default_max_parallel_workers() -> usize {
    8
}

fn default_max_steps() -> u32 {
    50
}

fn default_retry_limit() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_failure_threshold() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: default_max_parallel_workers(),
            max_steps: default_max_steps(),
            retry_limit: default_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_threshold: default_failure_threshold(),
            timeout_ms: None,
            task_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// A canned reply for short, exact-match messages
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateResponse {
    pub name: String,
    pub patterns: Vec<String>,
    /// Rendered with the template engine against the state
    pub response: String,
}

/// Shortcut answers that skip the decision provider
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FastPathConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Longer messages never match a template
    #[serde(default = "default_max_words")]
    pub max_words: usize,

    #[serde(default = "default_templates")]
    pub templates: Vec<TemplateResponse>,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_max_words() -> usize {
    6
}

fn template(name: &str, patterns: &[&str], response: &str) -> TemplateResponse {
    TemplateResponse {
        name: name.into(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        response: response.into(),
    }
}

fn default_templates() -> Vec<TemplateResponse> {
    vec![
        template(
            "greetings",
            &["hi", "hello", "hey", "good morning", "good afternoon", "good evening"],
            "Hello! How can I help you today?",
        ),
        template(
            "thanks",
            &["thanks", "thank you", "thx", "appreciate it"],
            "You're welcome! Is there anything else I can help you with?",
        ),
        template(
            "goodbye",
            &["bye", "goodbye", "see you", "have a nice day"],
            "Thank you for contacting us! Have a great day!",
        ),
        template(
            "yes",
            &["yes", "yeah", "yep", "sure", "okay", "ok"],
            "Great! Let me help you with that.",
        ),
        template(
            "no",
            &["no", "nope", "not really", "no thanks"],
            "No problem! Let me know if you need anything else.",
        ),
    ]
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            max_words: default_max_words(),
            templates: default_templates(),
        }
    }
}

impl FastPathConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Where run checkpoints are stored
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Checkpoint after every step
    #[serde(default)]
    pub enabled: bool,

    /// SQLite database path; `~` and `$VARS` are expanded
    pub path: Option<String>,
}

impl CheckpointConfig {
    /// Expanded database path, defaulting to the user data directory
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match &self.path {
            Some(raw) => {
                let expanded = shellexpand::full(raw)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| raw.clone());
                Some(PathBuf::from(expanded))
            }
            None => dirs::data_dir().map(|d| d.join("agent-graph/checkpoints.db")),
        }
    }
}

/// A task the rule-based provider delegates
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DelegateConfig {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Keyword rule for the rule-based decision provider
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Matches when the last user message contains any of these (case-insensitive)
    pub contains: Vec<String>,

    /// Reply template
    pub respond: Option<String>,

    #[serde(default)]
    pub delegate: Vec<DelegateConfig>,

    #[serde(default)]
    pub wait: bool,

    #[serde(default)]
    pub complete: bool,

    pub fail: Option<String>,
}

impl RuleConfig {
    fn action_count(&self) -> usize {
        [
            self.respond.is_some(),
            !self.delegate.is_empty(),
            self.wait,
            self.complete,
            self.fail.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

impl AppConfig {
    /// Check the configuration for contradictions
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.engine.max_parallel_workers == 0 {
            errors.push("engine.max_parallel_workers must be at least 1".to_string());
        }
        if self.engine.max_steps == 0 {
            errors.push("engine.max_steps must be at least 1".to_string());
        }

        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.contains.is_empty() {
                errors.push(format!("rules[{}]: 'contains' must not be empty", idx));
            }
            if rule.action_count() != 1 {
                errors.push(format!(
                    "rules[{}]: exactly one of respond, delegate, wait, complete, fail is required",
                    idx
                ));
            }
        }

        for template in &self.fast_path.templates {
            if template.patterns.is_empty() {
                errors.push(format!(
                    "fast_path.templates '{}': no patterns",
                    template.name
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.max_parallel_workers, 8);
        assert_eq!(engine.max_steps, 50);
        assert_eq!(engine.retry_limit, 2);
        assert_eq!(engine.failure_threshold, 1);
        assert!(engine.timeout().is_none());
    }

    #[test]
    fn test_rule_requires_single_action() {
        let config = AppConfig {
            rules: vec![RuleConfig {
                contains: vec!["price".into()],
                respond: Some("It costs {{ 1 + 1 }}".into()),
                wait: true,
                ..Default::default()
            }],
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exactly one"));
    }

    #[test]
    fn test_checkpoint_path_expansion() {
        let config = CheckpointConfig {
            enabled: true,
            path: Some("/tmp/agent-graph/runs.db".into()),
        };
        assert_eq!(
            config.resolved_path(),
            Some(PathBuf::from("/tmp/agent-graph/runs.db"))
        );
    }

    #[test]
    fn test_default_templates_present() {
        let fast = FastPathConfig::default();
        assert!(!fast.enabled);
        assert_eq!(fast.templates.len(), 5);
        assert!(fast.templates[0].patterns.contains(&"hello".to_string()));
    }
}
