//! Configuration loading with multi-layer merge

use super::{CheckpointConfig, EngineConfig, FastPathConfig, RuleConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level agent-graph configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub fast_path: FastPathConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Rules for the rule-based decision provider, matched in order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl AppConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/agent-graph/config.toml
    /// 3. .agent-graph/config.toml (project)
    /// 4. `explicit`, when given
    ///
    /// Layers merge key by key, so a later layer can also set a value back
    /// to its default.
    pub fn load(project_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Self> {
        let project_config_path = project_dir
            .map(|p| p.join(".agent-graph/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".agent-graph/config.toml"));

        let mut layers: Vec<PathBuf> = Self::user_config_path()
            .into_iter()
            .chain(Some(project_config_path))
            .filter(|p| p.exists())
            .collect();
        layers.extend(explicit.map(Path::to_path_buf));

        let mut merged = toml::Table::new();
        for path in &layers {
            let layer =
                Self::load_layer(path).with_context(|| format!("loading {}", path.display()))?;
            merge_layer(&mut merged, layer);
        }
        toml::Value::Table(merged)
            .try_into()
            .context("combining configuration layers")
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// The keys a file actually sets, after checking it parses as a config
    fn load_layer(path: &Path) -> Result<toml::Table> {
        Self::load_file(path)?;
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        contents
            .parse::<toml::Table>()
            .with_context(|| format!("parsing {}", path.display()))
    }

    /// Get the user config path (~/.config/agent-graph/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agent-graph/config.toml"))
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing configuration")
    }
}

/// Fold `layer` into `base`; keys in `layer` win
fn merge_layer(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        let merged = match (key.as_str(), base.remove(&key), value) {
            // Later rule sets take priority but earlier ones still apply
            ("rules", Some(toml::Value::Array(earlier)), toml::Value::Array(mut later)) => {
                later.extend(earlier);
                toml::Value::Array(later)
            }
            // Fast path replaces wholesale once a layer customizes it
            ("fast_path", _, value) => value,
            (_, Some(toml::Value::Table(mut earlier)), toml::Value::Table(later)) => {
                merge_layer(&mut earlier, later);
                toml::Value::Table(earlier)
            }
            (_, _, value) => value,
        };
        base.insert(key, merged);
    }
}
