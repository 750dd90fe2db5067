//! Warden configuration

use crate::error::{WardenError, WardenResult};
use crate::verdict::Verdict;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";

/// Default configuration path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/warden.json";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Out-of-process evaluators
    pub plugins: Vec<PluginConfig>,
    /// Decision settings
    pub decision: DecisionConfig,
    /// Packet inspection settings
    pub inspection: InspectionConfig,
}

impl WardenConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> WardenResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Load from the file named by `WARDEN_CONFIG`, or the default path
    pub fn load_from_env() -> WardenResult<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        tracing::debug!(%path, "loading warden config");
        Self::load(path)
    }

    /// Parse JSON
    pub fn from_json(content: &str) -> WardenResult<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> WardenResult<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| WardenError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> WardenResult<()> {
        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return Err(WardenError::Config("plugin name must not be empty".into()));
            }
            if !seen.insert(plugin.name.as_str()) {
                return Err(WardenError::Config(format!(
                    "duplicate plugin name: {}",
                    plugin.name
                )));
            }
            if plugin.call_timeout_ms == 0 || plugin.handshake_timeout_ms == 0 {
                return Err(WardenError::Config(format!(
                    "plugin {}: call_timeout_ms and handshake_timeout_ms must be > 0",
                    plugin.name
                )));
            }
        }
        if self.decision.timeout_ms == 0 {
            return Err(WardenError::Config("decision.timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Enabled plugins in configuration order
    pub fn enabled_plugins(&self) -> impl Iterator<Item = &PluginConfig> {
        self.plugins.iter().filter(|p| p.enabled)
    }
}

/// One plugin process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Unique plugin name
    pub name: String,
    /// Path of the plugin executable
    pub path: PathBuf,
    /// Command line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Upper bound for a single call in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Upper bound for the handshake in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Whether the plugin is launched
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Plugin specific settings delivered at handshake
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl PluginConfig {
    /// Create config with defaults for the given executable
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            call_timeout_ms: default_call_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            enabled: true,
            settings: serde_json::Value::Null,
        }
    }

    /// Set plugin settings
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    /// Per-call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_call_timeout_ms() -> u64 {
    2_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// What the host does when the decider chain returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave the connection undecided and surface `Undeterminable`
    #[default]
    Propagate,
    /// Accept the connection
    FailOpen,
    /// Block the connection
    FailClosed,
}

impl FailurePolicy {
    /// Verdict applied on chain failure
    pub fn fallback_verdict(self) -> Verdict {
        match self {
            Self::Propagate => Verdict::Undeterminable,
            Self::FailOpen => Verdict::Accept,
            Self::FailClosed => Verdict::Block,
        }
    }
}

/// Decision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Upper bound for one full chain evaluation in milliseconds
    pub timeout_ms: u64,
    /// Behaviour on chain errors
    pub failure_policy: FailurePolicy,
    /// Put the self-traffic filter in front of the chain
    pub allow_self_traffic: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            failure_policy: FailurePolicy::default(),
            allow_self_traffic: true,
        }
    }
}

impl DecisionConfig {
    /// Chain timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How inspector verdicts are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverridePolicy {
    /// Inspector verdicts are logged only
    #[default]
    Advisory,
    /// Terminal inspector verdicts decide still-undecided connections
    AllowOverride,
}

/// Packet inspection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Treatment of inspector verdicts
    pub override_policy: OverridePolicy,
    /// Inspector names that are never instantiated
    pub disabled: Vec<String>,
}
