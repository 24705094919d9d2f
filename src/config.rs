//! Configuration management for the dispatch engine.
//!
//! Configuration is loaded from an optional YAML file, then overridden by
//! environment variables:
//! - `AGENT_DISPATCH_CONFIG` - Optional. Path to the YAML file. Defaults to `~/.agent-dispatch/config.yaml`.
//! - `DEFAULT_MODEL` - Optional. Model used when a task names none. Defaults to `sonnet`.
//! - `DEFAULT_PROVIDER` - Optional. Provider used when neither task nor agent names one. Defaults to `claude`.
//! - `MAX_CONCURRENT` - Optional. Admission semaphore capacity. Defaults to `3`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `7777`.
//! - `BASE_DIR` - Optional. State directory (outputs, history). Defaults to `~/.agent-dispatch`.
//! - `HISTORY_DB` - Optional. SQLite history path. Defaults to `{BASE_DIR}/history.db`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::estimate::ModelPricing;
use crate::injection::InjectionLevel;
use crate::sandbox::SandboxPolicy;
use crate::task::expand_home;
use crate::tools::policy::ToolProfile;
use crate::trust::TrustLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, String),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

/// Per-agent (role) configuration.
///
/// Empty strings and zero values mean "inherit the global default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub provider: String,
    pub permission_mode: String,
    pub budget: f64,
    /// Persona prompt used as the system prompt when a task carries none.
    pub system_prompt: String,
    /// Agent workspace, used as workdir when the task still has the default one.
    pub workdir: Option<PathBuf>,
    /// Overrides the global allow-list when non-empty.
    pub allowed_dirs: Vec<String>,
    pub fallback_providers: Vec<String>,
    pub trust_level: Option<TrustLevel>,
    /// Whole-word keywords used by the keyword router.
    pub keywords: Vec<String>,
    pub tool_policy: AgentToolPolicy,
}

/// Tool access and sandboxing for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentToolPolicy {
    /// Profile name (`minimal`, `standard`, `full`, or a custom profile).
    pub profile: String,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub sandbox: SandboxPolicy,
    pub sandbox_image: String,
}

/// Backend behind a configured provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// The `claude` CLI in print mode.
    #[default]
    ClaudeCli,
    /// An OpenAI-compatible chat completions endpoint. Supports tool calling.
    OpenaiCompatible,
}

/// A configured provider backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// CLI binary for CLI-backed providers. Defaults to the provider name.
    pub binary_path: String,
    /// Model used when a task reaching this provider names none.
    pub model: String,
    /// API root for HTTP providers, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// API key, or `$NAME` to read it from the environment.
    pub api_key: String,
}

impl ProviderConfig {
    /// The API key with a `$NAME` reference resolved. A missing variable
    /// resolves to an empty key.
    pub fn resolved_api_key(&self) -> String {
        match self.api_key.strip_prefix('$') {
            Some(var) => std::env::var(var).unwrap_or_default(),
            None => self.api_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub max_iterations: usize,
    pub tool_timeout_secs: u64,
    pub max_output_chars: usize,
    /// Message pairs kept verbatim when the context is compressed.
    pub keep_recent_pairs: usize,
    /// Fraction of the context window that triggers compression.
    pub context_threshold: f64,
    pub default_profile: String,
    pub profiles: HashMap<String, ToolProfile>,
    pub trust_override: HashMap<String, TrustLevel>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tool_timeout_secs: 30,
            max_output_chars: 16_000,
            keep_recent_pairs: 3,
            context_threshold: 0.8,
            default_profile: "standard".to_string(),
            profiles: HashMap::new(),
            trust_override: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub enabled: bool,
    pub default_level: TrustLevel,
    pub promote_threshold: usize,
    pub auto_promote: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_level: TrustLevel::Auto,
            promote_threshold: 10,
            auto_promote: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub docker_path: String,
    pub default_image: String,
    pub network: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_path: "docker".to_string(),
            default_image: String::new(),
            network: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalBudget {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentBudget {
    pub daily: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DowngradeThreshold {
    /// Utilization ratio in [0.0, 1.0].
    pub at: f64,
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDowngradeConfig {
    pub enabled: bool,
    pub thresholds: Vec<DowngradeThreshold>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Kill switch: all paid execution is suspended.
    pub paused: bool,
    pub global: GlobalBudget,
    pub agents: HashMap<String, AgentBudget>,
    pub auto_downgrade: AutoDowngradeConfig,
}

impl BudgetConfig {
    pub fn has_limits(&self) -> bool {
        self.global.daily > 0.0
            || self.global.weekly > 0.0
            || self.global.monthly > 0.0
            || self.agents.values().any(|b| b.daily > 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineQueueConfig {
    pub enabled: bool,
    pub ttl: String,
    pub max_items: usize,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: "1h".to_string(),
            max_items: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalGateConfig {
    pub enabled: bool,
    pub tools: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ApprovalGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tools: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl ApprovalGateConfig {
    /// Whether a tool call must pass the approval gate.
    pub fn needs_approval(&self, tool: &str) -> bool {
        self.enabled && self.tools.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionDefenseConfig {
    pub level: InjectionLevel,
    pub block_on_suspicious: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    pub trigger_on_fail: bool,
    /// Successful tasks cheaper than this are not reflected on.
    pub min_cost: f64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_on_fail: false,
            min_cost: 0.03,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartDispatchConfig {
    pub enabled: bool,
    /// Agent whose model is used for classification cost estimates.
    pub coordinator: String,
    pub default_agent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    /// Statuses that trigger this webhook; `all` (or an empty list) matches every status.
    pub events: Vec<String>,
    /// Extra request headers, e.g. an authorization token.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    pub default_output_tokens: u64,
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            default_output_tokens: 500,
            pricing: HashMap::new(),
        }
    }
}

/// Dispatch engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub base_dir: PathBuf,
    pub history_db: Option<PathBuf>,

    pub default_model: String,
    pub default_provider: String,
    pub default_timeout: String,
    pub default_budget: f64,
    pub default_permission_mode: String,
    pub default_workdir: PathBuf,

    pub max_concurrent: usize,
    pub max_prompt_len: usize,
    pub max_system_prompt_len: usize,

    /// Global directory allow-list. Empty means unrestricted.
    pub allowed_dirs: Vec<String>,
    pub fallback_providers: Vec<String>,

    pub agents: HashMap<String, AgentConfig>,
    pub providers: HashMap<String, ProviderConfig>,

    pub tools: ToolsConfig,
    pub trust: TrustConfig,
    pub sandbox: SandboxConfig,
    pub budgets: BudgetConfig,
    pub offline_queue: OfflineQueueConfig,
    pub approval_gates: ApprovalGateConfig,
    pub injection_defense: InjectionDefenseConfig,
    pub reflection: ReflectionConfig,
    pub smart_dispatch: SmartDispatchConfig,
    pub webhooks: Vec<WebhookConfig>,
    pub estimate: EstimateConfig,
}

impl Default for Config {
    fn default() -> Self {
        let base_dir = expand_home("~/.agent-dispatch");
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
            base_dir,
            history_db: None,
            default_model: "sonnet".to_string(),
            default_provider: "claude".to_string(),
            default_timeout: "15m".to_string(),
            default_budget: 2.0,
            default_permission_mode: "acceptEdits".to_string(),
            default_workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            max_concurrent: 3,
            max_prompt_len: 102_400,
            max_system_prompt_len: 40_000,
            allowed_dirs: Vec::new(),
            fallback_providers: Vec::new(),
            agents: HashMap::new(),
            providers: HashMap::new(),
            tools: ToolsConfig::default(),
            trust: TrustConfig::default(),
            sandbox: SandboxConfig::default(),
            budgets: BudgetConfig::default(),
            offline_queue: OfflineQueueConfig::default(),
            approval_gates: ApprovalGateConfig::default(),
            injection_defense: InjectionDefenseConfig::default(),
            reflection: ReflectionConfig::default(),
            smart_dispatch: SmartDispatchConfig::default(),
            webhooks: Vec::new(),
            estimate: EstimateConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file (if present) and environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be parsed or an environment
    /// override has an invalid value.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("AGENT_DISPATCH_CONFIG")
            .map(|p| expand_home(&p))
            .unwrap_or_else(|_| expand_home("~/.agent-dispatch/config.yaml"));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e.to_string()))?;
        Self::from_yaml(&raw).map_err(|e| match e {
            ConfigError::Parse(_, msg) => ConfigError::Parse(path.to_path_buf(), msg),
            other => other,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e.to_string()))?;
        config.base_dir = expand_home(&config.base_dir.to_string_lossy());
        config.default_workdir = expand_home(&config.default_workdir.to_string_lossy());
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(model) = std::env::var("DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Ok(provider) = std::env::var("DEFAULT_PROVIDER") {
            self.default_provider = provider;
        }
        if let Ok(host) = std::env::var("HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            self.port = port
                .parse()
                .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;
        }
        if let Ok(max) = std::env::var("MAX_CONCURRENT") {
            let max: usize = max.parse().map_err(|e| {
                ConfigError::InvalidValue("MAX_CONCURRENT".to_string(), format!("{}", e))
            })?;
            if max == 0 {
                return Err(ConfigError::InvalidValue(
                    "MAX_CONCURRENT".to_string(),
                    "must be at least 1".to_string(),
                ));
            }
            self.max_concurrent = max;
        }
        if let Ok(dir) = std::env::var("BASE_DIR") {
            self.base_dir = expand_home(&dir);
        }
        if let Ok(db) = std::env::var("HISTORY_DB") {
            self.history_db = Some(expand_home(&db));
        }
        Ok(())
    }

    /// Look up an agent by name. The empty name never matches.
    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        if name.is_empty() {
            return None;
        }
        self.agents.get(name)
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.history_db
            .clone()
            .unwrap_or_else(|| self.base_dir.join("history.db"))
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.base_dir.join("outputs")
    }
}
