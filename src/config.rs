use regex_lite::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    InvalidValue {
        field: String,
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid YAML in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid value for '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

/// Which downstream dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    AnthropicPassthrough,
    Openai,
    OpenaiCompatible,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::AnthropicPassthrough => "anthropic-passthrough",
            AdapterKind::Openai => "openai",
            AdapterKind::OpenaiCompatible => "openai-compatible",
        }
    }
}

/// Connect / read timeouts in milliseconds. Hashable so it can participate
/// in the client-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_ms")]
    pub connect: u64,
    #[serde(default = "default_read_ms")]
    pub read: u64,
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_read_ms() -> u64 {
    600_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_ms(),
            read: default_read_ms(),
        }
    }
}

/// Tool restriction policy. Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ToolPolicyConfig {
    #[serde(default = "default_restricted_tools")]
    pub restricted_tool_names: Vec<String>,
}

fn default_restricted_tools() -> Vec<String> {
    vec!["WebSearch".to_string(), "WebFetch".to_string()]
}

impl Default for ToolPolicyConfig {
    fn default() -> Self {
        Self {
            restricted_tool_names: default_restricted_tools(),
        }
    }
}

impl ToolPolicyConfig {
    pub fn is_restricted(&self, tool_name: &str) -> bool {
        self.restricted_tool_names
            .iter()
            .any(|r| r.eq_ignore_ascii_case(tool_name))
    }
}

/// A single downstream provider. The name is the key in `Config::providers`.
/// Hashable by value: the whole config (not just the base URL) keys the
/// client cache, since two providers may share a URL but differ in adapter,
/// key env, or timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub adapter: AdapterKind,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub tools: Option<ToolPolicyConfig>,
    #[serde(default)]
    pub timeouts_ms: Option<TimeoutsConfig>,
}

/// One clause filter applied to the top-level system prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemClauseFilter {
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl SystemClauseFilter {
    /// Compile the regex form of this filter. Literal filters return None.
    pub fn compile(&self) -> Option<Result<Regex, regex_lite::Error>> {
        if !self.is_regex {
            return None;
        }
        Some(
            RegexBuilder::new(&self.pattern)
                .case_insensitive(!self.case_sensitive)
                .build(),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemPromptFilters {
    #[serde(default)]
    pub clause_filters: Vec<SystemClauseFilter>,
}

/// A conditional gate on a config-patch leaf. Exactly one field is set.
///
/// The equality fields compare against JSON null for an absent leaf, so an
/// explicit `current_equals: null` in config must stay distinguishable from
/// the key not being written at all.
#[derive(Debug, Clone, Deserialize)]
pub struct WhenCondition {
    #[serde(default)]
    pub current_in: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub current_not_in: Option<Vec<serde_json::Value>>,
    #[serde(default, deserialize_with = "present_value")]
    pub current_equals: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "present_value")]
    pub current_not_equals: Option<serde_json::Value>,
}

/// A plain `Option` folds a present YAML/JSON null into `None`; this keeps a
/// written null as `Some(Value::Null)` (absence still goes through `default`).
fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl WhenCondition {
    fn arity(&self) -> usize {
        [
            self.current_in.is_some(),
            self.current_not_in.is_some(),
            self.current_equals.is_some(),
            self.current_not_equals.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }

    /// Evaluate against the current value at the leaf's path. A missing leaf
    /// is compared as JSON null.
    pub fn holds(&self, current: &serde_json::Value) -> bool {
        if let Some(values) = &self.current_in {
            return values.contains(current);
        }
        if let Some(values) = &self.current_not_in {
            return !values.contains(current);
        }
        if let Some(value) = &self.current_equals {
            return value == current;
        }
        if let Some(value) = &self.current_not_equals {
            return value != current;
        }
        true
    }
}

/// A node in an override rule's `config` tree: either a gated leaf, a nested
/// object of further nodes, or a bare leaf value (always applied).
///
/// Untagged order matters: `{value, when}` objects are conditional leaves,
/// any other mapping is a nested tree, everything else is a bare value.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigPatch {
    Conditional {
        value: serde_json::Value,
        when: WhenCondition,
    },
    Nested(BTreeMap<String, ConfigPatch>),
    Value(serde_json::Value),
}

/// Predicates for one override rule. All present predicates are ANDed;
/// absent predicates match anything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhenPredicates {
    #[serde(default)]
    pub system_regex: Option<String>,
    #[serde(default)]
    pub user_regex: Option<String>,
    #[serde(default)]
    pub model_regex: Option<String>,
    #[serde(default)]
    pub has_tool: Option<String>,
    #[serde(default)]
    pub header: Option<BTreeMap<String, String>>,
}

/// One ordered routing override.
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideRule {
    pub when: WhenPredicates,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub config: Option<BTreeMap<String, ConfigPatch>>,
}

/// Thresholds for mapping `thinking.budget_tokens` to reasoning effort.
#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningThresholds {
    #[serde(default = "default_low_max")]
    pub low_max: u64,
    #[serde(default = "default_medium_max")]
    pub medium_max: u64,
}

fn default_low_max() -> u64 {
    5_000
}

fn default_medium_max() -> u64 {
    15_000
}

impl Default for ReasoningThresholds {
    fn default() -> Self {
        Self {
            low_max: default_low_max(),
            medium_max: default_medium_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenaiConfig {
    #[serde(default = "default_effort")]
    pub reasoning_effort_default: String,
    #[serde(default)]
    pub reasoning_thresholds: ReasoningThresholds,
}

fn default_effort() -> String {
    "minimal".to_string()
}

impl Default for OpenaiConfig {
    fn default() -> Self {
        Self {
            reasoning_effort_default: default_effort(),
            reasoning_thresholds: ReasoningThresholds::default(),
        }
    }
}

/// Proxy configuration loaded from a YAML file passed via `--config`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
    #[serde(default)]
    pub tools: ToolPolicyConfig,
    #[serde(default)]
    pub system_prompt_filters: SystemPromptFilters,
    #[serde(default)]
    pub timeouts_ms: TimeoutsConfig,
    #[serde(default)]
    pub openai: OpenaiConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate config file content. Used both at startup and by
    /// the hot-reload task (which validates in isolation before swapping).
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, provider) in &self.providers {
            if !is_syntactic_url(&provider.base_url) {
                return Err(ConfigError::InvalidValue {
                    field: format!("providers.{}.base_url", name),
                    message: format!("'{}' is not a valid http(s) URL", provider.base_url),
                });
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".to_string(),
                message: format!(
                    "'{}' is not one of: {}",
                    self.log_level,
                    valid_levels.join(", ")
                ),
            });
        }

        let valid_efforts = ["minimal", "low", "medium", "high"];
        if !valid_efforts.contains(&self.openai.reasoning_effort_default.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "openai.reasoning_effort_default".to_string(),
                message: format!(
                    "'{}' is not one of: {}",
                    self.openai.reasoning_effort_default,
                    valid_efforts.join(", ")
                ),
            });
        }

        let thresholds = &self.openai.reasoning_thresholds;
        if thresholds.low_max == 0 || thresholds.medium_max <= thresholds.low_max {
            return Err(ConfigError::InvalidValue {
                field: "openai.reasoning_thresholds".to_string(),
                message: "thresholds must be positive and medium_max > low_max".to_string(),
            });
        }

        for (i, rule) in self.overrides.iter().enumerate() {
            if let Some(config) = &rule.config {
                for (key, patch) in config {
                    validate_patch(&format!("overrides[{}].config.{}", i, key), patch)?;
                }
            }
            // Predicate regexes that fail to compile make the predicate
            // non-matching at evaluation time rather than rejecting the
            // config; surface them here so operators notice.
            for (label, pattern) in [
                ("system_regex", &rule.when.system_regex),
                ("user_regex", &rule.when.user_regex),
                ("model_regex", &rule.when.model_regex),
            ] {
                if let Some(pattern) = pattern
                    && RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .is_err()
                {
                    warn!(
                        rule = i,
                        predicate = label,
                        pattern = %pattern,
                        "override predicate regex does not compile; rule will never match on it"
                    );
                }
            }
        }

        for (i, filter) in self.system_prompt_filters.clause_filters.iter().enumerate() {
            if let Some(Err(e)) = filter.compile() {
                return Err(ConfigError::InvalidValue {
                    field: format!("system_prompt_filters.clause_filters[{}].pattern", i),
                    message: e.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Effective tool policy for a tentative provider: per-provider override
    /// wins over the global policy.
    pub fn tool_policy_for<'a>(
        &'a self,
        provider: Option<&'a ProviderConfig>,
    ) -> &'a ToolPolicyConfig {
        provider
            .and_then(|p| p.tools.as_ref())
            .unwrap_or(&self.tools)
    }

    /// Effective timeouts for a provider (provider-specific wins).
    pub fn timeouts_for<'a>(&'a self, provider: &'a ProviderConfig) -> &'a TimeoutsConfig {
        provider.timeouts_ms.as_ref().unwrap_or(&self.timeouts_ms)
    }
}

fn validate_patch(field: &str, patch: &ConfigPatch) -> Result<(), ConfigError> {
    match patch {
        ConfigPatch::Conditional { when, .. } => {
            if when.arity() != 1 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "when must set exactly one of current_in, current_not_in, \
                              current_equals, current_not_equals"
                        .to_string(),
                });
            }
            Ok(())
        }
        ConfigPatch::Nested(map) => {
            for (key, child) in map {
                validate_patch(&format!("{}.{}", field, key), child)?;
            }
            Ok(())
        }
        ConfigPatch::Value(_) => Ok(()),
    }
}

/// Syntactic URL check: scheme://host[...]. Deliberately shallow; the HTTP
/// client reports anything deeper at request time.
fn is_syntactic_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(rest) => !rest.is_empty() && !rest.starts_with('/'),
        None => false,
    }
}

/// Compile an override predicate regex the way the routing engine matches it:
/// case-insensitive by default.
pub fn compile_predicate(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .ok()
}
