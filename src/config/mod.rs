//! Engine configuration (layered: defaults > TOML file > environment).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{EngineError, Result};

const CONFIG_FILE_NAME: &str = "toolstream.toml";

pub const DEFAULT_MAX_TURNS: usize = 20;
pub const DEFAULT_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_THINKING_BUDGET: u32 = 4_096;
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 300;

/// What the turn loop does with a stop reason it does not recognise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnknownStopPolicy {
    /// Log it and finish the run as if the provider said `end_turn`.
    #[default]
    EndTurn,
    /// Fail the run.
    Fail,
}

/// Extended reasoning settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkingSettings {
    pub enabled: bool,
    pub budget_tokens: u32,
}

impl Default for ThinkingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            budget_tokens: DEFAULT_THINKING_BUDGET,
        }
    }
}

/// Automatic file lookup performed when a run completes without manual attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSearchSettings {
    pub enabled: bool,
    pub threshold: Option<f32>,
    pub max_files: Option<usize>,
}

impl Default for FileSearchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: Some(0.7),
            max_files: Some(5),
        }
    }
}

/// Configuration for a [`TurnLoop`](crate::agent_loop::TurnLoop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: String,
    pub max_turns: usize,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub prompt_caching: bool,
    pub thinking: ThinkingSettings,
    pub approval_timeout_secs: u64,
    pub unknown_stop_reason: UnknownStopPolicy,
    pub file_search: FileSearchSettings,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: None,
            prompt_caching: false,
            thinking: ThinkingSettings::default(),
            approval_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            unknown_stop_reason: UnknownStopPolicy::default(),
            file_search: FileSearchSettings::default(),
            anthropic_api_key: None,
            anthropic_base_url: None,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overlaid with environment variables (a `.env` file is honoured).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Full layering: defaults, then the platform config file if present, then env.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from a key lookup. Split out from [`from_env`](Self::from_env)
    /// so layering can be tested without touching the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TOOLSTREAM_MAX_TURNS") {
            self.max_turns = parse_env("TOOLSTREAM_MAX_TURNS", &v)?;
        }
        if let Some(v) = lookup("TOOLSTREAM_MAX_TOKENS") {
            self.max_tokens = parse_env("TOOLSTREAM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("TOOLSTREAM_MODEL") {
            self.model = v;
        }
        if let Some(v) = lookup("TOOLSTREAM_SYSTEM_PROMPT") {
            self.system_prompt = Some(v);
        }
        if let Some(v) = lookup("TOOLSTREAM_THINKING") {
            self.thinking.enabled = parse_env("TOOLSTREAM_THINKING", &v)?;
        }
        if let Some(v) = lookup("TOOLSTREAM_THINKING_BUDGET") {
            self.thinking.budget_tokens = parse_env("TOOLSTREAM_THINKING_BUDGET", &v)?;
        }
        if let Some(v) = lookup("TOOLSTREAM_FILE_SEARCH") {
            self.file_search.enabled = parse_env("TOOLSTREAM_FILE_SEARCH", &v)?;
        }
        if let Some(v) = lookup("TOOLSTREAM_UNKNOWN_STOP_REASON") {
            self.unknown_stop_reason = UnknownStopPolicy::from_str(&v).map_err(|_| {
                EngineError::Configuration(format!(
                    "TOOLSTREAM_UNKNOWN_STOP_REASON must be end_turn or fail, got {v:?}"
                ))
            })?;
        }
        if let Some(v) = lookup("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(v);
        }
        if let Some(v) = lookup("ANTHROPIC_BASE_URL") {
            self.anthropic_base_url = Some(v);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(EngineError::Configuration(
                "max_turns must be at least 1".into(),
            ));
        }
        if self.thinking.enabled && self.thinking.budget_tokens >= self.max_tokens {
            return Err(EngineError::Configuration(format!(
                "thinking budget ({}) must be below max_tokens ({})",
                self.thinking.budget_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// Location of `toolstream.toml` in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "toolstream", "toolstream")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Configuration(format!("{key} has invalid value {value:?}")))
}
