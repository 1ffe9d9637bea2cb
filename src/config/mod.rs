//! Configuration management for Tabula API.
//!
//! Configuration is loaded in layers: built-in defaults, then an optional
//! `config/tabula.yaml`, then `TABULA__`-prefixed environment variables,
//! then a handful of well-known environment variables (`ANTHROPIC_API_KEY`,
//! per-tier model overrides, `LLM_DEBUG`).
//!
//! After loading, call [`AppConfig::validate`] before serving: it turns a
//! missing API key or a missing knowledge directory into an actionable
//! startup error instead of a failed first request.

pub mod error;

pub use error::{ConfigResult, ConfigurationError};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// LLM provider configuration.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Knowledge directory layout (datasources, schemas, prompts).
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from defaults, config files, and environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{}", e))?;
        Ok(config)
    }

    /// Load configuration without validation.
    ///
    /// Useful for tests or when validation is handled separately.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .add_source(config::File::with_name("config/tabula").required(false))
            .add_source(
                config::Environment::with_prefix("TABULA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize().unwrap_or_default();

        // Provider credentials and model overrides
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            app_config.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("ANTHROPIC_WEAK_MODEL") {
            app_config.llm.weak_model = model;
        }
        if let Ok(model) = std::env::var("ANTHROPIC_PLANNING_MODEL") {
            app_config.llm.planning_model = model;
        }
        if let Ok(model) = std::env::var("ANTHROPIC_DEVELOPER_MODEL") {
            app_config.llm.developer_model = model;
        }
        if let Ok(flag) = std::env::var("LLM_DEBUG") {
            app_config.llm.debug = flag.eq_ignore_ascii_case("true") || flag == "1";
        }
        if let Ok(dir) = std::env::var("TABULA_KNOWLEDGE_DIR") {
            app_config.knowledge.dir = PathBuf::from(dir);
        }

        Ok(app_config)
    }

    /// Validate the configuration for serving.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.llm.api_key.as_deref().unwrap_or("").is_empty() {
            errors.push(ConfigurationError::missing_required(
                "LLM API key",
                "Calling the Anthropic Messages API",
                "ANTHROPIC_API_KEY",
            ));
        }

        if !self.knowledge.dir.is_dir() {
            errors.push(ConfigurationError::invalid(
                format!(
                    "Knowledge directory '{}' does not exist",
                    self.knowledge.dir.display()
                ),
                "Point TABULA_KNOWLEDGE_DIR at a directory containing \
                 datasources.yaml, data_schemas/, and prompts/",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.swap_remove(0)),
            _ => Err(ConfigurationError::multiple(errors)),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// API port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    /// Whole-turn deadline in seconds; stages are not entered past it.
    #[serde(default = "default_turn_deadline")]
    pub turn_deadline_secs: u64,
    /// Number of recent user/server message pairs passed as context.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

fn default_turn_deadline() -> u64 {
    240
}

fn default_history_window() -> usize {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_request_timeout(),
            turn_deadline_secs: default_turn_deadline(),
            history_window: default_history_window(),
        }
    }
}

/// LLM provider configuration.
///
/// The pipeline addresses models by tier (`weak`, `planning`, `developer`);
/// this struct owns the tier-to-model-id mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Anthropic API key.
    pub api_key: Option<String>,
    /// Base URL for the Anthropic API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model id for the `weak` tier (cheap validation calls).
    #[serde(default = "default_weak_model")]
    pub weak_model: String,
    /// Model id for the `planning` tier (decide/plan/summarize).
    #[serde(default = "default_planning_model")]
    pub planning_model: String,
    /// Model id for the `developer` tier (SQL generation and error analysis).
    #[serde(default = "default_developer_model")]
    pub developer_model: String,
    /// Maximum tokens to generate per call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
    /// Record full prompts and structured responses in stage traces.
    #[serde(default)]
    pub debug: bool,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_weak_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_planning_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_developer_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            weak_model: default_weak_model(),
            planning_model: default_planning_model(),
            developer_model: default_developer_model(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_llm_timeout(),
            debug: false,
        }
    }
}

/// Knowledge directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Root directory holding datasources.yaml, data_schemas/, prompts/.
    #[serde(default = "default_knowledge_dir")]
    pub dir: PathBuf,
}

fn default_knowledge_dir() -> PathBuf {
    PathBuf::from("knowledge")
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: default_knowledge_dir(),
        }
    }
}

impl KnowledgeConfig {
    /// Path to the datasource catalog file.
    #[must_use]
    pub fn datasources_path(&self) -> PathBuf {
        self.dir.join("datasources.yaml")
    }

    /// Path to the per-database schema descriptor directory.
    #[must_use]
    pub fn schemas_dir(&self) -> PathBuf {
        self.dir.join("data_schemas")
    }

    /// Path to the catalog summary file (db id, name, description, datasource).
    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.schemas_dir().join("summary.yaml")
    }

    /// Path to the prompt template directory.
    #[must_use]
    pub fn prompts_dir(&self) -> PathBuf {
        self.dir.join("prompts")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to use JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.history_window, 10);
        assert_eq!(config.llm.max_tokens, 4096);
        assert!(!config.llm.debug);
        assert_eq!(config.knowledge.dir, PathBuf::from("knowledge"));
    }

    #[test]
    fn test_knowledge_paths_derive_from_dir() {
        let knowledge = KnowledgeConfig {
            dir: PathBuf::from("/opt/tabula/knowledge"),
        };
        assert_eq!(
            knowledge.summary_path(),
            PathBuf::from("/opt/tabula/knowledge/data_schemas/summary.yaml")
        );
        assert_eq!(
            knowledge.prompts_dir(),
            PathBuf::from("/opt/tabula/knowledge/prompts")
        );
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = AppConfig {
            knowledge: KnowledgeConfig {
                dir: std::env::temp_dir(),
            },
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
