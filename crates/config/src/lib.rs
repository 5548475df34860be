use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_path: String,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub llm_provider: String,
    /// Base URL of the OpenAI-compatible upstream. Overridden at runtime by
    /// the `TINYMEM_LLM_ENDPOINT` environment variable when set.
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub llm_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_provider: "openai".to_string(),
            llm_endpoint: String::new(),
            llm_api_key: String::new(),
            llm_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_address: String,
    /// Bytes of response tail retained for post-processing.
    pub response_tail_bytes: usize,
    /// Emit a `tinymem.memory_status` SSE event before the upstream stream.
    pub emit_memory_status: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8787".to_string(),
            response_tail_bytes: 64 * 1024,
            emit_memory_status: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationConfig {
    /// 0 = unlimited.
    pub max_tokens: usize,
    /// 0 = unlimited.
    pub max_entities: usize,
    pub enable_filepath_anchors: bool,
    pub enable_symbol_anchors: bool,
    pub enable_session_anchors: bool,
    pub enable_semantic_ranking: bool,
    pub semantic_threshold: f32,
    pub semantic_budget_tokens: usize,
    pub semantic_budget_entities: usize,
    pub embedding_provider: String,
    pub embedding_endpoint: String,
    pub embedding_model: String,
    pub embedding_api_key: String,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            max_entities: 8,
            enable_filepath_anchors: true,
            enable_symbol_anchors: true,
            enable_session_anchors: true,
            enable_semantic_ranking: false,
            semantic_threshold: 0.35,
            semantic_budget_tokens: 1024,
            semantic_budget_entities: 4,
            embedding_provider: String::new(),
            embedding_endpoint: String::new(),
            embedding_model: String::new(),
            embedding_api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Per-call audit timeout in seconds.
    pub timeout_secs: u64,
    /// Bounded audit queue depth; enqueue drops (with a warning) when full.
    pub queue_depth: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TombstoneConfig {
    /// Episodes a tombstoned entity stays resurrectable.
    pub episodes_retained: u64,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            episodes_retained: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub llm: LlmConfig,
    pub proxy: ProxyConfig,
    pub hydration: HydrationConfig,
    pub audit: AuditConfig,
    pub tombstones: TombstoneConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        if let Ok(value) = env::var("TINYMEM_LLM_ENDPOINT") {
            if !value.is_empty() {
                config.llm.llm_endpoint = value;
            }
        }
        if let Ok(value) = env::var("TINYMEM_LLM_API_KEY") {
            if !value.is_empty() {
                config.llm.llm_api_key = value;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Every failure names the offending field; callers
    /// treat any error here as fatal.
    pub fn validate(&self) -> Result<()> {
        if self.database.database_path.trim().is_empty() {
            bail!("config: database.database_path is required");
        }
        if self.logging.log_path.trim().is_empty() {
            bail!("config: logging.log_path is required");
        }
        if self.llm.llm_model.trim().is_empty() {
            bail!("config: llm.llm_model is required");
        }

        let cli_provider = self.llm.llm_provider.eq_ignore_ascii_case("cli");
        if !cli_provider {
            let endpoint = self.llm.llm_endpoint.trim();
            if endpoint.is_empty() {
                bail!("config: llm.llm_endpoint is required unless llm.llm_provider is \"cli\"");
            }
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                bail!(
                    "config: llm.llm_endpoint must start with http:// or https:// (got {endpoint:?})"
                );
            }
        }

        if self.proxy.listen_address.trim().is_empty() {
            bail!("config: proxy.listen_address is required");
        }
        if !self.proxy.listen_address.contains(':') {
            bail!(
                "config: proxy.listen_address must be host:port (got {:?})",
                self.proxy.listen_address
            );
        }

        if self.hydration.enable_semantic_ranking {
            if self.hydration.embedding_endpoint.trim().is_empty() {
                bail!(
                    "config: hydration.embedding_endpoint is required when hydration.enable_semantic_ranking is true"
                );
            }
            if !(0.0..=1.0).contains(&self.hydration.semantic_threshold) {
                bail!(
                    "config: hydration.semantic_threshold must be in [0.0, 1.0] (got {})",
                    self.hydration.semantic_threshold
                );
            }
        }

        Ok(())
    }

    pub fn debug_endpoints_enabled(&self) -> bool {
        self.logging.debug
    }
}
