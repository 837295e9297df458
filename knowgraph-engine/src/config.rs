// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Knowgraph engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub llm: LLMConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub community: CommunityConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LLMConfig {
    /// Provider used for every backend call ("openai", "anthropic", "ollama")
    #[serde(default = "default_provider_id")]
    pub provider_id: String,

    /// Model override (provider default when unset)
    #[serde(default)]
    pub model: Option<String>,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// Anthropic API key
    pub anthropic_api_key: Option<String>,

    /// Ollama base URL (e.g., "http://localhost:11434")
    pub ollama_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractionConfig {
    /// Maximum entities kept per document
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,

    /// Maximum relationships kept per document
    #[serde(default = "default_max_relationships")]
    pub max_relationships: usize,

    /// Input is truncated to this many characters before prompting
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommunityConfig {
    /// Communities smaller than this are dropped
    #[serde(default = "default_min_community_size")]
    pub min_community_size: usize,

    /// Modularity resolution (higher = more, smaller communities)
    #[serde(default = "default_resolution")]
    pub resolution: f64,

    /// Upper bound on aggregation levels
    #[serde(default = "default_max_levels")]
    pub max_levels: usize,

    /// Random seed for the node visiting order (entropy when unset)
    #[serde(default)]
    pub seed: Option<u64>,

    /// Names listed in the mechanical summary
    #[serde(default = "default_fallback_top_n")]
    pub fallback_top_n: usize,

    /// Concurrent summarization calls during a rebuild
    #[serde(default = "default_summary_concurrency")]
    pub summary_concurrency: usize,

    /// Summary cache capacity
    #[serde(default = "default_summary_cache_capacity")]
    pub summary_cache_capacity: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Worker pool size for the global map step
    #[serde(default = "default_map_concurrency")]
    pub map_concurrency: usize,

    /// Partial answers fed to the reduce step
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Hops expanded around the local-search anchor
    #[serde(default = "default_local_depth")]
    pub local_depth: usize,

    /// Token-overlap threshold for fuzzy entity matching (0, 1]
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,

    /// Cap on entities listed in a local-search context
    #[serde(default = "default_max_context_entities")]
    pub max_context_entities: usize,
}

// Default values
fn default_provider_id() -> String {
    "openai".to_string()
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

fn default_max_entities() -> usize {
    25
}

fn default_max_relationships() -> usize {
    40
}

fn default_max_input_chars() -> usize {
    12_000
}

fn default_min_community_size() -> usize {
    2
}

fn default_resolution() -> f64 {
    1.0
}

fn default_max_levels() -> usize {
    10
}

fn default_fallback_top_n() -> usize {
    5
}

fn default_summary_concurrency() -> usize {
    4
}

fn default_summary_cache_capacity() -> u64 {
    10_000
}

fn default_map_concurrency() -> usize {
    8
}

fn default_top_k() -> usize {
    5
}

fn default_local_depth() -> usize {
    1
}

fn default_fuzzy_threshold() -> f64 {
    0.5
}

fn default_max_context_entities() -> usize {
    30
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            model: None,
            request_timeout_ms: default_request_timeout_ms(),
            openai_api_key: None,
            anthropic_api_key: None,
            ollama_base_url: None,
        }
    }
}

impl LLMConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_entities: default_max_entities(),
            max_relationships: default_max_relationships(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            min_community_size: default_min_community_size(),
            resolution: default_resolution(),
            max_levels: default_max_levels(),
            seed: None,
            fallback_top_n: default_fallback_top_n(),
            summary_concurrency: default_summary_concurrency(),
            summary_cache_capacity: default_summary_cache_capacity(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            map_concurrency: default_map_concurrency(),
            top_k: default_top_k(),
            local_depth: default_local_depth(),
            fuzzy_threshold: default_fuzzy_threshold(),
            max_context_entities: default_max_context_entities(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - OPENAI_API_KEY / ANTHROPIC_API_KEY / OLLAMA_BASE_URL: backend credentials
    /// - KNOWGRAPH_LLM_PROVIDER: provider id (default: openai)
    /// - KNOWGRAPH_LLM_MODEL: model override
    /// - KNOWGRAPH_LLM_TIMEOUT_MS: per-call timeout (default: 20000)
    /// - KNOWGRAPH_MIN_COMMUNITY_SIZE: minimum community size (default: 2)
    /// - KNOWGRAPH_MAP_CONCURRENCY: global search worker pool (default: 8)
    pub fn apply_env(mut self) -> Self {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(key);
        }

        if let Ok(base_url) = std::env::var("OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = Some(base_url);
        }

        if let Ok(provider) = std::env::var("KNOWGRAPH_LLM_PROVIDER") {
            self.llm.provider_id = provider;
        }

        if let Ok(model) = std::env::var("KNOWGRAPH_LLM_MODEL") {
            self.llm.model = Some(model);
        }

        if let Ok(timeout) = std::env::var("KNOWGRAPH_LLM_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse() {
                self.llm.request_timeout_ms = val;
            }
        }

        if let Ok(size) = std::env::var("KNOWGRAPH_MIN_COMMUNITY_SIZE") {
            if let Ok(val) = size.parse() {
                self.community.min_community_size = val;
            }
        }

        if let Ok(workers) = std::env::var("KNOWGRAPH_MAP_CONCURRENCY") {
            if let Ok(val) = workers.parse() {
                self.search.map_concurrency = val;
            }
        }

        self
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Whether the selected provider has the credential it needs
    ///
    /// Matches what [`crate::llm::LLMProviderManager::is_enabled`] will report:
    /// a key for another provider does not enable the selected one.
    pub fn llm_configured(&self) -> bool {
        match self.llm.provider_id.as_str() {
            "openai" => self.llm.openai_api_key.is_some(),
            "anthropic" => self.llm.anthropic_api_key.is_some(),
            "ollama" => self.llm.ollama_base_url.is_some(),
            _ => false,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.llm.request_timeout_ms == 0 {
            anyhow::bail!("llm.request_timeout_ms must be greater than zero");
        }
        if self.extraction.max_entities == 0 {
            anyhow::bail!("extraction.max_entities must be greater than zero");
        }
        if self.extraction.max_input_chars == 0 {
            anyhow::bail!("extraction.max_input_chars must be greater than zero");
        }
        if self.community.min_community_size == 0 {
            anyhow::bail!("community.min_community_size must be at least 1");
        }
        if !(self.community.resolution > 0.0) {
            anyhow::bail!("community.resolution must be positive");
        }
        if self.community.summary_concurrency == 0 || self.search.map_concurrency == 0 {
            anyhow::bail!("concurrency limits must be greater than zero");
        }
        if self.search.top_k == 0 {
            anyhow::bail!("search.top_k must be at least 1");
        }
        if !(self.search.fuzzy_threshold > 0.0 && self.search.fuzzy_threshold <= 1.0) {
            anyhow::bail!("search.fuzzy_threshold must be in (0, 1]");
        }
        Ok(())
    }
}
