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

use crate::config::LLMConfig;
use crate::error::LlmError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

mod providers;
pub use providers::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub provider: String,               // e.g., "openai", "anthropic"
    pub model: String,                  // Requested model
    pub response_model: Option<String>, // Actual model used (from response)
    pub input_tokens: Option<u32>,      // Prompt tokens
    pub output_tokens: Option<u32>,     // Completion tokens
    pub finish_reason: Option<String>,  // stop/length/tool_calls
    pub duration_ms: u32,
}

#[async_trait::async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model: Option<String>,
    ) -> anyhow::Result<ChatResponse>;

    fn list_models(&self) -> Vec<String>;
    fn name(&self) -> &str;
}

/// Routes every backend call to one configured provider, bounded by a timeout.
///
/// A manager with no registered providers is valid: every call fails fast with
/// [`LlmError::ProviderNotFound`] and callers take their fallback path.
pub struct LLMProviderManager {
    providers: DashMap<String, Arc<dyn LLMProvider>>,
    default_provider: String,
    default_model: Option<String>,
    timeout: Duration,
}

impl LLMProviderManager {
    pub fn new(llm_config: &LLMConfig) -> anyhow::Result<Self> {
        let manager = Self::disabled(llm_config);

        // Initialize OpenAI if key present
        if let Some(key) = &llm_config.openai_api_key {
            let provider = Arc::new(OpenAIProvider::new(key.clone())?);
            manager.register("openai", provider);
            info!("Initialized OpenAI provider");
        } else {
            warn!("OPENAI_API_KEY not set, OpenAI provider disabled");
        }

        // Initialize Anthropic if key present
        if let Some(key) = &llm_config.anthropic_api_key {
            let provider = Arc::new(AnthropicProvider::new(key.clone())?);
            manager.register("anthropic", provider);
            info!("Initialized Anthropic provider");
        } else {
            warn!("ANTHROPIC_API_KEY not set, Anthropic provider disabled");
        }

        // Initialize Ollama (local, no key needed)
        if let Some(base_url) = &llm_config.ollama_base_url {
            let provider = Arc::new(OllamaProvider::new(base_url.clone())?);
            manager.register("ollama", provider);
            info!("Initialized Ollama provider");
        }

        if !manager.is_enabled() {
            warn!(
                provider = %manager.default_provider,
                "Configured LLM provider unavailable, engine runs on fallback paths only"
            );
        }

        Ok(manager)
    }

    /// A manager without providers (fallback-only engine)
    pub fn disabled(llm_config: &LLMConfig) -> Self {
        Self {
            providers: DashMap::new(),
            default_provider: llm_config.provider_id.clone(),
            default_model: llm_config.model.clone(),
            timeout: llm_config.request_timeout(),
        }
    }

    /// Register (or replace) a provider under an id
    pub fn register(&self, provider_id: impl Into<String>, provider: Arc<dyn LLMProvider>) {
        self.providers.insert(provider_id.into(), provider);
    }

    /// Whether the default provider can be called
    pub fn is_enabled(&self) -> bool {
        self.providers.contains_key(&self.default_provider)
    }

    /// Chat with the default provider and model
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<ChatResponse, LlmError> {
        self.chat_with(&self.default_provider, self.default_model.clone(), messages)
            .await
    }

    pub async fn chat_with(
        &self,
        provider_id: &str,
        model: Option<String>,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatResponse, LlmError> {
        // Clone out of the map so no shard lock is held across the await
        let provider = self
            .providers
            .get(provider_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LlmError::ProviderNotFound(provider_id.to_string()))?;

        let start = Instant::now();
        let response = tokio::time::timeout(self.timeout, provider.chat(messages, model))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| LlmError::Backend(e.to_string()))?;

        debug!(
            provider = provider_id,
            model = %response.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "LLM call completed"
        );

        Ok(response)
    }

    /// System + user prompt, returning only the reply text
    pub async fn complete(&self, system: &str, user: String) -> Result<String, LlmError> {
        let response = self
            .chat(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .await?;

        if response.content.trim().is_empty() {
            return Err(LlmError::MalformedResponse("empty reply".to_string()));
        }
        Ok(response.content)
    }
}

/// Slice the outermost `open ... close` span out of a model reply.
///
/// Models wrap JSON in prose or code fences; this strips both.
pub fn extract_json_block(response: &str, open: char, close: char) -> Option<&str> {
    let start = response.find(open)?;
    let end = response.rfind(close)?;
    (end > start).then(|| &response[start..=end])
}
