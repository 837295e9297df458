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

//! Chat backends used for extraction, summaries and answers
//!
//! All three run at temperature 0 so repeated ingests of the same text
//! produce the same graph as far as the backend allows.

use super::{ChatMessage, ChatResponse, LLMProvider};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client as OpenAIClient,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

const TEMPERATURE: f32 = 0.0;

/// Extraction replies for a long document fit comfortably in this
const MAX_OUTPUT_TOKENS: u32 = 2048;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Pull system turns out of the conversation
///
/// Anthropic takes the system prompt as a top-level field; multiple system
/// turns are joined with a blank line.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let (system, rest): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        messages.iter().partition(|m| m.role == "system");
    let system = (!system.is_empty()).then(|| {
        system
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    });
    (system, rest)
}

fn elapsed_ms(start: Instant) -> u32 {
    start.elapsed().as_millis().min(u32::MAX as u128) as u32
}

// OpenAI

pub struct OpenAIProvider {
    client: OpenAIClient<OpenAIConfig>,
    default_model: String,
}

impl OpenAIProvider {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Ok(Self {
            client: OpenAIClient::with_config(config),
            default_model: "gpt-4o-mini".to_string(),
        })
    }

    fn to_request_message(msg: ChatMessage) -> Option<ChatCompletionRequestMessage> {
        match msg.role.as_str() {
            "system" => ChatCompletionRequestSystemMessageArgs::default()
                .content(msg.content)
                .build()
                .ok()
                .map(ChatCompletionRequestMessage::System),
            "user" => ChatCompletionRequestUserMessageArgs::default()
                .content(msg.content)
                .build()
                .ok()
                .map(ChatCompletionRequestMessage::User),
            "assistant" => ChatCompletionRequestAssistantMessageArgs::default()
                .content(msg.content)
                .build()
                .ok()
                .map(ChatCompletionRequestMessage::Assistant),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl LLMProvider for OpenAIProvider {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model: Option<String>,
    ) -> anyhow::Result<ChatResponse> {
        let start = Instant::now();
        let model = model.unwrap_or_else(|| self.default_model.clone());

        let request = CreateChatCompletionRequestArgs::default()
            .model(&model)
            .messages(
                messages
                    .into_iter()
                    .filter_map(Self::to_request_message)
                    .collect::<Vec<_>>(),
            )
            .temperature(TEMPERATURE)
            .max_tokens(MAX_OUTPUT_TOKENS as u16)
            .build()?;

        let response = self.client.chat().create(request).await?;
        let choice = response.choices.first();

        Ok(ChatResponse {
            content: choice
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default(),
            provider: "openai".to_string(),
            model,
            response_model: Some(response.model.clone()),
            input_tokens: response.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: response.usage.as_ref().map(|u| u.completion_tokens),
            finish_reason: choice
                .and_then(|c| c.finish_reason.as_ref())
                .map(|r| format!("{:?}", r).to_lowercase()),
            duration_ms: elapsed_ms(start),
        })
    }

    fn list_models(&self) -> Vec<String> {
        vec![self.default_model.clone(), "gpt-4o".to_string()]
    }

    fn name(&self) -> &str {
        "OpenAI"
    }
}

// Anthropic

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        Self {
            role: &msg.role,
            content: &msg.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicReply {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicReply {
    /// Concatenated text blocks; tool-use and other block kinds are ignored
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect()
    }
}

pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            api_key,
            client: reqwest::Client::builder().build()?,
            default_model: "claude-3-5-haiku-20241022".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl LLMProvider for AnthropicProvider {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model: Option<String>,
    ) -> anyhow::Result<ChatResponse> {
        let start = Instant::now();
        let model = model.unwrap_or_else(|| self.default_model.clone());

        let (system, turns) = split_system(&messages);
        let request = AnthropicRequest {
            model: &model,
            max_tokens: MAX_OUTPUT_TOKENS,
            temperature: TEMPERATURE,
            system,
            messages: turns.into_iter().map(WireMessage::from).collect(),
        };

        let reply: AnthropicReply = self
            .client
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(ChatResponse {
            content: reply.text(),
            provider: "anthropic".to_string(),
            model,
            response_model: reply.model,
            input_tokens: reply.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: reply.usage.as_ref().map(|u| u.output_tokens),
            finish_reason: reply.stop_reason,
            duration_ms: elapsed_ms(start),
        })
    }

    fn list_models(&self) -> Vec<String> {
        vec![
            self.default_model.clone(),
            "claude-3-5-sonnet-20241022".to_string(),
        ]
    }

    fn name(&self) -> &str {
        "Anthropic"
    }
}

// Ollama (local)

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    message: Option<OllamaMessage>,
    model: Option<String>,
    #[serde(default)]
    done: bool,
    // Token counts are missing when the prompt was served from cache
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
    default_model: String,
}

impl OllamaProvider {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().build()?,
            default_model: "llama3.1".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl LLMProvider for OllamaProvider {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model: Option<String>,
    ) -> anyhow::Result<ChatResponse> {
        let start = Instant::now();
        let model = model.unwrap_or_else(|| self.default_model.clone());

        let request = OllamaRequest {
            model: &model,
            messages: messages.iter().map(WireMessage::from).collect(),
            stream: false,
            options: OllamaOptions {
                temperature: TEMPERATURE,
                num_predict: MAX_OUTPUT_TOKENS,
            },
        };

        let reply: OllamaReply = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(ChatResponse {
            content: reply.message.map(|m| m.content).unwrap_or_default(),
            provider: "ollama".to_string(),
            model,
            response_model: reply.model,
            input_tokens: reply.prompt_eval_count,
            output_tokens: reply.eval_count,
            finish_reason: reply.done.then(|| "stop".to_string()),
            duration_ms: elapsed_ms(start),
        })
    }

    fn list_models(&self) -> Vec<String> {
        vec![self.default_model.clone(), "mistral".to_string()]
    }

    fn name(&self) -> &str {
        "Ollama"
    }
}
